//! Per-session job queue.
//!
//! Jobs run strictly one after another so two replies never interleave on
//! the outbound path. Each job runs in its own task; a panic surfaces as a
//! `JoinError` and the runner moves on to the next job.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use murmur_core::error::{MurmurError, Result};

use crate::pipeline::{Outbound, PipelineReport, ResponsePipeline};

/// How a submitted job ended.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(PipelineReport),
    Panicked,
    /// Aborted mid-run, or dropped from the queue before it started.
    Cancelled,
}

impl JobOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Panicked => "panicked",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Called exactly once for every submitted job.
pub type ReportHook = Arc<dyn Fn(&JobOutcome) + Send + Sync>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// One finalized user turn waiting for a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineJob {
    pub session_id: String,
    pub text: String,
    /// Position of the triggering user message in the session log.
    pub turn_position: usize,
}

pub struct JobQueue {
    tx: Option<mpsc::UnboundedSender<PipelineJob>>,
    cancel: CancellationToken,
    pending: Arc<AtomicUsize>,
    runner: Option<JoinHandle<()>>,
}

impl JobQueue {
    /// Start the runner task for one session.
    pub fn start(pipeline: ResponsePipeline, outbound: Outbound) -> Self {
        Self::start_with_hook(pipeline, outbound, None)
    }

    pub fn start_with_hook(pipeline: ResponsePipeline, outbound: Outbound, hook: Option<ReportHook>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let pending = Arc::new(AtomicUsize::new(0));

        let runner = tokio::spawn(
            Runner {
                pipeline,
                outbound,
                pending: pending.clone(),
                hook,
            }
            .run(rx, cancel.clone()),
        );

        Self {
            tx: Some(tx),
            cancel,
            pending,
            runner: Some(runner),
        }
    }

    /// Enqueue a job behind any in-flight one.
    pub fn submit(&self, job: PipelineJob) -> Result<()> {
        let Some(tx) = self.tx.as_ref().filter(|_| !self.cancel.is_cancelled()) else {
            return Err(MurmurError::Session("job queue is shut down".into()));
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        tx.send(job).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            MurmurError::Session("job runner has stopped".into())
        })
    }

    /// Jobs submitted but not yet finished (including the running one).
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Cancel the in-flight job and drop everything queued behind it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop accepting jobs and wait until every queued one has run.
    pub async fn finish(mut self) {
        self.tx.take();
        if let Some(runner) = self.runner.take() {
            if let Err(e) = runner.await {
                warn!(%e, "Job runner ended abnormally");
            }
        }
    }

    /// Cancel and wait briefly for the runner to exit, aborting it otherwise.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let Some(runner) = self.runner.take() else {
            return;
        };
        let abort = runner.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, runner).await.is_err() {
            abort.abort();
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Runner {
    pipeline: ResponsePipeline,
    outbound: Outbound,
    pending: Arc<AtomicUsize>,
    hook: Option<ReportHook>,
}

impl Runner {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<PipelineJob>, cancel: CancellationToken) {
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let session_id = job.session_id.clone();
            debug!(%session_id, turn_position = job.turn_position, "Running pipeline job");
            let mut task = {
                let pipeline = self.pipeline.clone();
                let outbound = self.outbound.clone();
                tokio::spawn(async move { pipeline.run(&job, &outbound).await })
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    task.abort();
                    info!(%session_id, "Pipeline job cancelled");
                    self.finished(JobOutcome::Cancelled);
                    break;
                }
                result = &mut task => match result {
                    Ok(report) => self.finished(JobOutcome::Completed(report)),
                    Err(e) if e.is_panic() => {
                        error!(%session_id, "Pipeline job panicked");
                        self.finished(JobOutcome::Panicked);
                    }
                    Err(e) => {
                        debug!(%session_id, %e, "Pipeline job did not complete");
                        self.finished(JobOutcome::Cancelled);
                    }
                },
            }
        }

        // Account for jobs that never started
        rx.close();
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            self.finished(JobOutcome::Cancelled);
            dropped += 1;
        }
        debug!(dropped, "Job runner stopped");
    }

    fn finished(&self, outcome: JobOutcome) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        if let Some(hook) = &self.hook {
            hook(&outcome);
        }
    }
}

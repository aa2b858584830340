//! Response pipeline: LLM worker and TTS worker joined by a bounded queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use murmur_core::config::Config;
use murmur_core::conversation::{ConversationStore, Message};
use murmur_core::protocol::OutboundMessage;
use murmur_providers::{LanguageModel, TextToSpeech};

use crate::jobs::PipelineJob;

/// Ordered outbound path of one session.
pub type Outbound = mpsc::UnboundedSender<OutboundMessage>;

pub const LLM_FAILURE_MESSAGE: &str = "Language model request failed";

const DEFAULT_QUEUE_CAPACITY: usize = 32;
const DEFAULT_SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(15);

/// Summary of one pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub session_id: String,
    /// Fragments forwarded to the client and the synthesis queue.
    pub fragments: usize,
    /// `audio_chunk` envelopes sent; equals `total_chunks` of `audio_complete`.
    pub chunks_sent: u32,
    /// Trimmed full reply text (what was stored, if non-empty).
    pub response_text: String,
    pub llm_failed: bool,
    pub duration_ms: u64,
}

enum QueueItem {
    Fragment(String),
    End,
}

#[derive(Default)]
struct LlmOutcome {
    fragments: usize,
    text: String,
    failed: bool,
}

#[derive(Clone)]
pub struct ResponsePipeline {
    llm: LanguageModel,
    tts: Arc<dyn TextToSpeech>,
    store: Arc<ConversationStore>,
    queue_capacity: usize,
    synthesis_timeout: Duration,
}

impl ResponsePipeline {
    pub fn new(llm: LanguageModel, tts: Arc<dyn TextToSpeech>, store: Arc<ConversationStore>) -> Self {
        Self {
            llm,
            tts,
            store,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            synthesis_timeout: DEFAULT_SYNTHESIS_TIMEOUT,
        }
    }

    /// Apply `pipeline.*` tuning from config.
    pub fn with_config(self, config: &Config) -> Self {
        self.with_queue_capacity(config.pipeline().queue_capacity)
            .with_synthesis_timeout(config.synthesis_timeout())
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_synthesis_timeout(mut self, timeout: Duration) -> Self {
        self.synthesis_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Run one job to completion. Never fails: provider errors are logged
    /// and reflected in the envelopes and the report.
    pub async fn run(&self, job: &PipelineJob, outbound: &Outbound) -> PipelineReport {
        let start = Instant::now();
        let history = self.store.prompt_history(&job.session_id, job.turn_position);
        debug!(
            session_id = %job.session_id,
            history = history.len(),
            streaming = self.llm.is_streaming(),
            "Pipeline started"
        );

        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity);
        let (llm, chunks_sent) = tokio::join!(
            self.produce(job, &history, outbound, queue_tx),
            self.synthesize(&job.session_id, queue_rx, outbound),
        );

        let response_text = llm.text.trim().to_string();
        if response_text.is_empty() {
            debug!(session_id = %job.session_id, "Empty reply, nothing stored");
        } else {
            self.store
                .append(&job.session_id, Message::assistant(response_text.clone()));
        }

        let report = PipelineReport {
            session_id: job.session_id.clone(),
            fragments: llm.fragments,
            chunks_sent,
            response_text,
            llm_failed: llm.failed,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            session_id = %report.session_id,
            fragments = report.fragments,
            chunks = report.chunks_sent,
            llm_failed = report.llm_failed,
            duration_ms = report.duration_ms,
            "Pipeline finished"
        );
        report
    }

    /// LLM worker. Pushes `End` exactly once, whatever happens.
    async fn produce(
        &self,
        job: &PipelineJob,
        history: &[Message],
        outbound: &Outbound,
        queue: mpsc::Sender<QueueItem>,
    ) -> LlmOutcome {
        let mut outcome = LlmOutcome::default();

        match self.llm.fragments(&job.text, history).await {
            Ok(mut stream) => {
                while let Some(item) = stream.next().await {
                    let fragment = match item {
                        Ok(fragment) => fragment,
                        Err(e) => {
                            error!(session_id = %job.session_id, error = %format!("{e:#}"), "Language model stream failed");
                            outcome.failed = true;
                            break;
                        }
                    };
                    if fragment.trim().is_empty() {
                        outcome.text.push_str(&fragment);
                        continue;
                    }

                    let _ = outbound.send(OutboundMessage::llm_text(fragment.clone()));
                    if queue.send(QueueItem::Fragment(fragment.clone())).await.is_err() {
                        warn!(session_id = %job.session_id, "Synthesis queue closed early");
                    }
                    outcome.text.push_str(&fragment);
                    outcome.fragments += 1;
                }
            }
            Err(e) => {
                error!(session_id = %job.session_id, error = %format!("{e:#}"), "Language model request failed");
                outcome.failed = true;
            }
        }

        if outcome.failed {
            let _ = outbound.send(OutboundMessage::error(LLM_FAILURE_MESSAGE));
        }
        let _ = queue.send(QueueItem::End).await;
        outcome
    }

    /// TTS worker. Sends exactly one `audio_complete` after the sentinel.
    async fn synthesize(
        &self,
        session_id: &str,
        mut queue: mpsc::Receiver<QueueItem>,
        outbound: &Outbound,
    ) -> u32 {
        let mut chunks_sent: u32 = 0;

        while let Some(item) = queue.recv().await {
            let fragment = match item {
                QueueItem::Fragment(fragment) => fragment,
                QueueItem::End => break,
            };

            let audio = match tokio::time::timeout(self.synthesis_timeout, self.tts.synthesize(&fragment)).await {
                Ok(Ok(audio)) if !audio.is_empty() => audio,
                Ok(Ok(_)) => {
                    warn!(session_id, "Synthesis returned no audio, skipping fragment");
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(session_id, error = %format!("{e:#}"), "Synthesis failed, skipping fragment");
                    continue;
                }
                Err(_) => {
                    warn!(session_id, timeout_ms = self.synthesis_timeout.as_millis() as u64, "Synthesis timed out, skipping fragment");
                    continue;
                }
            };

            let chunk_index = chunks_sent + 1;
            if outbound
                .send(OutboundMessage::audio_chunk(chunk_index, &audio))
                .is_ok()
            {
                chunks_sent = chunk_index;
                debug!(session_id, chunk_index, bytes = audio.len(), "Audio chunk sent");
            }
        }

        let _ = outbound.send(OutboundMessage::audio_complete(chunks_sent));
        chunks_sent
    }
}

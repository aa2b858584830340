//! Voice connection lifecycle: credential check, audio forwarding, turn
//! handling, and fault-isolated teardown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use murmur_agent::{JobQueue, Outbound, PipelineJob, ReportHook, ResponsePipeline};
use murmur_core::conversation::{ConversationStore, Message as ChatMessage};
use murmur_core::dedup::TurnDeduplicator;
use murmur_core::protocol::{OutboundMessage, TextFrame};
use murmur_media::RecordingSink;
use murmur_providers::{SttSession, TurnEvent};

use crate::state::GatewayState;

/// How long teardown waits for a background task before aborting it.
const TASK_GRACE: Duration = Duration::from_secs(2);

/// Handle a new voice WebSocket connection.
pub async fn handle_voice_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New voice connection");

    let (mut ws_tx, mut ws_rx) = ws.split();

    // CONNECTING: every engine must have a credential
    let (stt, llm, tts) = match state.providers.ensure_complete() {
        Ok(providers) => providers,
        Err(e) => {
            warn!(conn_id = %conn_id, %e, "Rejecting voice connection");
            #[cfg(feature = "metrics")]
            crate::metrics::record_error(e.kind());
            let message = match e {
                murmur_core::error::MurmurError::Config(message) => message,
                other => other.to_string(),
            };
            if let Ok(json) = serde_json::to_string(&OutboundMessage::error(message)) {
                let _ = ws_tx.send(Message::Text(json.into())).await;
            }
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: "".into(),
                })))
                .await;
            return;
        }
    };

    let generated_id = Uuid::new_v4().to_string();
    state.register_connection(&conn_id, &generated_id).await;
    #[cfg(feature = "metrics")]
    crate::metrics::record_voice_connect();

    let session_config = state.config.session();
    let cancel = CancellationToken::new();
    let send_stop = CancellationToken::new();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<OutboundMessage>();

    let mut send_task = tokio::spawn(send_loop(
        ws_tx,
        out_rx,
        send_stop.clone(),
        cancel.clone(),
        state.config.send_poll_interval(),
        conn_id.clone(),
    ));

    // ACTIVE
    let handle = match stt.open(session_config.sample_rate).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(conn_id = %conn_id, error = %format!("{e:#}"), "Failed to open transcription session");
            #[cfg(feature = "metrics")]
            crate::metrics::record_error("provider");
            let _ = out_tx.send(OutboundMessage::error("Failed to connect to transcription service"));
            drop(out_tx);
            let _ = tokio::time::timeout(TASK_GRACE, send_task).await;
            state.remove_connection(&conn_id).await;
            #[cfg(feature = "metrics")]
            crate::metrics::record_voice_disconnect();
            return;
        }
    };
    let stt_session = handle.session;
    let _ = out_tx.send(OutboundMessage::status("Connected to transcription service"));
    info!(conn_id = %conn_id, session_id = %generated_id, stt = stt.id(), llm = llm.id(), tts = tts.id(), "Voice session active");

    let mut recording = RecordingSink::from_config(&state.config).await;

    let pipeline = ResponsePipeline::new(llm, tts, state.store.clone()).with_config(&state.config);
    let jobs = JobQueue::start_with_hook(pipeline, out_tx.clone(), report_hook());

    let (session_tx, session_rx) = watch::channel(generated_id.clone());
    let turns = TurnHandler {
        store: state.store.clone(),
        dedup: TurnDeduplicator::new(state.config.dedup_cooldown(), session_config.min_turn_chars),
        outbound: out_tx.clone(),
        session: session_rx,
        jobs,
    };
    let stt_ended = CancellationToken::new();
    let turn_task = tokio::spawn(turns.run(handle.events, cancel.clone(), stt_ended.clone()));

    // Inbound frames
    let reason = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break "session ended",
            frame = ws_rx.next() => frame,
        };
        match frame {
            Some(Ok(Message::Binary(audio))) => {
                if let Some(sink) = recording.as_mut() {
                    sink.write(&audio).await;
                }
                if stt_ended.is_cancelled() {
                    continue;
                }
                if let Err(e) = stt_session.feed(&audio).await {
                    warn!(conn_id = %conn_id, error = %format!("{e:#}"), "Failed to forward audio");
                }
            }
            Some(Ok(Message::Text(text))) => match TextFrame::parse(text.as_str()) {
                Ok(TextFrame::Eof) => break "end of stream",
                Ok(TextFrame::Session(session_id)) => {
                    state.store.ensure(&session_id);
                    state.set_connection_session(&conn_id, &session_id).await;
                    info!(conn_id = %conn_id, session_id = %session_id, "Session identified");
                    session_tx.send_replace(session_id);
                }
                Err(e) => {
                    debug!(conn_id = %conn_id, %e, "Dropping malformed frame");
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_error(e.kind());
                }
            },
            Some(Ok(Message::Close(_))) => break "client closed",
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(conn_id = %conn_id, %e, "Voice socket read error");
                break "read error";
            }
            None => break "disconnected",
        }
    };
    info!(conn_id = %conn_id, reason, "Voice connection closing");

    // CLOSING: every step runs regardless of the others
    cancel.cancel();

    await_or_abort(turn_task, "turn handler", &conn_id).await;

    if let Err(e) = stt_session.close().await {
        warn!(conn_id = %conn_id, error = %format!("{e:#}"), "Failed to close transcription session");
    }

    if let Some(sink) = recording.take() {
        sink.finish().await;
    }

    // Let queued envelopes reach the client before the socket closes
    drop(out_tx);
    if tokio::time::timeout(TASK_GRACE, &mut send_task).await.is_err() {
        send_stop.cancel();
        await_or_abort(send_task, "send loop", &conn_id).await;
    }

    let current_id = session_tx.borrow().clone();
    state.store.remove(&current_id);
    if current_id != generated_id {
        state.store.remove(&generated_id);
    }
    state.remove_connection(&conn_id).await;
    #[cfg(feature = "metrics")]
    crate::metrics::record_voice_disconnect();

    info!(conn_id = %conn_id, session_id = %current_id, "Voice connection closed");
}

/// Drain the outbound channel onto the socket until every sender is gone.
/// Each wait is bounded so `stop` is noticed promptly. A failed write ends
/// the session.
async fn send_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
    stop: CancellationToken,
    session: CancellationToken,
    poll_interval: Duration,
    conn_id: String,
) {
    loop {
        if stop.is_cancelled() {
            break;
        }
        let message = match tokio::time::timeout(poll_interval, rx.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(_) => continue,
        };
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                warn!(conn_id = %conn_id, %e, "Failed to encode outbound message");
                continue;
            }
        };
        #[cfg(feature = "metrics")]
        {
            if matches!(message, OutboundMessage::Error { .. }) {
                crate::metrics::record_error("session");
            }
        }
        if let Err(e) = ws_tx.send(Message::Text(json.into())).await {
            debug!(conn_id = %conn_id, %e, "Voice socket write failed");
            session.cancel();
            break;
        }
    }
    let _ = ws_tx.close().await;
    debug!(conn_id = %conn_id, "Send loop stopped");
}

/// Consumes transcription turn events for one connection.
struct TurnHandler {
    store: Arc<ConversationStore>,
    dedup: TurnDeduplicator,
    outbound: Outbound,
    session: watch::Receiver<String>,
    jobs: JobQueue,
}

impl TurnHandler {
    /// Runs until the session is cancelled or the transcription stream ends.
    /// In the latter case replies already scheduled still play out, then the
    /// client is told and the session is cancelled.
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TurnEvent>,
        cancel: CancellationToken,
        stt_ended: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    self.jobs.shutdown().await;
                    return;
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event, Instant::now());
        }

        stt_ended.cancel();
        warn!(queued = self.jobs.pending(), "Transcription stream ended");
        let Self { jobs, outbound, .. } = self;
        tokio::select! {
            _ = jobs.finish() => {}
            _ = cancel.cancelled() => return,
        }
        let _ = outbound.send(OutboundMessage::error("Transcription service disconnected"));
        cancel.cancel();
    }

    /// Relay one event to the client and schedule a reply for a new turn.
    /// Returns whether a job was scheduled.
    fn handle(&mut self, event: TurnEvent, now: Instant) -> bool {
        if !event.transcript.is_empty() {
            let _ = self
                .outbound
                .send(OutboundMessage::transcription(event.transcript.clone(), event.end_of_turn));
        }
        if !event.end_of_turn {
            return false;
        }
        let _ = self.outbound.send(OutboundMessage::turn_end());

        if !self.dedup.should_process(&event.transcript, event.end_of_turn, now) {
            debug!(transcript = %event.transcript, "Turn ignored");
            return false;
        }

        let text = event.transcript.trim().to_string();
        let session_id = self.session.borrow().clone();
        let turn_position = self.store.append(&session_id, ChatMessage::user(text.clone()));
        info!(session_id = %session_id, turn_position, "User turn accepted");

        match self.jobs.submit(PipelineJob {
            session_id,
            text,
            turn_position,
        }) {
            Ok(()) => {
                #[cfg(feature = "metrics")]
                crate::metrics::record_job_started();
                debug!(queued = self.jobs.pending(), "Reply scheduled");
                true
            }
            Err(e) => {
                warn!(%e, "Could not schedule reply");
                false
            }
        }
    }
}

fn report_hook() -> Option<ReportHook> {
    #[cfg(feature = "metrics")]
    {
        let hook: ReportHook = Arc::new(crate::metrics::record_job_finished);
        Some(hook)
    }
    #[cfg(not(feature = "metrics"))]
    {
        None
    }
}

async fn await_or_abort(task: JoinHandle<()>, name: &str, conn_id: &str) {
    let abort = task.abort_handle();
    match tokio::time::timeout(TASK_GRACE, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(conn_id, task = name, %e, "Task ended abnormally"),
        Err(_) => {
            warn!(conn_id, task = name, "Task did not stop in time, aborting");
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use murmur_core::conversation::Role;
    use murmur_providers::{LanguageModel, MonolithicModel, TextToSpeech, VoiceInfo};

    struct Fixed;

    #[async_trait]
    impl MonolithicModel for Fixed {
        fn id(&self) -> &str {
            "fixed"
        }

        async fn reply(&self, _prompt: &str, _history: &[ChatMessage]) -> anyhow::Result<String> {
            Ok("Sure thing.".into())
        }
    }

    struct Silent;

    #[async_trait]
    impl TextToSpeech for Silent {
        fn id(&self) -> &str {
            "silent"
        }

        async fn synthesize(&self, _text: &str) -> anyhow::Result<Vec<u8>> {
            Ok(vec![0u8; 4])
        }

        async fn synthesize_url(&self, _text: &str, _voice_id: &str) -> anyhow::Result<String> {
            anyhow::bail!("unused")
        }

        async fn list_voices(&self) -> anyhow::Result<Vec<VoiceInfo>> {
            Ok(Vec::new())
        }
    }

    fn handler() -> (TurnHandler, mpsc::UnboundedReceiver<OutboundMessage>, watch::Sender<String>) {
        let store = Arc::new(ConversationStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = ResponsePipeline::new(
            LanguageModel::Monolithic(Arc::new(Fixed)),
            Arc::new(Silent),
            store.clone(),
        );
        let jobs = JobQueue::start(pipeline, tx.clone());
        let (session_tx, session_rx) = watch::channel("s1".to_string());
        let handler = TurnHandler {
            store,
            dedup: TurnDeduplicator::default(),
            outbound: tx,
            session: session_rx,
            jobs,
        };
        (handler, rx, session_tx)
    }

    fn event(text: &str, end_of_turn: bool) -> TurnEvent {
        TurnEvent {
            transcript: text.into(),
            end_of_turn,
        }
    }

    fn drain_kinds(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            kinds.push(msg.kind());
        }
        kinds
    }

    #[tokio::test]
    async fn test_partial_turn_relays_transcription_only() {
        let (mut handler, mut rx, _session) = handler();
        handler.jobs.cancel();
        assert!(!handler.handle(event("book a", false), Instant::now()));
        assert_eq!(drain_kinds(&mut rx), vec!["transcription"]);
        assert_eq!(handler.store.len("s1"), 0);
    }

    #[tokio::test]
    async fn test_empty_final_turn_sends_turn_end_only() {
        let (mut handler, mut rx, _session) = handler();
        handler.jobs.cancel();
        assert!(!handler.handle(event("", true), Instant::now()));
        assert_eq!(drain_kinds(&mut rx), vec!["turn_end"]);
    }

    #[tokio::test]
    async fn test_duplicate_finalize_schedules_once() {
        let (mut handler, mut rx, _session) = handler();
        let t0 = Instant::now();
        assert!(handler.handle(event("book a flight", true), t0));
        assert!(!handler.handle(event("Book a flight.", true), t0 + Duration::from_millis(500)));
        assert!(!handler.handle(event("book a flight", true), t0 + Duration::from_millis(500)));
        handler.jobs.cancel();

        let kinds = drain_kinds(&mut rx);
        assert_eq!(kinds.iter().filter(|k| **k == "turn_end").count(), 3);
        let users: Vec<_> = handler
            .store
            .get("s1")
            .into_iter()
            .filter(|m| m.role == Role::User)
            .collect();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].text, "book a flight");
    }

    #[tokio::test]
    async fn test_turn_uses_announced_session() {
        let (mut handler, _rx, session) = handler();
        handler.jobs.cancel();
        session.send_replace("client-42".into());
        handler.handle(event("what is the weather", true), Instant::now());
        assert_eq!(handler.store.len("client-42"), 1);
        assert_eq!(handler.store.len("s1"), 0);
    }

    #[tokio::test]
    async fn test_transcription_end_finishes_reply_then_reports() {
        let (handler, mut rx, _session) = handler();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        events_tx.send(event("book a flight", true)).unwrap();
        drop(events_tx);

        let cancel = CancellationToken::new();
        let stt_ended = CancellationToken::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            handler.run(events_rx, cancel.clone(), stt_ended.clone()),
        )
        .await
        .unwrap();

        assert!(stt_ended.is_cancelled());
        assert!(cancel.is_cancelled());
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        let kinds: Vec<_> = messages.iter().map(|m| m.kind()).collect();
        assert!(kinds.contains(&"llm_response_text"));
        assert_eq!(kinds.iter().filter(|k| **k == "audio_complete").count(), 1);
        assert_eq!(
            messages.last(),
            Some(&OutboundMessage::error("Transcription service disconnected"))
        );
    }
}

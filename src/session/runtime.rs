//! # Session Runtime
//!
//! Drives one voice session. Each session is a single tokio task that owns its frame
//! buffer, segmenter, state and conversation context, so none of them need locking.
//!
//! ## Key Components:
//! - **SessionRuntime**: the task body; a `tokio::select!` loop over control commands,
//!   stage events from workers, inbound frames, stage deadlines and the silence timer
//! - **SessionHandle**: the cheap, cloneable-by-Arc front the supervisor keeps
//! - **SessionEvent**: what a session publishes (broadcast channel)
//! - **SessionStatus**: the latest snapshot (watch channel), readable without touching the task
//!
//! ## Frame Path:
//! inbound frame → buffer + VAD → segmenter → utterance → transcription worker →
//! dialogue worker → synthesis worker → `AudioSink`
//!
//! ## Outbound Guarantee:
//! Synthesized frames are forwarded by this task only, and only while the session is
//! Synthesizing (or draining during a graceful close) and the frame comes from the
//! synthesis worker that is currently active. After a barge-in the worker is cancelled
//! and forgotten before the session returns to listening, so nothing it produced can
//! reach the participant afterwards.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::adapters::energy::EnergyVad;
use crate::adapters::{as_adapter_failure, AdapterKind, AdapterSet, SynthesisInput};
use crate::audio::buffer::FrameBuffer;
use crate::audio::frame::{AudioFrame, UtteranceId};
use crate::audio::segmenter::{assemble_utterance, SegmentEvent, UtteranceSegmenter};
use crate::config::{DetectorFallback, DialogueFallbackPolicy, SessionConfig};
use crate::error::{SoftErrorCounts, SoftErrorKind, VoiceError, VoiceResult};
use crate::session::conversation::{ConversationContext, ConversationTurn};
use crate::session::machine::{transition, SessionState, Trigger};
use crate::session::worker::{
    spawn_dialogue, spawn_synthesis, spawn_transcription, InFlight, StageEvent, StageEventKind,
    StageSender, WorkId,
};

pub type SessionId = String;

/// Capacity of each session's event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Where synthesized audio goes. Installed by the transport, called only by the session task.
pub trait AudioSink: Send + Sync {
    /// Deliver one frame to the participant.
    ///
    /// Returning `TransportDisconnected` ends the session.
    fn emit_frame(&self, session_id: &str, frame: AudioFrame) -> VoiceResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Requested,
    SilenceTimeout,
    TransportLost,
    Error,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::Requested => "requested",
            CloseReason::SilenceTimeout => "silence_timeout",
            CloseReason::TransportLost => "transport_lost",
            CloseReason::Error => "error",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Observable session activity.
///
/// Serialized with a `type` tag so the media bridge can forward events verbatim as JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Transcript {
        utterance_id: UtteranceId,
        text: String,
        is_final: bool,
    },
    Reply {
        utterance_id: UtteranceId,
        text: String,
        fallback: bool,
    },
    TurnCompleted {
        sequence: u64,
        user_text: String,
        reply_text: String,
        response_latency_ms: Option<i64>,
    },
    BargeIn {
        utterance_id: UtteranceId,
    },
    SoftError {
        kind: SoftErrorKind,
        message: String,
    },
    SilenceTimeout {
        silent_ms: u64,
    },
    Closed {
        reason: CloseReason,
    },
}

/// Point-in-time view of a session, as returned by the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub state: SessionState,
    pub turn_count: usize,
    pub last_activity: DateTime<Utc>,
    pub soft_errors: SoftErrorCounts,
    pub unhealthy_adapters: Vec<AdapterKind>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
}

/// Messages from a session to its supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorNotice {
    SilenceTimeout { session_id: SessionId },
    Closed { session_id: SessionId },
}

enum Control {
    AttachSink(Arc<dyn AudioSink>),
    Close {
        graceful: bool,
        reason: CloseReason,
        done: oneshot::Sender<()>,
    },
}

/// The supervisor's handle on a running session.
pub struct SessionHandle {
    id: SessionId,
    config: SessionConfig,
    frames: mpsc::Sender<AudioFrame>,
    control: mpsc::UnboundedSender<Control>,
    status: watch::Receiver<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Queue an inbound frame without blocking.
    ///
    /// ## Errors:
    /// - `InboundQueueFull` when the session is not keeping up
    /// - `SessionNotFound` when the session has already stopped
    pub fn push_frame(&self, frame: AudioFrame) -> VoiceResult<()> {
        match self.frames.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(VoiceError::InboundQueueFull(self.id.clone())),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(VoiceError::SessionNotFound(self.id.clone())),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.status.borrow().state == SessionState::Closed
    }

    pub fn attach_sink(&self, sink: Arc<dyn AudioSink>) -> VoiceResult<()> {
        self.control
            .send(Control::AttachSink(sink))
            .map_err(|_| VoiceError::SessionNotFound(self.id.clone()))
    }

    /// Close the session and wait until it reaches Closed. Safe to call repeatedly.
    pub async fn close(&self, graceful: bool, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        let (done, finished) = oneshot::channel();
        if self.control.send(Control::Close { graceful, reason, done }).is_err() {
            // The task has already stopped
            return;
        }
        // An error only means the task dropped the sender while stopping
        let _ = finished.await;
    }
}

/// Start a session task and return its handle. The session begins listening immediately.
pub fn spawn_session(
    id: SessionId,
    config: SessionConfig,
    adapters: AdapterSet,
    notices: mpsc::UnboundedSender<SupervisorNotice>,
) -> SessionHandle {
    let (frames_tx, frames_rx) = mpsc::channel(config.inbound_queue_frames.max(1));
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (stage_tx, stage_rx) = mpsc::unbounded_channel();
    let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

    let now = Utc::now();
    let initial = SessionStatus {
        session_id: id.clone(),
        state: SessionState::Idle,
        turn_count: 0,
        last_activity: now,
        soft_errors: SoftErrorCounts::default(),
        unhealthy_adapters: Vec::new(),
        created_at: now,
        closed_at: None,
        close_reason: None,
    };
    let (status_tx, status_rx) = watch::channel(initial);

    let runtime = SessionRuntime {
        id: id.clone(),
        buffer: FrameBuffer::new(config.buffer_config()),
        segmenter: UtteranceSegmenter::new(config.segmenter_config()),
        context: ConversationContext::new(config.system_preamble.clone()),
        config: config.clone(),
        adapters,
        fallback_vad: EnergyVad::default(),
        sink: None,
        state: SessionState::Idle,
        turn: None,
        transcription: None,
        dialogue: None,
        synthesis: None,
        token_tx: None,
        stage_tx,
        stage_deadline: None,
        silence_since: Instant::now(),
        silence_notified: false,
        drain_deadline: None,
        close_waiters: Vec::new(),
        close_reason: None,
        vad_failing: false,
        next_work: 0,
        soft_errors: SoftErrorCounts::default(),
        unhealthy: Vec::new(),
        created_at: now,
        last_activity: now,
        closed_at: None,
        events: events_tx.clone(),
        status_tx,
        notices,
    };

    tokio::spawn(runtime.run(frames_rx, control_rx, stage_rx));

    SessionHandle {
        id,
        config,
        frames: frames_tx,
        control: control_tx,
        status: status_rx,
        events: events_tx,
    }
}

/// The turn currently being worked on.
struct TurnInProgress {
    utterance: UtteranceId,
    turn: ConversationTurn,
    /// The reply being spoken is the fallback apology, not an engine reply
    fallback: bool,
    /// The dialogue engine delivered its complete reply
    reply_complete: bool,
}

struct SessionRuntime {
    id: SessionId,
    config: SessionConfig,
    adapters: AdapterSet,
    fallback_vad: EnergyVad,
    sink: Option<Arc<dyn AudioSink>>,

    buffer: FrameBuffer,
    segmenter: UtteranceSegmenter,
    state: SessionState,
    context: ConversationContext,
    turn: Option<TurnInProgress>,

    transcription: Option<InFlight>,
    dialogue: Option<InFlight>,
    synthesis: Option<InFlight>,
    /// Feeds reply tokens into a streaming synthesis
    token_tx: Option<mpsc::UnboundedSender<String>>,
    stage_tx: StageSender,
    stage_deadline: Option<(Instant, AdapterKind)>,

    silence_since: Instant,
    silence_notified: bool,
    drain_deadline: Option<Instant>,
    close_waiters: Vec<oneshot::Sender<()>>,
    close_reason: Option<CloseReason>,
    vad_failing: bool,
    next_work: u64,

    soft_errors: SoftErrorCounts,
    unhealthy: Vec<AdapterKind>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,

    events: broadcast::Sender<SessionEvent>,
    status_tx: watch::Sender<SessionStatus>,
    notices: mpsc::UnboundedSender<SupervisorNotice>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl SessionRuntime {
    async fn run(
        mut self,
        mut frames: mpsc::Receiver<AudioFrame>,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut stage_rx: mpsc::UnboundedReceiver<StageEvent>,
    ) {
        info!(session_id = %self.id, "Session started");
        if let Err(e) = self.apply(Trigger::ParticipantConnected) {
            self.handle_error(e).await;
        }

        while self.state != SessionState::Closed {
            let stage_deadline = self.stage_deadline.map(|(at, _)| at);
            let silence_deadline = self.silence_deadline();
            let drain_deadline = self.drain_deadline;
            let accepting = self.state.is_live();

            let result = tokio::select! {
                biased;

                cmd = control.recv() => match cmd {
                    Some(cmd) => self.handle_control(cmd).await,
                    // Every handle is gone; nobody can reach this session any more
                    None => self.close(false, CloseReason::TransportLost).await,
                },
                Some(event) = stage_rx.recv() => self.handle_stage_event(event).await,
                frame = frames.recv(), if accepting => match frame {
                    Some(frame) => self.handle_frame(frame).await,
                    None => self.close(false, CloseReason::TransportLost).await,
                },
                _ = sleep_until_opt(stage_deadline) => self.handle_stage_timeout().await,
                _ = sleep_until_opt(silence_deadline) => {
                    self.handle_silence_timeout();
                    Ok(())
                }
                _ = sleep_until_opt(drain_deadline) => {
                    debug!(session_id = %self.id, "Drain timeout reached");
                    self.finish_close().await;
                    Ok(())
                }
            };

            if let Err(e) = result {
                self.handle_error(e).await;
            }
            self.publish_status();
        }

        let _ = self.notices.send(SupervisorNotice::Closed {
            session_id: self.id.clone(),
        });
        info!(
            session_id = %self.id,
            turns = self.context.len(),
            soft_errors = self.soft_errors.total(),
            "Session finished"
        );
    }

    // -------------------------------------------------------------------------
    // Bookkeeping
    // -------------------------------------------------------------------------

    fn apply(&mut self, trigger: Trigger) -> VoiceResult<()> {
        let from = self.state;
        let to = transition(from, trigger)?;
        self.state = to;
        debug!(session_id = %self.id, %from, %to, %trigger, "State transition");

        if to == SessionState::ListeningForSpeech {
            self.stage_deadline = None;
            self.silence_since = Instant::now();
            self.silence_notified = false;
        }
        self.publish(SessionEvent::StateChanged { from, to });
        self.publish_status();
        Ok(())
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id.clone(),
            state: self.state,
            turn_count: self.context.len(),
            last_activity: self.last_activity,
            soft_errors: self.soft_errors.clone(),
            unhealthy_adapters: self.unhealthy.clone(),
            created_at: self.created_at,
            closed_at: self.closed_at,
            close_reason: self.close_reason,
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.snapshot());
    }

    fn mark_unhealthy(&mut self, adapter: AdapterKind) {
        if !self.unhealthy.contains(&adapter) {
            warn!(session_id = %self.id, %adapter, "Adapter marked unhealthy");
            self.unhealthy.push(adapter);
        }
    }

    /// Count a recoverable failure and make it visible.
    fn record_soft(&mut self, err: &VoiceError) {
        let Some(kind) = err.soft_kind() else {
            debug!(session_id = %self.id, error = %err, "Ignoring non-recoverable error in soft path");
            return;
        };
        self.soft_errors.record(kind);
        if let VoiceError::CancellationTimeout { adapter, .. } = err {
            self.mark_unhealthy(*adapter);
        }
        warn!(session_id = %self.id, state = %self.state, error = %err, "Turn-level failure");
        self.publish(SessionEvent::SoftError {
            kind,
            message: err.to_string(),
        });
    }

    async fn handle_error(&mut self, err: VoiceError) {
        if err.is_fatal() {
            error!(session_id = %self.id, state = %self.state, error = %err, "Fatal session error");
            match self.state {
                SessionState::Closed => {}
                SessionState::Closing => self.finish_close().await,
                _ => {
                    if let Err(e) = self.close(false, CloseReason::Error).await {
                        error!(session_id = %self.id, error = %e, "Failed to close session");
                    }
                }
            }
        } else if err.soft_kind().is_some() {
            self.record_soft(&err);
        } else {
            debug!(session_id = %self.id, error = %err, "Ignoring error");
        }
    }

    fn next_work(&mut self) -> WorkId {
        self.next_work += 1;
        WorkId(self.next_work)
    }

    /// Cancel workers concurrently and wait for each to acknowledge.
    async fn cancel_workers(&mut self, workers: Vec<Option<InFlight>>) {
        let timeout = self.config.cancellation_timeout();
        let pending: Vec<InFlight> = workers.into_iter().flatten().collect();
        if pending.is_empty() {
            return;
        }
        let results = join_all(pending.into_iter().map(|w| w.cancel_and_wait(timeout))).await;
        for result in results {
            if let Err(e) = result {
                self.record_soft(&e);
            }
        }
    }

    fn emit(&self, frame: AudioFrame) -> VoiceResult<()> {
        match &self.sink {
            Some(sink) => sink.emit_frame(&self.id, frame).map_err(|e| {
                if matches!(e, VoiceError::TransportDisconnected(_)) {
                    e
                } else {
                    VoiceError::TransportDisconnected(e.to_string())
                }
            }),
            None => {
                debug!(session_id = %self.id, "No transport attached, dropping outbound frame");
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Inbound audio
    // -------------------------------------------------------------------------

    async fn handle_frame(&mut self, frame: AudioFrame) -> VoiceResult<()> {
        self.last_activity = Utc::now();

        let is_speech = match self.adapters.vad.classify(&frame) {
            Ok(decision) => {
                self.vad_failing = false;
                decision.is_speech
            }
            Err(e) => {
                let err = as_adapter_failure(AdapterKind::Vad, e);
                self.soft_errors.record(SoftErrorKind::DetectorFailure);
                // Report the first failure of a run; the rest only count
                if !self.vad_failing {
                    self.vad_failing = true;
                    self.mark_unhealthy(AdapterKind::Vad);
                    warn!(
                        session_id = %self.id,
                        error = %err,
                        fallback = ?self.config.detector_fallback,
                        "VAD failed, using fallback classification"
                    );
                    self.publish(SessionEvent::SoftError {
                        kind: SoftErrorKind::DetectorFailure,
                        message: err.to_string(),
                    });
                }
                match self.config.detector_fallback {
                    DetectorFallback::Energy => self.fallback_vad.decide(&frame).is_speech,
                    DetectorFallback::Silence => false,
                }
            }
        };

        let overflow = match self.buffer.push(frame) {
            Ok(()) => false,
            Err(e) => {
                self.record_soft(&e);
                true
            }
        };

        let synthesizing = self.state == SessionState::Synthesizing;
        for event in self.segmenter.observe(is_speech, synthesizing) {
            self.handle_segment(event).await?;
        }
        if overflow {
            if let Some(event) = self.segmenter.force_end() {
                self.handle_segment(event).await?;
            }
        }
        Ok(())
    }

    async fn handle_segment(&mut self, event: SegmentEvent) -> VoiceResult<()> {
        match event {
            SegmentEvent::UtteranceStart(id) => {
                self.buffer.open();
                self.silence_since = Instant::now();
                debug!(session_id = %self.id, utterance_id = %id, state = %self.state, "Utterance started");
                Ok(())
            }
            SegmentEvent::SpeechResumed => {
                if self.state == SessionState::Synthesizing {
                    self.barge_in().await
                } else {
                    Ok(())
                }
            }
            SegmentEvent::UtteranceEnd {
                id,
                trailing_silence,
                speech_frames,
            } => self.on_utterance_end(id, trailing_silence, speech_frames),
        }
    }

    fn on_utterance_end(
        &mut self,
        id: UtteranceId,
        trailing_silence: usize,
        speech_frames: usize,
    ) -> VoiceResult<()> {
        let frames = self.buffer.flush();
        if self.state != SessionState::ListeningForSpeech {
            debug!(
                session_id = %self.id,
                utterance_id = %id,
                state = %self.state,
                "Discarding utterance that ended while the session was busy"
            );
            return Ok(());
        }

        let Some(utterance) = assemble_utterance(
            id,
            frames,
            trailing_silence,
            speech_frames,
            self.config.min_utterance_ms,
        ) else {
            return Ok(());
        };

        info!(
            session_id = %self.id,
            utterance_id = %id,
            duration_ms = utterance.duration_ms(),
            speech_ms = utterance.speech_duration_ms(),
            "Utterance complete, transcribing"
        );
        self.apply(Trigger::UtteranceEnded)?;
        self.turn = Some(TurnInProgress {
            utterance: id,
            turn: ConversationTurn::new(self.context.next_sequence(), ""),
            fallback: false,
            reply_complete: false,
        });

        let work = self.next_work();
        self.transcription = Some(spawn_transcription(
            self.adapters.transcriber.clone(),
            utterance,
            work,
            self.stage_tx.clone(),
        ));
        self.stage_deadline = Some((
            Instant::now() + self.config.transcription_timeout(),
            AdapterKind::Transcriber,
        ));
        Ok(())
    }

    /// The participant started speaking over the reply.
    async fn barge_in(&mut self) -> VoiceResult<()> {
        let utterance = self.turn.as_ref().map(|t| t.utterance);
        info!(session_id = %self.id, interrupted = ?utterance, "Barge-in, cancelling reply");

        self.apply(Trigger::SpeechResumed)?;
        if let Some(utterance_id) = utterance {
            self.publish(SessionEvent::BargeIn { utterance_id });
        }

        self.stage_deadline = None;
        self.token_tx = None;
        let workers = vec![self.synthesis.take(), self.dialogue.take()];
        self.cancel_workers(workers).await;
        // The partial reply is discarded; nothing is appended
        self.turn = None;

        self.apply(Trigger::CancellationAcknowledged)
    }

    // -------------------------------------------------------------------------
    // Stage events
    // -------------------------------------------------------------------------

    async fn handle_stage_event(&mut self, event: StageEvent) -> VoiceResult<()> {
        let StageEvent { utterance, work, kind } = event;

        let active = match &kind {
            StageEventKind::PartialTranscript(_)
            | StageEventKind::FinalTranscript(_)
            | StageEventKind::TranscriptionFailed(_) => self.transcription.as_ref(),
            StageEventKind::ReplyToken(_)
            | StageEventKind::ReplyFinished(_)
            | StageEventKind::DialogueFailed(_) => self.dialogue.as_ref(),
            StageEventKind::Audio(_)
            | StageEventKind::SynthesisComplete
            | StageEventKind::SynthesisFailed(_) => self.synthesis.as_ref(),
        };
        if active.map(|w| w.work) != Some(work) {
            debug!(session_id = %self.id, %work, utterance_id = %utterance, "Dropping stale stage event");
            return Ok(());
        }

        match kind {
            StageEventKind::PartialTranscript(text) => {
                self.publish(SessionEvent::Transcript {
                    utterance_id: utterance,
                    text,
                    is_final: false,
                });
                Ok(())
            }
            StageEventKind::FinalTranscript(text) => self.on_final_transcript(utterance, text),
            StageEventKind::TranscriptionFailed(err) => {
                self.transcription = None;
                self.turn = None;
                self.record_soft(&err);
                self.apply(Trigger::RecognitionFailed)
            }
            StageEventKind::ReplyToken(token) => self.on_reply_token(utterance, token),
            StageEventKind::ReplyFinished(text) => self.on_reply_finished(utterance, text).await,
            StageEventKind::DialogueFailed(err) => {
                self.dialogue = None;
                self.on_dialogue_failure(err).await
            }
            StageEventKind::Audio(frame) => self.on_audio(frame),
            StageEventKind::SynthesisComplete => self.on_synthesis_complete().await,
            StageEventKind::SynthesisFailed(err) => {
                self.synthesis = None;
                self.on_synthesis_failure(err).await
            }
        }
    }

    fn on_final_transcript(&mut self, utterance: UtteranceId, text: String) -> VoiceResult<()> {
        self.transcription = None;
        self.stage_deadline = None;
        self.publish(SessionEvent::Transcript {
            utterance_id: utterance,
            text: text.clone(),
            is_final: true,
        });

        let text = text.trim().to_string();
        if text.is_empty() {
            debug!(session_id = %self.id, utterance_id = %utterance, "Empty transcript, nothing to answer");
            self.turn = None;
            return self.apply(Trigger::TranscriptEmpty);
        }

        info!(session_id = %self.id, utterance_id = %utterance, transcript = %text, "Transcript ready");
        if let Some(progress) = self.turn.as_mut() {
            progress.turn.user_text = text.clone();
            progress.turn.transcript_ready = Some(Utc::now());
        }
        self.apply(Trigger::TranscriptReady)?;

        let work = self.next_work();
        self.dialogue = Some(spawn_dialogue(
            self.adapters.dialogue.clone(),
            self.context.clone(),
            text,
            utterance,
            work,
            self.config.stream_reply,
            self.stage_tx.clone(),
        ));
        self.stage_deadline = Some((
            Instant::now() + self.config.dialogue_timeout(),
            AdapterKind::DialogueEngine,
        ));
        Ok(())
    }

    fn start_synthesis(&mut self, utterance: UtteranceId, input: SynthesisInput) {
        let work = self.next_work();
        self.synthesis = Some(spawn_synthesis(
            self.adapters.synthesizer.clone(),
            input,
            utterance,
            work,
            self.config.realtime_playout,
            self.stage_tx.clone(),
        ));
        self.stage_deadline = Some((
            Instant::now() + self.config.synthesis_timeout(),
            AdapterKind::Synthesizer,
        ));
    }

    fn mark_reply_ready(&mut self) {
        if let Some(progress) = self.turn.as_mut() {
            progress.turn.reply_ready.get_or_insert_with(Utc::now);
        }
    }

    fn on_reply_token(&mut self, utterance: UtteranceId, token: String) -> VoiceResult<()> {
        if self.state == SessionState::AwaitingReply {
            // First token: start speaking while the rest of the reply is generated
            let (tx, rx) = mpsc::unbounded_channel();
            self.token_tx = Some(tx);
            self.mark_reply_ready();
            self.apply(Trigger::ReplyReady)?;
            self.start_synthesis(
                utterance,
                SynthesisInput::Tokens(UnboundedReceiverStream::new(rx).boxed()),
            );
        }

        if let Some(tx) = &self.token_tx {
            let _ = tx.send(token.clone());
        }
        if let Some(progress) = self.turn.as_mut() {
            progress.turn.reply_text.push_str(&token);
        }
        Ok(())
    }

    async fn on_reply_finished(&mut self, utterance: UtteranceId, text: String) -> VoiceResult<()> {
        self.dialogue = None;
        if text.trim().is_empty() {
            return self
                .on_dialogue_failure(VoiceError::DialogueFailure("empty reply".to_string()))
                .await;
        }

        self.mark_reply_ready();
        if let Some(progress) = self.turn.as_mut() {
            progress.turn.reply_text = text.clone();
            progress.reply_complete = true;
        }
        self.publish(SessionEvent::Reply {
            utterance_id: utterance,
            text: text.clone(),
            fallback: false,
        });

        match self.state {
            SessionState::AwaitingReply => {
                self.apply(Trigger::ReplyReady)?;
                self.start_synthesis(utterance, SynthesisInput::Text(text));
            }
            // Streaming: closing the token channel lets the synthesizer finish
            SessionState::Synthesizing => self.token_tx = None,
            _ => {}
        }
        Ok(())
    }

    async fn on_dialogue_failure(&mut self, err: VoiceError) -> VoiceResult<()> {
        self.record_soft(&err);
        self.token_tx = None;

        match self.state {
            SessionState::AwaitingReply => {
                let utterance = self.turn.as_ref().map(|t| t.utterance);
                match (self.config.dialogue_fallback_policy, utterance) {
                    (DialogueFallbackPolicy::Apology, Some(utterance)) => {
                        let text = self.config.fallback_reply_text.clone();
                        if let Some(progress) = self.turn.as_mut() {
                            progress.fallback = true;
                        }
                        self.publish(SessionEvent::Reply {
                            utterance_id: utterance,
                            text: text.clone(),
                            fallback: true,
                        });
                        self.apply(Trigger::DialogueFailed { fallback: true })?;
                        self.start_synthesis(utterance, SynthesisInput::Text(text));
                        Ok(())
                    }
                    _ => {
                        self.turn = None;
                        self.apply(Trigger::DialogueFailed { fallback: false })
                    }
                }
            }
            SessionState::Synthesizing => {
                // The reply broke off mid-stream; stop speaking the partial reply
                let workers = vec![self.synthesis.take()];
                self.cancel_workers(workers).await;
                self.turn = None;
                self.apply(Trigger::DialogueFailed { fallback: false })
            }
            _ => Ok(()),
        }
    }

    fn on_audio(&mut self, frame: AudioFrame) -> VoiceResult<()> {
        match self.state {
            SessionState::Synthesizing => {
                self.stage_deadline = Some((
                    Instant::now() + self.config.synthesis_timeout(),
                    AdapterKind::Synthesizer,
                ));
            }
            // Draining the last reply during a graceful close
            SessionState::Closing => {}
            _ => return Ok(()),
        }

        if let Some(progress) = self.turn.as_mut() {
            progress.turn.synthesis_start.get_or_insert_with(Utc::now);
        }
        self.emit(frame)
    }

    async fn on_synthesis_complete(&mut self) -> VoiceResult<()> {
        self.synthesis = None;
        self.stage_deadline = None;

        if self.state == SessionState::Closing {
            self.finish_close().await;
            return Ok(());
        }

        // The synthesizer stopped consuming before the reply was complete
        if self.dialogue.is_some() {
            let workers = vec![self.dialogue.take()];
            self.cancel_workers(workers).await;
            if let Some(progress) = self.turn.as_mut() {
                progress.reply_complete = false;
            }
        }
        self.token_tx = None;

        if let Some(mut progress) = self.turn.take() {
            if !progress.fallback && progress.reply_complete {
                progress.turn.synthesis_end = Some(Utc::now());
                let turn = progress.turn;
                let event = SessionEvent::TurnCompleted {
                    sequence: turn.sequence,
                    user_text: turn.user_text.clone(),
                    reply_text: turn.reply_text.clone(),
                    response_latency_ms: turn.response_latency_ms(),
                };
                info!(
                    session_id = %self.id,
                    sequence = turn.sequence,
                    response_latency_ms = ?turn.response_latency_ms(),
                    "Turn completed"
                );
                self.context.append(turn)?;
                self.publish(event);
            }
        }

        self.apply(Trigger::SynthesisComplete)
    }

    async fn on_synthesis_failure(&mut self, err: VoiceError) -> VoiceResult<()> {
        self.stage_deadline = None;
        self.record_soft(&err);

        if self.state == SessionState::Closing {
            self.finish_close().await;
            return Ok(());
        }

        let workers = vec![self.dialogue.take()];
        self.cancel_workers(workers).await;
        self.token_tx = None;
        self.turn = None;
        self.apply(Trigger::SynthesisFailed)
    }

    async fn handle_stage_timeout(&mut self) -> VoiceResult<()> {
        let Some((_, adapter)) = self.stage_deadline.take() else {
            return Ok(());
        };

        match (adapter, self.state) {
            (AdapterKind::Transcriber, SessionState::Transcribing) => {
                let workers = vec![self.transcription.take()];
                self.cancel_workers(workers).await;
                self.turn = None;
                self.record_soft(&VoiceError::RecognitionFailure(format!(
                    "no final transcript within {}ms",
                    self.config.transcription_timeout_ms
                )));
                self.apply(Trigger::RecognitionFailed)
            }
            (AdapterKind::DialogueEngine, SessionState::AwaitingReply) => {
                let workers = vec![self.dialogue.take()];
                self.cancel_workers(workers).await;
                self.on_dialogue_failure(VoiceError::DialogueFailure(format!(
                    "no reply within {}ms",
                    self.config.dialogue_timeout_ms
                )))
                .await
            }
            (AdapterKind::Synthesizer, SessionState::Synthesizing) => {
                let workers = vec![self.synthesis.take()];
                self.cancel_workers(workers).await;
                self.on_synthesis_failure(VoiceError::SynthesisFailure(format!(
                    "no audio for {}ms",
                    self.config.synthesis_timeout_ms
                )))
                .await
            }
            (adapter, state) => {
                debug!(session_id = %self.id, %adapter, %state, "Ignoring deadline for a stage no longer running");
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Silence and close
    // -------------------------------------------------------------------------

    fn silence_deadline(&self) -> Option<Instant> {
        let armed = self.state == SessionState::ListeningForSpeech
            && !self.silence_notified
            && !self.segmenter.in_utterance()
            && self.config.silence_timeout_ms > 0;
        armed.then(|| self.silence_since + self.config.silence_timeout())
    }

    fn handle_silence_timeout(&mut self) {
        self.silence_notified = true;
        let silent_ms = u64::try_from(self.silence_since.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(session_id = %self.id, silent_ms, "Silence timeout");
        self.publish(SessionEvent::SilenceTimeout { silent_ms });
        let _ = self.notices.send(SupervisorNotice::SilenceTimeout {
            session_id: self.id.clone(),
        });
    }

    async fn handle_control(&mut self, cmd: Control) -> VoiceResult<()> {
        match cmd {
            Control::AttachSink(sink) => {
                info!(session_id = %self.id, "Transport attached");
                self.sink = Some(sink);
                Ok(())
            }
            Control::Close { graceful, reason, done } => {
                self.close_waiters.push(done);
                self.close(graceful, reason).await
            }
        }
    }

    /// Start closing. A graceful close lets an in-flight reply finish playing (bounded
    /// by the drain timeout); an abrupt one cancels everything at once.
    async fn close(&mut self, graceful: bool, reason: CloseReason) -> VoiceResult<()> {
        match self.state {
            SessionState::Closed => return Ok(()),
            SessionState::Closing => {
                if !graceful {
                    self.finish_close().await;
                }
                return Ok(());
            }
            _ => {}
        }

        info!(session_id = %self.id, %reason, graceful, state = %self.state, "Closing session");
        self.close_reason = Some(reason);
        self.apply(Trigger::CloseRequested)?;
        self.stage_deadline = None;

        // Speech in progress will never be answered
        self.segmenter.reset();
        self.buffer.clear();
        let workers = vec![self.transcription.take(), self.dialogue.take()];
        self.cancel_workers(workers).await;
        self.token_tx = None;

        let replying = self.synthesis.is_some() && self.turn.is_some();
        if graceful && replying {
            debug!(session_id = %self.id, drain_timeout_ms = self.config.drain_timeout_ms, "Draining reply before close");
            self.drain_deadline = Some(Instant::now() + self.config.drain_timeout());
        } else {
            self.finish_close().await;
        }
        Ok(())
    }

    async fn finish_close(&mut self) {
        self.drain_deadline = None;
        self.stage_deadline = None;
        let workers = vec![
            self.synthesis.take(),
            self.dialogue.take(),
            self.transcription.take(),
        ];
        self.cancel_workers(workers).await;
        self.token_tx = None;
        self.turn = None;

        if let Err(e) = self.apply(Trigger::CloseCompleted) {
            error!(session_id = %self.id, error = %e, "Forcing session closed");
            self.state = SessionState::Closed;
        }
        self.closed_at = Some(Utc::now());
        let reason = self.close_reason.unwrap_or(CloseReason::Requested);
        self.publish(SessionEvent::Closed { reason });
        self.publish_status();

        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

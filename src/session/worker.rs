//! # Stage Workers
//!
//! Adapter calls never run on the session task. Each stage of a turn (transcription,
//! dialogue, synthesis) runs in its own spawned worker that reports back to the session
//! over the stage channel. The session keeps processing inbound frames meanwhile, which
//! is what makes barge-in detection possible during a reply.
//!
//! ## Tagging:
//! Every event carries the utterance it belongs to and the `WorkId` of the worker that
//! produced it. The session only acts on events from workers it still considers active,
//! so output from a cancelled or timed-out worker is dropped even if it was already queued.
//!
//! ## Cancellation:
//! Workers hand the session's `CancellationToken` to the adapter and stop forwarding output
//! once it fires. A worker is acknowledged as stopped when its task finishes; if that takes
//! longer than the cancellation timeout the task is aborted and the adapter is reported.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapters::{
    as_adapter_failure, AdapterKind, DialogueEngine, ReplyChunk, SynthesisInput, Synthesizer,
    Transcriber,
};
use crate::audio::frame::{AudioFrame, Utterance, UtteranceId};
use crate::error::{VoiceError, VoiceResult};
use crate::session::conversation::ConversationContext;

/// Identifies one spawned worker within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkId(pub u64);

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

#[derive(Debug)]
pub struct StageEvent {
    pub utterance: UtteranceId,
    pub work: WorkId,
    pub kind: StageEventKind,
}

#[derive(Debug)]
pub enum StageEventKind {
    PartialTranscript(String),
    FinalTranscript(String),
    TranscriptionFailed(VoiceError),
    /// One reply token, only sent when the reply is streamed into synthesis
    ReplyToken(String),
    /// The complete reply text
    ReplyFinished(String),
    DialogueFailed(VoiceError),
    Audio(AudioFrame),
    SynthesisComplete,
    SynthesisFailed(VoiceError),
}

pub type StageSender = mpsc::UnboundedSender<StageEvent>;

/// A running worker as seen by the session.
pub struct InFlight {
    pub work: WorkId,
    pub utterance: UtteranceId,
    pub kind: AdapterKind,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl InFlight {
    /// Cancel the worker and wait for it to stop.
    ///
    /// ## Returns:
    /// - **Ok(())**: the worker finished within `timeout`
    /// - **Err(CancellationTimeout)**: it did not; the task has been aborted
    pub async fn cancel_and_wait(mut self, timeout: Duration) -> VoiceResult<()> {
        self.cancel.cancel();
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(_) => {
                debug!(work = %self.work, adapter = %self.kind, "Worker acknowledged cancellation");
                Ok(())
            }
            Err(_) => {
                self.handle.abort();
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    work = %self.work,
                    adapter = %self.kind,
                    timeout_ms,
                    "Worker ignored cancellation, aborting"
                );
                Err(VoiceError::CancellationTimeout {
                    adapter: self.kind,
                    timeout_ms,
                })
            }
        }
    }
}

fn send(tx: &StageSender, utterance: UtteranceId, work: WorkId, kind: StageEventKind) {
    // The session may already be gone; nothing left to report to
    let _ = tx.send(StageEvent { utterance, work, kind });
}

/// Spawn a transcription worker for `utterance`.
pub fn spawn_transcription(
    transcriber: Arc<dyn Transcriber>,
    utterance: Utterance,
    work: WorkId,
    tx: StageSender,
) -> InFlight {
    let cancel = CancellationToken::new();
    let utterance_id = utterance.id;
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
        let failed = |e: VoiceError| StageEventKind::TranscriptionFailed(as_adapter_failure(AdapterKind::Transcriber, e));

        let mut stream = match transcriber.transcribe(utterance, token.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                if !token.is_cancelled() {
                    send(&tx, utterance_id, work, failed(e));
                }
                return;
            }
        };

        let mut last_partial: Option<String> = None;
        while let Some(item) = stream.next().await {
            if token.is_cancelled() {
                return;
            }
            match item {
                Ok(transcript) if transcript.utterance_id != utterance_id => {
                    debug!(
                        expected = %utterance_id,
                        got = %transcript.utterance_id,
                        "Discarding transcript for another utterance"
                    );
                }
                Ok(transcript) if transcript.is_final => {
                    send(&tx, utterance_id, work, StageEventKind::FinalTranscript(transcript.text));
                    return;
                }
                Ok(transcript) => {
                    last_partial = Some(transcript.text.clone());
                    send(&tx, utterance_id, work, StageEventKind::PartialTranscript(transcript.text));
                }
                Err(e) => {
                    send(&tx, utterance_id, work, failed(e));
                    return;
                }
            }
        }

        // Stream ended without a final result: the last partial is the best we have
        if !token.is_cancelled() {
            let text = last_partial.unwrap_or_default();
            send(&tx, utterance_id, work, StageEventKind::FinalTranscript(text));
        }
    });

    InFlight {
        work,
        utterance: utterance_id,
        kind: AdapterKind::Transcriber,
        cancel,
        handle,
    }
}

/// Spawn a dialogue worker.
///
/// With `stream_tokens` every token is forwarded as it arrives; the complete text is
/// always reported at the end with `ReplyFinished`.
pub fn spawn_dialogue(
    engine: Arc<dyn DialogueEngine>,
    context: ConversationContext,
    user_text: String,
    utterance: UtteranceId,
    work: WorkId,
    stream_tokens: bool,
    tx: StageSender,
) -> InFlight {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
        let failed = |e: VoiceError| StageEventKind::DialogueFailed(as_adapter_failure(AdapterKind::DialogueEngine, e));

        let mut stream = match engine.respond(context, user_text, token.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                if !token.is_cancelled() {
                    send(&tx, utterance, work, failed(e));
                }
                return;
            }
        };

        let mut reply = String::new();
        while let Some(item) = stream.next().await {
            if token.is_cancelled() {
                return;
            }
            match item {
                Ok(ReplyChunk::Token(text)) => {
                    reply.push_str(&text);
                    if stream_tokens {
                        send(&tx, utterance, work, StageEventKind::ReplyToken(text));
                    }
                }
                Ok(ReplyChunk::EndOfReply) => break,
                Err(e) => {
                    send(&tx, utterance, work, failed(e));
                    return;
                }
            }
        }

        if !token.is_cancelled() {
            send(&tx, utterance, work, StageEventKind::ReplyFinished(reply));
        }
    });

    InFlight {
        work,
        utterance,
        kind: AdapterKind::DialogueEngine,
        cancel,
        handle,
    }
}

/// Spawn a synthesis worker.
///
/// With `realtime` the worker releases each frame when its playback time comes, so the
/// session sees `SynthesisComplete` roughly when the participant hears the end.
pub fn spawn_synthesis(
    synthesizer: Arc<dyn Synthesizer>,
    input: SynthesisInput,
    utterance: UtteranceId,
    work: WorkId,
    realtime: bool,
    tx: StageSender,
) -> InFlight {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
        let failed = |e: VoiceError| StageEventKind::SynthesisFailed(as_adapter_failure(AdapterKind::Synthesizer, e));

        let mut stream = match synthesizer.synthesize(input, token.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                if !token.is_cancelled() {
                    send(&tx, utterance, work, failed(e));
                }
                return;
            }
        };

        let started = Instant::now();
        let mut played_ms: u64 = 0;
        while let Some(item) = stream.next().await {
            if token.is_cancelled() {
                return;
            }
            match item {
                Ok(frame) => {
                    if realtime {
                        let due = started + Duration::from_millis(played_ms);
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep_until(due) => {}
                        }
                    }
                    played_ms += frame.duration_ms();
                    send(&tx, utterance, work, StageEventKind::Audio(frame));
                }
                Err(e) => {
                    send(&tx, utterance, work, failed(e));
                    return;
                }
            }
        }

        if !token.is_cancelled() {
            send(&tx, utterance, work, StageEventKind::SynthesisComplete);
        }
    });

    InFlight {
        work,
        utterance,
        kind: AdapterKind::Synthesizer,
        cancel,
        handle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::{ScriptedDialogue, ScriptedSynthesizer, ScriptedTranscriber};

    fn utterance() -> Utterance {
        Utterance::new(UtteranceId(7), vec![AudioFrame::new(vec![0; 480], 16000, 0, 0)])
    }

    #[tokio::test]
    async fn test_transcription_reports_final() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transcriber = Arc::new(ScriptedTranscriber::new(vec!["hello".to_string()]));
        let _worker = spawn_transcription(transcriber, utterance(), WorkId(1), tx);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.utterance, UtteranceId(7));
        assert_eq!(event.work, WorkId(1));
        assert!(matches!(event.kind, StageEventKind::FinalTranscript(ref t) if t == "hello"));
    }

    #[tokio::test]
    async fn test_dialogue_streams_tokens_then_finishes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = Arc::new(ScriptedDialogue::replying("Sure thing"));
        let _worker = spawn_dialogue(
            engine,
            ConversationContext::new(""),
            "hi".into(),
            UtteranceId(1),
            WorkId(2),
            true,
            tx,
        );

        let mut tokens = Vec::new();
        loop {
            match rx.recv().await.unwrap().kind {
                StageEventKind::ReplyToken(t) => tokens.push(t),
                StageEventKind::ReplyFinished(text) => {
                    assert_eq!(text, "Sure thing");
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(tokens.concat(), "Sure thing");
    }

    #[tokio::test]
    async fn test_cancelled_synthesis_stops_quickly() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let synth = Arc::new(ScriptedSynthesizer::new(100, Duration::from_millis(10)));
        let worker = spawn_synthesis(
            synth.clone(),
            SynthesisInput::Text("long reply".into()),
            UtteranceId(1),
            WorkId(3),
            false,
            tx,
        );

        assert!(matches!(rx.recv().await.unwrap().kind, StageEventKind::Audio(_)));
        worker.cancel_and_wait(Duration::from_millis(200)).await.unwrap();
        assert_eq!(synth.cancelled_calls(), 1);

        // Nothing else may be sent after the worker stopped, apart from frames already queued
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event.kind, StageEventKind::Audio(_)));
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stubborn_worker_times_out() {
        let (tx, _rx) = mpsc::unbounded_channel();
        // Each frame takes longer to produce than the cancellation timeout allows
        let synth = Arc::new(ScriptedSynthesizer::new(100, Duration::from_millis(300)).ignoring_cancel());
        let worker = spawn_synthesis(
            synth,
            SynthesisInput::Text("reply".into()),
            UtteranceId(1),
            WorkId(4),
            false,
            tx,
        );

        let result = worker.cancel_and_wait(Duration::from_millis(20)).await;
        assert!(matches!(
            result,
            Err(VoiceError::CancellationTimeout {
                adapter: AdapterKind::Synthesizer,
                ..
            })
        ));
    }
}

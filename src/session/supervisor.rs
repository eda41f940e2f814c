//! # Session Supervisor
//!
//! Owns the table of live sessions and is the only way the outside world reaches one.
//! Creating, ending and querying sessions, routing inbound frames and enforcing the
//! concurrency limit all go through here.
//!
//! ## Thread Safety:
//! The table is a `RwLock<HashMap>` of session handles. Locks are held only long enough
//! to clone an `Arc<SessionHandle>` out; all waiting (close, drain) happens after the
//! lock is released. Session internals are never touched: status comes from each
//! session's watch channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::AdapterSet;
use crate::audio::frame::AudioFrame;
use crate::config::SessionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::session::runtime::{
    spawn_session, AudioSink, CloseReason, SessionEvent, SessionHandle, SessionId, SessionStatus,
    SupervisorNotice,
};

pub struct SessionSupervisor {
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
    max_concurrent_sessions: AtomicUsize,
    notices: mpsc::UnboundedSender<SupervisorNotice>,
}

impl SessionSupervisor {
    /// Create a supervisor and start its notice loop on the current runtime.
    pub fn new(max_concurrent_sessions: usize) -> Arc<Self> {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions: AtomicUsize::new(max_concurrent_sessions),
            notices,
        });
        tokio::spawn(Self::notice_loop(Arc::downgrade(&supervisor), notice_rx));
        supervisor
    }

    async fn notice_loop(
        supervisor: Weak<Self>,
        mut notices: mpsc::UnboundedReceiver<SupervisorNotice>,
    ) {
        while let Some(notice) = notices.recv().await {
            let Some(supervisor) = supervisor.upgrade() else {
                break;
            };
            match notice {
                SupervisorNotice::SilenceTimeout { session_id } => {
                    let Some(handle) = supervisor.get(&session_id) else {
                        continue;
                    };
                    if handle.config().end_session_on_silence {
                        info!(session_id = %session_id, "Ending session after prolonged silence");
                        tokio::spawn(async move {
                            handle.close(true, CloseReason::SilenceTimeout).await;
                        });
                    }
                }
                SupervisorNotice::Closed { session_id } => {
                    debug!(session_id = %session_id, "Session task exited");
                }
            }
        }
    }

    fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(session_id).cloned()
    }

    fn handle(&self, session_id: &str) -> VoiceResult<Arc<SessionHandle>> {
        self.get(session_id)
            .ok_or_else(|| VoiceError::SessionNotFound(session_id.to_string()))
    }

    /// Start a new session; it begins listening at once.
    ///
    /// ## Returns:
    /// - **Ok(session_id)**: a fresh UUID
    /// - **Err(SessionLimitReached)**: too many sessions are still open
    /// - **Err(Config)**: the session configuration is invalid
    pub fn create_session(&self, config: SessionConfig, adapters: AdapterSet) -> VoiceResult<SessionId> {
        config
            .validate()
            .map_err(|e| VoiceError::Config(e.to_string()))?;

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        let limit = self.max_concurrent_sessions();
        let open = sessions.values().filter(|h| !h.is_closed()).count();
        if open >= limit {
            warn!(open, limit, "Rejecting session, concurrency limit reached");
            return Err(VoiceError::SessionLimitReached(limit));
        }

        let session_id = Uuid::new_v4().to_string();
        let handle = spawn_session(session_id.clone(), config, adapters, self.notices.clone());
        sessions.insert(session_id.clone(), Arc::new(handle));

        info!(session_id = %session_id, open = open + 1, "Session created");
        Ok(session_id)
    }

    /// Route one inbound frame to its session without blocking.
    pub fn on_frame(&self, session_id: &str, frame: AudioFrame) -> VoiceResult<()> {
        self.handle(session_id)?.push_frame(frame)
    }

    pub fn attach_sink(&self, session_id: &str, sink: Arc<dyn AudioSink>) -> VoiceResult<()> {
        self.handle(session_id)?.attach_sink(sink)
    }

    pub fn subscribe(&self, session_id: &str) -> VoiceResult<broadcast::Receiver<SessionEvent>> {
        Ok(self.handle(session_id)?.subscribe())
    }

    /// Graceful end: a reply already being spoken may finish, bounded by the drain
    /// timeout. Ending a closed session again is a no-op.
    pub async fn end_session(&self, session_id: &str) -> VoiceResult<()> {
        let handle = self.handle(session_id)?;
        handle.close(true, CloseReason::Requested).await;
        Ok(())
    }

    /// Abrupt end: the participant is gone, everything in flight is cancelled.
    pub async fn transport_disconnected(&self, session_id: &str) -> VoiceResult<()> {
        let handle = self.handle(session_id)?;
        handle.close(false, CloseReason::TransportLost).await;
        Ok(())
    }

    pub fn session_status(&self, session_id: &str) -> VoiceResult<SessionStatus> {
        Ok(self.handle(session_id)?.status())
    }

    /// The configuration a session was created with.
    pub fn session_config(&self, session_id: &str) -> VoiceResult<SessionConfig> {
        Ok(self.handle(session_id)?.config().clone())
    }

    /// Status of every known session, oldest first. Includes closed sessions not yet reaped.
    pub fn list_sessions(&self) -> Vec<SessionStatus> {
        let handles: Vec<Arc<SessionHandle>> = {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            sessions.values().cloned().collect()
        };
        let mut statuses: Vec<SessionStatus> = handles.iter().map(|h| h.status()).collect();
        statuses.sort_by_key(|s| s.created_at);
        statuses
    }

    /// Drop closed sessions that closed more than `max_age` ago.
    pub fn reap_closed(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let now = Utc::now();

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, handle| match handle.status().closed_at {
            Some(closed_at) => now.signed_duration_since(closed_at) <= max_age,
            None => true,
        });
        let removed = before - sessions.len();

        if removed > 0 {
            info!(removed, remaining = sessions.len(), "Reaped closed sessions");
        }
        removed
    }

    /// Number of sessions that are not closed.
    pub fn active_count(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.values().filter(|h| !h.is_closed()).count()
    }

    pub fn max_concurrent_sessions(&self) -> usize {
        self.max_concurrent_sessions.load(Ordering::Relaxed)
    }

    /// Applies to sessions created from now on; open sessions are never evicted.
    pub fn set_max_concurrent_sessions(&self, limit: usize) {
        self.max_concurrent_sessions.store(limit, Ordering::Relaxed);
    }

    /// Close every open session, letting replies in progress drain.
    pub async fn shutdown_all(&self) {
        let handles: Vec<Arc<SessionHandle>> = {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            sessions.values().filter(|h| !h.is_closed()).cloned().collect()
        };
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "Closing all sessions");
        join_all(handles.iter().map(|h| h.close(true, CloseReason::Shutdown))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::energy::EnergyVad;
    use crate::adapters::testing::{
        silence_frame, ScriptedDialogue, ScriptedSynthesizer, ScriptedTranscriber,
    };
    use crate::session::machine::SessionState;

    fn adapters() -> AdapterSet {
        AdapterSet {
            vad: Arc::new(EnergyVad::default()),
            transcriber: Arc::new(ScriptedTranscriber::new(Vec::new())),
            dialogue: Arc::new(ScriptedDialogue::replying("ok")),
            synthesizer: Arc::new(ScriptedSynthesizer::new(1, Duration::from_millis(1))),
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            silence_timeout_ms: 0,
            ..SessionConfig::default()
        }
    }

    async fn wait_for_state(supervisor: &SessionSupervisor, id: &str, state: SessionState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while supervisor.session_status(id).unwrap().state != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session never reached expected state");
    }

    #[tokio::test]
    async fn test_create_and_end_session() {
        let supervisor = SessionSupervisor::new(4);
        let id = supervisor.create_session(config(), adapters()).unwrap();
        wait_for_state(&supervisor, &id, SessionState::ListeningForSpeech).await;
        assert_eq!(supervisor.active_count(), 1);

        supervisor.end_session(&id).await.unwrap();
        supervisor.end_session(&id).await.unwrap();

        let status = supervisor.session_status(&id).unwrap();
        assert_eq!(status.state, SessionState::Closed);
        assert_eq!(status.close_reason, Some(CloseReason::Requested));
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let supervisor = SessionSupervisor::new(4);
        assert!(matches!(
            supervisor.end_session("missing").await,
            Err(VoiceError::SessionNotFound(_))
        ));
        assert!(matches!(
            supervisor.on_frame("missing", silence_frame(0)),
            Err(VoiceError::SessionNotFound(_))
        ));
        assert!(supervisor.session_status("missing").is_err());
    }

    #[tokio::test]
    async fn test_concurrency_limit_counts_open_sessions() {
        let supervisor = SessionSupervisor::new(2);
        let first = supervisor.create_session(config(), adapters()).unwrap();
        supervisor.create_session(config(), adapters()).unwrap();
        assert_eq!(
            supervisor.create_session(config(), adapters()),
            Err(VoiceError::SessionLimitReached(2))
        );

        // A closed session frees its slot even before it is reaped
        supervisor.transport_disconnected(&first).await.unwrap();
        assert!(supervisor.create_session(config(), adapters()).is_ok());
        assert_eq!(supervisor.list_sessions().len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let supervisor = SessionSupervisor::new(2);
        let bad = SessionConfig {
            frame_ms: 0,
            ..config()
        };
        assert!(matches!(
            supervisor.create_session(bad, adapters()),
            Err(VoiceError::Config(_))
        ));
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_reap_closed_sessions() {
        let supervisor = SessionSupervisor::new(4);
        let closed = supervisor.create_session(config(), adapters()).unwrap();
        let open = supervisor.create_session(config(), adapters()).unwrap();
        supervisor.end_session(&closed).await.unwrap();

        assert_eq!(supervisor.reap_closed(Duration::from_secs(60)), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(supervisor.reap_closed(Duration::from_millis(1)), 1);
        assert!(supervisor.session_status(&closed).is_err());
        assert!(supervisor.session_status(&open).is_ok());
    }

    #[tokio::test]
    async fn test_silence_can_end_session() {
        let supervisor = SessionSupervisor::new(4);
        let config = SessionConfig {
            silence_timeout_ms: 30,
            end_session_on_silence: true,
            ..config()
        };
        let id = supervisor.create_session(config, adapters()).unwrap();
        wait_for_state(&supervisor, &id, SessionState::Closed).await;
        assert_eq!(
            supervisor.session_status(&id).unwrap().close_reason,
            Some(CloseReason::SilenceTimeout)
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let supervisor = SessionSupervisor::new(4);
        let ids: Vec<String> = (0..3)
            .map(|_| supervisor.create_session(config(), adapters()).unwrap())
            .collect();
        supervisor.shutdown_all().await;

        for id in ids {
            let status = supervisor.session_status(&id).unwrap();
            assert_eq!(status.state, SessionState::Closed);
            assert_eq!(status.close_reason, Some(CloseReason::Shutdown));
        }
    }

    #[tokio::test]
    async fn test_frames_route_to_session() {
        let supervisor = SessionSupervisor::new(4);
        let id = supervisor.create_session(config(), adapters()).unwrap();
        for seq in 0..5 {
            supervisor.on_frame(&id, silence_frame(seq)).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let status = supervisor.session_status(&id).unwrap();
                if status.last_activity > status.created_at {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("frames never reached the session");
    }
}

//! # WebSocket Media Bridge
//!
//! Connects a participant's audio transport to a voice session. Clients create a session
//! over REST, then connect to `/ws/sessions/{id}`.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the server replies with a `connected` message carrying the
//!    expected audio format
//! 2. **Audio in**: binary messages of 16-bit little-endian mono PCM at the session's
//!    sample rate, in chunks of any size
//! 3. **Audio out**: reply audio as binary messages, one frame each
//! 4. **Events**: session events as JSON text (`state_changed`, `transcript`, `reply`,
//!    `turn_completed`, `barge_in`, `soft_error`, `silence_timeout`, `closed`)
//! 5. **Control**: `{"type": "end_session"}` ends the session gracefully
//!
//! Losing the socket (close, protocol error, missed heartbeats) is a transport loss: the
//! session is closed abruptly and any reply in flight is cancelled.

use crate::audio::frame::{AudioFrame, FrameChunker};
use crate::error::{AppError, VoiceError, VoiceResult};
use crate::session::{AudioSink, SessionEvent, SessionSupervisor};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// How long a client may stay silent (no pong, no data) before the transport is considered lost
const CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

/// Text messages accepted from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    EndSession,
    Ping { timestamp: u64 },
}

/// Text messages sent by the bridge itself. Session events are forwarded as-is.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    Connected {
        session_id: String,
        sample_rate: u32,
        frame_ms: u32,
    },
    Pong {
        timestamp: u64,
    },
    Error {
        code: String,
        message: String,
    },
}

/// WebSocket actor bridging one connection to one session.
pub struct MediaBridge {
    session_id: String,
    supervisor: Arc<SessionSupervisor>,
    chunker: FrameChunker,
    sample_rate: u32,
    frame_ms: u32,
    last_heartbeat: Instant,
    /// Frames refused because the session's inbound queue was full
    dropped_frames: u64,
}

impl MediaBridge {
    pub fn new(session_id: String, supervisor: Arc<SessionSupervisor>, sample_rate: u32, frame_ms: u32) -> Self {
        Self {
            session_id,
            supervisor,
            chunker: FrameChunker::new(sample_rate, frame_ms),
            sample_rate,
            frame_ms,
            last_heartbeat: Instant::now(),
            dropped_frames: 0,
        }
    }

    fn send_json<T: Serialize>(ctx: &mut ws::WebsocketContext<Self>, message: &T) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(error = %e, "Failed to serialize WebSocket message"),
        }
    }

    fn send_error(ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        Self::send_json(
            ctx,
            &BridgeMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    /// Chunk inbound PCM into frames and route them to the session.
    fn handle_audio_data(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        for frame in self.chunker.push_bytes(data) {
            match self.supervisor.on_frame(&self.session_id, frame) {
                Ok(()) => {}
                Err(VoiceError::InboundQueueFull(_)) => {
                    self.dropped_frames += 1;
                    if self.dropped_frames == 1 || self.dropped_frames % 100 == 0 {
                        warn!(
                            session_id = %self.session_id,
                            dropped_frames = self.dropped_frames,
                            "Session is not keeping up, dropping inbound audio"
                        );
                    }
                }
                Err(e) => {
                    debug!(session_id = %self.session_id, error = %e, "Session no longer accepts audio");
                    Self::send_error(ctx, "session_closed", &e.to_string());
                    ctx.stop();
                    return;
                }
            }
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::EndSession) => {
                info!(session_id = %self.session_id, "Client requested end of session");
                let supervisor = self.supervisor.clone();
                let session_id = self.session_id.clone();
                // The `closed` event is forwarded when the session finishes draining
                tokio::spawn(async move {
                    if let Err(e) = supervisor.end_session(&session_id).await {
                        warn!(session_id = %session_id, error = %e, "Failed to end session");
                    }
                });
            }
            Ok(ClientMessage::Ping { timestamp }) => {
                Self::send_json(ctx, &BridgeMessage::Pong { timestamp });
            }
            Err(err) => {
                Self::send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err));
            }
        }
    }

    /// Forward session events to the actor until the session closes or the actor stops.
    fn forward_events(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let mut events = match self.supervisor.subscribe(&self.session_id) {
            Ok(events) => events,
            Err(e) => {
                Self::send_error(ctx, "session_not_found", &e.to_string());
                ctx.stop();
                return;
            }
        };
        let addr = ctx.address();
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let closed = matches!(event, SessionEvent::Closed { .. });
                        if !addr.connected() {
                            break;
                        }
                        addr.do_send(ForwardEvent(event));
                        if closed {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session_id = %session_id, skipped, "Client fell behind on session events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}

/// Outbound reply audio, delivered to the actor from the session task.
#[derive(Message)]
#[rtype(result = "()")]
struct OutboundFrame(AudioFrame);

/// A session event to forward to the client as JSON.
#[derive(Message)]
#[rtype(result = "()")]
struct ForwardEvent(SessionEvent);

/// The session's view of this connection.
struct BridgeSink {
    addr: Addr<MediaBridge>,
}

impl AudioSink for BridgeSink {
    fn emit_frame(&self, session_id: &str, frame: AudioFrame) -> VoiceResult<()> {
        if !self.addr.connected() {
            return Err(VoiceError::TransportDisconnected(format!(
                "media bridge for session {} is gone",
                session_id
            )));
        }
        self.addr.do_send(OutboundFrame(frame));
        Ok(())
    }
}

impl Actor for MediaBridge {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "Media bridge connected");

        let sink = Arc::new(BridgeSink { addr: ctx.address() });
        if let Err(e) = self.supervisor.attach_sink(&self.session_id, sink) {
            Self::send_error(ctx, "session_not_found", &e.to_string());
            ctx.stop();
            return;
        }
        self.forward_events(ctx);

        Self::send_json(
            ctx,
            &BridgeMessage::Connected {
                session_id: self.session_id.clone(),
                sample_rate: self.sample_rate,
                frame_ms: self.frame_ms,
            },
        );

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(
            session_id = %self.session_id,
            dropped_frames = self.dropped_frames,
            "Media bridge disconnected"
        );

        // No-op if the session already closed on its own
        let supervisor = self.supervisor.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = supervisor.transport_disconnected(&session_id).await {
                debug!(session_id = %session_id, error = %e, "Session already gone");
            }
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaBridge {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_audio_data(&data, ctx);
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<OutboundFrame> for MediaBridge {
    type Result = ();

    fn handle(&mut self, msg: OutboundFrame, ctx: &mut Self::Context) {
        ctx.binary(msg.0.to_pcm_bytes());
    }
}

impl Handler<ForwardEvent> for MediaBridge {
    type Result = ();

    fn handle(&mut self, msg: ForwardEvent, ctx: &mut Self::Context) {
        let closed = matches!(msg.0, SessionEvent::Closed { .. });
        Self::send_json(ctx, &msg.0);
        if closed {
            ctx.close(Some(ws::CloseCode::Normal.into()));
            ctx.stop();
        }
    }
}

/// WebSocket endpoint handler: `GET /ws/sessions/{id}`.
///
/// ## HTTP to WebSocket Upgrade:
/// The session must exist and still be open; otherwise the upgrade is refused with 404.
pub async fn media_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let session_id = path.into_inner();
    info!(
        session_id = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "New media bridge connection request"
    );

    let supervisor = app_state.supervisor.clone();
    let status = supervisor.session_status(&session_id).map_err(AppError::from)?;
    if !status.state.is_live() {
        return Err(AppError::NotFound(format!("session {} is closed", session_id)).into());
    }
    let config = supervisor.session_config(&session_id).map_err(AppError::from)?;

    let bridge = MediaBridge::new(session_id, supervisor, config.sample_rate, config.frame_ms);
    ws::start(bridge, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"end_session"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::EndSession));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping","timestamp":42}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping { timestamp: 42 }));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"pause"}"#).is_err());
    }

    #[test]
    fn test_session_events_are_tagged() {
        let event = SessionEvent::StateChanged {
            from: SessionState::Synthesizing,
            to: SessionState::Interrupted,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["from"], "synthesizing");
        assert_eq!(json["to"], "interrupted");
    }

    #[test]
    fn test_bridge_messages() {
        let json = serde_json::to_value(BridgeMessage::Connected {
            session_id: "abc".into(),
            sample_rate: 16000,
            frame_ms: 30,
        })
        .unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["sample_rate"], 16000);
    }
}

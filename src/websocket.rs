//! # WebSocket Streaming Transcription Handler
//!
//! Transport layer for the real-time transcription protocol. Clients
//! connect to `/ws` and exchange JSON text frames, one message per logical
//! event, each a mapping with a `type` field and a `data` payload.
//!
//! ## Protocol:
//! - **Client → Server**: `session_start`, `audio_chunk` (base64 container
//!   bytes), `pcm_chunk` (base64 raw 16 kHz mono PCM), `session_end`
//! - **Server → Client**: `transcription` (text, confidence, optional
//!   partial flag), `session_status` (started/ended)
//!
//! Malformed messages are logged and dropped; they never terminate the
//! connection. Transcription pipelines run as spawned tasks so receiving a
//! chunk never blocks on its own trigger; results arrive later through the
//! actor mailbox.

use crate::audio::pcm;
use crate::audio::session::{CoachSession, SessionRegistry};
use crate::state::{AppState, TranscriberState};
use crate::transcription::scheduler::{TranscriptUpdate, TranscriptionScheduler};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Inbound protocol messages.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Reset the session and start recording
    SessionStart {},

    /// One discrete containerized audio chunk
    AudioChunk { chunk: String },

    /// Raw canonical-rate PCM samples
    PcmChunk { chunk: String },

    /// Finalize and emit the aggregate transcript
    SessionEnd {},
}

/// Outbound protocol messages.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Transcription {
        text: String,
        confidence: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        partial: Option<bool>,
    },
    SessionStatus {
        status: String,
        message: String,
    },
}

impl ServerMessage {
    fn from_update(update: TranscriptUpdate) -> Self {
        ServerMessage::Transcription {
            text: update.text,
            confidence: update.confidence,
            partial: update.partial.then_some(true),
        }
    }

    fn status(status: &str, message: &str) -> Self {
        ServerMessage::SessionStatus {
            status: status.to_string(),
            message: message.to_string(),
        }
    }
}

/// Notification posted back to the actor from a spawned pipeline task.
#[derive(Message)]
#[rtype(result = "()")]
struct Notify(ServerMessage);

/// Actor handling one streaming connection.
///
/// The session identity is a server-generated UUID bound to this actor, so
/// session state is keyed by a stable id instead of the transport handle.
pub struct CoachWebSocket {
    connection_id: String,
    registry: Arc<SessionRegistry>,
    scheduler: Arc<TranscriptionScheduler>,
    app_state: web::Data<AppState>,
    last_heartbeat: Instant,
}

impl CoachWebSocket {
    pub fn new(transcriber: &TranscriberState, app_state: web::Data<AppState>) -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            registry: transcriber.registry.clone(),
            scheduler: transcriber.scheduler.clone(),
            app_state,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, msg: &ServerMessage) {
        if let Ok(json) = serde_json::to_string(msg) {
            ctx.text(json);
        }
    }

    /// Resolve this connection's session, creating it lazily. A resolution
    /// failure (storage allocation, session limit) drops the triggering
    /// message but keeps the connection open.
    fn ensure_session(&self) -> Option<Arc<CoachSession>> {
        match self.registry.ensure(&self.connection_id) {
            Ok(session) => Some(session),
            Err(err) => {
                warn!(
                    connection_id = %self.connection_id,
                    %err,
                    "failed to resolve session; dropping message"
                );
                None
            }
        }
    }

    fn handle_session_start(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session) = self.ensure_session() else {
            return;
        };
        session.begin();
        info!(connection_id = %self.connection_id, "session started");
        self.send(
            ctx,
            &ServerMessage::status("started", "Session started successfully"),
        );
    }

    fn handle_audio_chunk(&self, chunk_b64: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let bytes = match BASE64.decode(chunk_b64) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    connection_id = %self.connection_id,
                    %err,
                    "discarding audio chunk with invalid base64"
                );
                return;
            }
        };

        let Some(session) = self.ensure_session() else {
            return;
        };
        session.mark_active();

        let segment = match session.store.write_segment(&bytes) {
            Ok(segment) => segment,
            Err(err) => {
                warn!(connection_id = %self.connection_id, %err, "failed to buffer audio segment");
                return;
            }
        };
        debug!(
            connection_id = %self.connection_id,
            seq = segment.seq,
            len = segment.len,
            "buffered audio segment"
        );

        // Fire-and-forget: the chunk is acknowledged by returning, results
        // arrive through the mailbox
        let scheduler = self.scheduler.clone();
        let addr = ctx.address();
        tokio::spawn(async move {
            if let Some(update) = scheduler.on_segment(&session, &segment).await {
                addr.do_send(Notify(ServerMessage::from_update(update)));
            }
        });
    }

    fn handle_pcm_chunk(&self, chunk_b64: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let bytes = match BASE64.decode(chunk_b64) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    connection_id = %self.connection_id,
                    %err,
                    "discarding PCM chunk with invalid base64"
                );
                return;
            }
        };

        if let Err(reason) = pcm::validate_chunk(&bytes) {
            warn!(connection_id = %self.connection_id, %reason, "discarding malformed PCM chunk");
            return;
        }

        let Some(session) = self.ensure_session() else {
            return;
        };
        session.mark_active();

        match session.store.append_raw(&bytes) {
            Ok(total) => {
                debug!(
                    connection_id = %self.connection_id,
                    total_bytes = total,
                    "appended to raw PCM buffer"
                );
            }
            Err(err) => {
                warn!(connection_id = %self.connection_id, %err, "failed to append PCM chunk");
                return;
            }
        }

        let scheduler = self.scheduler.clone();
        let addr = ctx.address();
        tokio::spawn(async move {
            if let Some(update) = scheduler.on_raw_growth(&session).await {
                addr.do_send(Notify(ServerMessage::from_update(update)));
            }
        });
    }

    /// Finalize in a spawned task: wait out any in-flight partial pass, run
    /// the terminal transcription, emit the final transcript and the ended
    /// status (in that order — both posted from one task, so the mailbox
    /// preserves it), then tear the session down.
    fn handle_session_end(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session) = self.ensure_session() else {
            return;
        };
        info!(connection_id = %self.connection_id, "session ending");

        let scheduler = self.scheduler.clone();
        let registry = self.registry.clone();
        let connection_id = self.connection_id.clone();
        let addr = ctx.address();
        tokio::spawn(async move {
            let update = scheduler.finalize(&session).await;
            addr.do_send(Notify(ServerMessage::from_update(update)));
            addr.do_send(Notify(ServerMessage::status("ended", "Session ended")));
            registry.remove(&connection_id);
        });
    }
}

impl Actor for CoachWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "WebSocket connection started");
        self.app_state.increment_active_sessions();

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(
                    connection_id = %act.connection_id,
                    "WebSocket heartbeat timeout, closing connection"
                );
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Disconnect at any point is an implicit session end without a final
    /// transcript: the registry removal is the one thing that must happen.
    /// An in-flight pipeline is allowed to finish and its result is dropped
    /// with the mailbox.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "WebSocket connection stopped");
        self.app_state.decrement_active_sessions();

        let registry = self.registry.clone();
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            registry.remove(&connection_id);
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CoachWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::SessionStart {}) => self.handle_session_start(ctx),
                Ok(ClientMessage::AudioChunk { chunk }) => self.handle_audio_chunk(&chunk, ctx),
                Ok(ClientMessage::PcmChunk { chunk }) => self.handle_pcm_chunk(&chunk, ctx),
                Ok(ClientMessage::SessionEnd {}) => self.handle_session_end(ctx),
                Err(err) => {
                    warn!(
                        connection_id = %self.connection_id,
                        %err,
                        "ignoring malformed protocol message"
                    );
                }
            },
            Ok(ws::Message::Binary(_)) => {
                warn!(
                    connection_id = %self.connection_id,
                    "ignoring binary frame; audio must arrive as base64 chunk messages"
                );
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection_id, ?reason, "WebSocket closed");
                ctx.stop();
            }
            Ok(_) => {}
            Err(err) => {
                warn!(connection_id = %self.connection_id, %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<Notify> for CoachWebSocket {
    type Result = ();

    fn handle(&mut self, msg: Notify, ctx: &mut Self::Context) {
        self.send(ctx, &msg.0);
    }
}

/// HTTP → WebSocket upgrade for `/ws`.
pub async fn coach_websocket(
    req: HttpRequest,
    stream: web::Payload,
    transcriber: web::Data<TranscriberState>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        peer = ?req.connection_info().peer_addr(),
        "new WebSocket connection request"
    );
    ws::start(
        CoachWebSocket::new(transcriber.get_ref(), app_state),
        &req,
        stream,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_message_shapes() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "session_start", "data": {}}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SessionStart {}));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "audio_chunk", "data": {"chunk": "aGVsbG8="}}"#)
                .unwrap();
        match msg {
            ClientMessage::AudioChunk { chunk } => assert_eq!(chunk, "aGVsbG8="),
            other => panic!("wrong variant: {:?}", other),
        }

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "pcm_chunk", "data": {"chunk": "AAAA"}}"#).unwrap();
        assert!(matches!(msg, ClientMessage::PcmChunk { .. }));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "session_end", "data": {}}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SessionEnd {}));
    }

    #[test]
    fn test_malformed_messages_fail_to_parse() {
        assert!(serde_json::from_str::<ClientMessage>("not json at all").is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "bogus", "data": {}}"#).is_err());
        // Missing required field inside data
        assert!(
            serde_json::from_str::<ClientMessage>(r#"{"type": "audio_chunk", "data": {}}"#)
                .is_err()
        );
    }

    #[test]
    fn test_partial_transcription_serialization() {
        let msg = ServerMessage::from_update(TranscriptUpdate {
            text: "hello world".to_string(),
            confidence: 0.7,
            partial: true,
        });
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "transcription");
        assert_eq!(json["data"]["text"], "hello world");
        let confidence = json["data"]["confidence"].as_f64().unwrap();
        assert!((confidence - 0.7).abs() < 1e-6);
        assert_eq!(json["data"]["partial"], true);
    }

    #[test]
    fn test_final_transcription_omits_partial_flag() {
        let msg = ServerMessage::from_update(TranscriptUpdate {
            text: "done".to_string(),
            confidence: 0.75,
            partial: false,
        });
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "transcription");
        assert!(json["data"].get("partial").is_none());
    }

    #[test]
    fn test_session_status_serialization() {
        let msg = ServerMessage::status("started", "Session started successfully");
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "session_status");
        assert_eq!(json["data"]["status"], "started");
        assert_eq!(json["data"]["message"], "Session started successfully");
    }
}

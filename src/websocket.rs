//! # WebSocket Status Channel
//!
//! The push half of the dual-channel status contract. A client connects to
//! `/ws/status` with its proxy-injected identity, sends a `subscribe`
//! frame, and from then on receives every status event for its own jobs:
//! `status-update`, `completed`, `failed`, and `cancelled`. The same
//! connection accepts `cancel-job` requests.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: identity comes from the upgrade request headers
//! 2. **Subscribe**: `{"type":"subscribe"}` joins the caller's own channel;
//!    active jobs are replayed as status updates so late joiners catch up
//! 3. **Events**: server frames mirror the poll payload shape exactly
//! 4. **Cancellation**: `{"type":"cancel-job","jobId":"..."}`
//! 5. **Heartbeat**: ping/pong with a connection timeout

use crate::error::AppResult;
use crate::events::StatusEvent;
use crate::handlers::require_identity;
use crate::jobs::cancel::cancel_job;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

/// How often the server pings idle connections.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Connections silent for longer than this are dropped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Frames the client may send.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Join the status channel for the caller's own identity.
    #[serde(rename = "subscribe")]
    Subscribe,

    /// Request cancellation of one of the caller's jobs.
    #[serde(rename = "cancel-job")]
    CancelJob {
        #[serde(rename = "jobId")]
        job_id: String,
    },

    /// Heartbeat from client.
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    /// Heartbeat response from client.
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

/// Server-originated frames that are not status events.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ServerMessage {
    #[serde(rename = "subscribed")]
    Subscribed { channel: String },

    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        #[serde(rename = "jobId", skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },

    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
}

/// Message for sending text to the WebSocket client from spawned tasks.
#[derive(Message)]
#[rtype(result = "()")]
struct SendText(String);

/// WebSocket actor for one status subscription.
///
/// ## Actor Model:
/// Each connection is an independent actor. Hub events arrive through a
/// broadcast stream attached to the actor's context, so the subscription
/// ends automatically when the connection closes.
pub struct StatusWebSocket {
    /// Authenticated identity this connection is scoped to.
    owner_id: String,

    /// Shared application state (registry, hub, config).
    state: web::Data<AppState>,

    /// Last heartbeat time.
    last_heartbeat: Instant,

    /// Whether the client has subscribed yet.
    subscribed: bool,
}

impl StatusWebSocket {
    pub fn new(owner_id: String, state: web::Data<AppState>) -> Self {
        Self {
            owner_id,
            state,
            last_heartbeat: Instant::now(),
            subscribed: false,
        }
    }

    fn send_server_message(&self, ctx: &mut ws::WebsocketContext<Self>, msg: &ServerMessage) {
        if let Ok(json) = serde_json::to_string(msg) {
            ctx.text(json);
        }
    }

    /// Join the owner's channel and replay the current state of their
    /// active jobs so a late-joining client catches up immediately.
    fn handle_subscribe(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if self.subscribed {
            return;
        }
        self.subscribed = true;

        // Attach to the hub before replaying: events that land while we
        // replay are buffered by the broadcast receiver, not lost.
        let receiver = self.state.hub.subscribe(&self.owner_id);
        ctx.add_stream(BroadcastStream::new(receiver));

        self.send_server_message(
            ctx,
            &ServerMessage::Subscribed {
                channel: self.owner_id.clone(),
            },
        );

        for job in self.state.registry.jobs_for_owner(&self.owner_id) {
            let event = StatusEvent::StatusUpdate {
                snapshot: job.snapshot(),
            };
            if let Ok(json) = serde_json::to_string(&event) {
                ctx.text(json);
            }
        }

        info!("User {} subscribed to status channel", self.owner_id);
    }

    /// Cancellation over the socket. The coordinator publishes the
    /// resulting events to the hub; only failures are reported directly.
    fn handle_cancel(&self, job_id: String, ctx: &mut ws::WebsocketContext<Self>) {
        info!(
            "Cancellation requested for job {} by user {}",
            job_id, self.owner_id
        );

        let state = self.state.clone();
        let owner_id = self.owner_id.clone();
        let addr = ctx.address();

        tokio::spawn(async move {
            let cancelled = cancel_job(&state.registry, &state.hub, &job_id, &owner_id).await;
            if !cancelled {
                let error = ServerMessage::Error {
                    code: "cancellation_error".to_string(),
                    message: "Job not found or unauthorized".to_string(),
                    job_id: Some(job_id),
                };
                if let Ok(json) = serde_json::to_string(&error) {
                    addr.do_send(SendText(json));
                }
            }
        });
    }
}

impl Actor for StatusWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Status WebSocket connected for user {}", self.owner_id);

        // Heartbeat timer: ping the client, drop unresponsive connections.
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }

            let ping = ServerMessage::Ping {
                timestamp: chrono::Utc::now().timestamp_millis() as u64,
            };
            if let Ok(json) = serde_json::to_string(&ping) {
                ctx.text(json);
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("Status WebSocket closed for user {}", self.owner_id);
    }
}

/// Handle incoming WebSocket frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for StatusWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Subscribe) => self.handle_subscribe(ctx),
                Ok(ClientMessage::CancelJob { job_id }) => self.handle_cancel(job_id, ctx),
                Ok(ClientMessage::Ping { timestamp }) => {
                    self.last_heartbeat = Instant::now();
                    // Echo as a pong so client-side latency can be measured.
                    if let Ok(json) = serde_json::to_string(&serde_json::json!({
                        "type": "pong",
                        "timestamp": timestamp,
                    })) {
                        ctx.text(json);
                    }
                }
                Ok(ClientMessage::Pong { .. }) => {
                    self.last_heartbeat = Instant::now();
                }
                Err(err) => {
                    self.send_server_message(
                        ctx,
                        &ServerMessage::Error {
                            code: "invalid_json".to_string(),
                            message: format!("Invalid JSON: {}", err),
                            job_id: None,
                        },
                    );
                }
            },
            Ok(ws::Message::Binary(_)) => {
                warn!("Unexpected binary frame on status channel");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Forward hub events to the client.
impl StreamHandler<Result<StatusEvent, BroadcastStreamRecvError>> for StatusWebSocket {
    fn handle(
        &mut self,
        item: Result<StatusEvent, BroadcastStreamRecvError>,
        ctx: &mut Self::Context,
    ) {
        match item {
            Ok(event) => {
                debug!(
                    "Forwarding {} event for job {}",
                    if event.is_terminal() { "terminal" } else { "status" },
                    event.job_id()
                );
                if let Ok(json) = serde_json::to_string(&event) {
                    ctx.text(json);
                }
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                // Slow consumer: progress updates were dropped. Terminal
                // events may be among them, so tell the client to re-poll.
                warn!(
                    "Status subscriber for {} lagged, {} events dropped",
                    self.owner_id, skipped
                );
                self.send_server_message(
                    ctx,
                    &ServerMessage::Error {
                        code: "subscription_lagged".to_string(),
                        message: format!(
                            "{} status events were dropped; poll for current state",
                            skipped
                        ),
                        job_id: None,
                    },
                );
            }
        }
    }
}

/// Handle SendText messages from spawned tasks.
impl Handler<SendText> for StatusWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Authenticates the upgrade request, then hands the connection to a
/// `StatusWebSocket` actor scoped to that identity.
pub async fn status_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let owner_id = require_identity(&req)?;
    debug!(
        "New status WebSocket request from {:?}",
        req.connection_info().peer_addr()
    );

    let websocket = StatusWebSocket::new(owner_id, state);
    ws::start(websocket, &req, stream)
        .map_err(|err| crate::error::AppError::Internal(format!("WebSocket upgrade failed: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"subscribe"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"cancel-job","jobId":"job-42"}"#).unwrap();
        match msg {
            ClientMessage::CancelJob { job_id } => assert_eq!(job_id, "job-42"),
            other => panic!("wrong message type: {:?}", other),
        }

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn test_error_frame_shape() {
        let error = ServerMessage::Error {
            code: "cancellation_error".to_string(),
            message: "Job not found or unauthorized".to_string(),
            job_id: Some("job-42".to_string()),
        };

        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "cancellation_error");
        assert_eq!(json["jobId"], "job-42");
    }
}

/**
 * WebSocket Session Runtime
 *
 * Handshake path: `GET /ws/document/{documentId}` with the bearer token
 * in `?token=` or the Authorization header.
 *
 * 1. Validate the Origin header against the configured allow-list
 * 2. Verify the token (close 4401 on failure)
 * 3. Resolve document access (4404 missing, 4403 denied)
 * 4. Upgrade, hydrate/attach the replica, send the full state
 * 5. Run the inbound/outbound loops until disconnect or shutdown
 *
 * # Ordering
 *
 * Within one client, frames are handled in arrival order. Across
 * clients the replica lock linearizes updates; a broadcast of update U
 * is enqueued strictly after U is merged and appended, so any frame a
 * peer observes is already durable. There is no per-update ack beyond
 * that.
 *
 * # Permissions
 *
 * The access level is resolved once at admission. Read-only sessions
 * get 4403 on their first update frame; grants changed mid-session take
 * effect on the next admission.
 */

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::auth::{AuthClaims, DocAccess, PermissionLevel};
use crate::collab::protocol::Frame;
use crate::collab::replica::ClientId;
use crate::error::types::close;
use crate::error::ServiceError;
use crate::server::state::AppState;

/// Budget for verify + authorize during the handshake.
const AUTH_BUDGET: Duration = Duration::from_secs(5);

/// Per-frame write deadline on the outbound path.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Admission verdict computed before the upgrade completes.
enum Admission {
    Serve {
        claims: AuthClaims,
        level: PermissionLevel,
    },
    Reject {
        code: u16,
        reason: &'static str,
    },
}

/// `GET /ws/document/{documentId}` upgrade handler.
pub async fn document_ws(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(err) = check_origin(&headers, &state.config.allowed_origins) {
        return err.into_response();
    }

    let Some(token) = extract_token(&query, &headers) else {
        return ServiceError::AuthInvalid("missing bearer token".into()).into_response();
    };

    let admission = admit(&state, &token, document_id).await;
    ws.on_upgrade(move |socket| run_session(state, socket, document_id, admission))
}

/// Reject unless the Origin header is allowed. Requests without an
/// Origin header (non-browser clients) pass.
fn check_origin(headers: &HeaderMap, allowed: &[String]) -> Result<(), ServiceError> {
    if allowed.iter().any(|o| o == "*") {
        return Ok(());
    }
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return Ok(());
    };
    if allowed.iter().any(|o| o == origin) {
        Ok(())
    } else {
        Err(ServiceError::Forbidden(format!(
            "origin {} not allowed",
            origin
        )))
    }
}

/// Token from `?token=` or `Authorization: Bearer ...`.
fn extract_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query.token.as_deref().filter(|t| !t.is_empty()) {
        return Some(token.to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.to_string())
}

async fn admit(state: &AppState, token: &str, document_id: Uuid) -> Admission {
    let checks = async {
        let claims = state.verifier.verify(token).await?;
        let access = state
            .permissions
            .document_access(claims.user_id, document_id)
            .await?;
        Ok::<_, ServiceError>((claims, access))
    };

    match tokio::time::timeout(AUTH_BUDGET, checks).await {
        Err(_) => {
            tracing::warn!(%document_id, "admission exceeded auth budget");
            Admission::Reject {
                code: close::INTERNAL,
                reason: "authorization timed out",
            }
        }
        Ok(Err(err)) => {
            tracing::info!(%document_id, error = %err, "admission rejected");
            Admission::Reject {
                code: err.close_code(),
                reason: match err {
                    ServiceError::AuthInvalid(_) | ServiceError::AuthExpired => {
                        "authentication failed"
                    }
                    _ => "admission failed",
                },
            }
        }
        Ok(Ok((claims, access))) => match access {
            DocAccess::NotFound => Admission::Reject {
                code: close::NOT_FOUND,
                reason: "document not found",
            },
            DocAccess::Denied => Admission::Reject {
                code: close::FORBIDDEN,
                reason: "access denied",
            },
            DocAccess::Allowed(level) => Admission::Serve { claims, level },
        },
    }
}

async fn run_session(state: AppState, socket: WebSocket, document_id: Uuid, admission: Admission) {
    let (mut sender, receiver) = socket.split();

    let (claims, level) = match admission {
        Admission::Reject { code, reason } => {
            send_close(&mut sender, code, reason).await;
            return;
        }
        Admission::Serve { claims, level } => (claims, level),
    };

    let client_id: ClientId = Uuid::new_v4();
    let replica = match state.registry.acquire(document_id, client_id).await {
        Ok(replica) => replica,
        Err(err) => {
            tracing::error!(%document_id, error = %err, "failed to open replica for session");
            send_close(&mut sender, err.close_code(), "failed to open document").await;
            return;
        }
    };

    tracing::info!(
        %document_id,
        %client_id,
        user_id = %claims.user_id,
        username = %claims.username,
        level = level.as_str(),
        "session opened"
    );

    // Subscribe before encoding the initial state so nothing merged in
    // between is missed; a duplicate delivery merges as a no-op.
    let updates_rx = replica.subscribe();
    let initial = Frame::SyncReply(replica.encode_state().await).encode();
    if send_with_deadline(&mut sender, initial).await.is_err() {
        state.registry.release(document_id, client_id);
        return;
    }
    for (peer, payload) in replica.awareness_snapshot() {
        if peer != client_id
            && send_with_deadline(&mut sender, Frame::Awareness(payload).encode())
                .await
                .is_err()
        {
            state.registry.release(document_id, client_id);
            return;
        }
    }

    serve_loops(
        &state,
        &replica,
        &mut sender,
        receiver,
        updates_rx,
        document_id,
        client_id,
        level,
    )
    .await;

    state.registry.release(document_id, client_id);
    tracing::info!(%document_id, %client_id, "session closed");
}

#[allow(clippy::too_many_arguments)]
async fn serve_loops(
    state: &AppState,
    replica: &std::sync::Arc<crate::collab::replica::Replica>,
    sender: &mut WsSender,
    mut receiver: WsReceiver,
    mut updates_rx: broadcast::Receiver<crate::collab::replica::Outbound>,
    document_id: Uuid,
    client_id: ClientId,
    level: PermissionLevel,
) {
    let can_write = level >= PermissionLevel::Write;
    let ping_interval = state.config.ping_interval();
    let idle_timeout = ping_interval * 2;
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await; // immediate first tick
    let mut last_inbound = Instant::now();
    let mut shutdown = state.shutdown.clone();

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        last_inbound = Instant::now();
                        match Frame::decode(&data) {
                            Ok(Frame::Update(update)) => {
                                if !can_write {
                                    tracing::warn!(%document_id, %client_id, "update frame on read-only session");
                                    send_close(sender, close::FORBIDDEN, "write permission required").await;
                                    break;
                                }
                                match replica.apply_update(client_id, &update).await {
                                    Ok(()) => {
                                        state.registry.schedule_store(replica);
                                        let threshold = state.registry.config().snapshot_threshold;
                                        if replica.take_compaction_trigger(threshold) {
                                            state.registry.mark_for_compaction(document_id);
                                        }
                                    }
                                    Err(err) => {
                                        // Log append failure is fatal for this
                                        // session; the client reconnects and
                                        // resynchronizes from durable state.
                                        tracing::warn!(%document_id, %client_id, error = %err, "update rejected");
                                        send_close(sender, close::INTERNAL, "failed to apply update").await;
                                        break;
                                    }
                                }
                            }
                            Ok(Frame::SyncRequest(state_vector)) => {
                                match replica.diff_for(&state_vector).await {
                                    Ok(diff) => {
                                        if send_with_deadline(sender, Frame::SyncReply(diff).encode()).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(err) => {
                                        tracing::warn!(%document_id, %client_id, error = %err, "bad sync request");
                                        send_close(sender, close::INTERNAL, "malformed state vector").await;
                                        break;
                                    }
                                }
                            }
                            Ok(Frame::Awareness(payload)) => {
                                replica.set_awareness(client_id, payload);
                            }
                            Ok(Frame::SyncReply(_)) => {
                                tracing::debug!(%document_id, %client_id, "ignoring server-only frame from client");
                            }
                            Err(err) => {
                                tracing::warn!(%document_id, %client_id, error = %err, "malformed frame");
                                send_close(sender, close::INTERNAL, "malformed frame").await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_inbound = Instant::now();
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_inbound = Instant::now();
                    }
                    Some(Ok(Message::Text(_))) => {
                        tracing::debug!(%document_id, %client_id, "ignoring text frame on binary protocol");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(%document_id, %client_id, error = %err, "socket read error");
                        break;
                    }
                }
            }

            outbound = updates_rx.recv() => {
                match outbound {
                    Ok(out) => {
                        if out.from == client_id {
                            continue;
                        }
                        if send_with_deadline(sender, (*out.payload).clone()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(%document_id, %client_id, skipped, "outbound queue overflow; dropping client");
                        send_close(sender, close::INTERNAL, "client too slow").await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = ping.tick() => {
                if last_inbound.elapsed() >= idle_timeout {
                    tracing::info!(%document_id, %client_id, "session idle timeout");
                    send_close(sender, close::NORMAL, "idle timeout").await;
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    send_close(sender, close::GOING_AWAY, "server shutting down").await;
                    break;
                }
            }
        }
    }
}

async fn send_with_deadline(sender: &mut WsSender, bytes: Vec<u8>) -> Result<(), ()> {
    match tokio::time::timeout(WRITE_DEADLINE, sender.send(Message::Binary(bytes.into()))).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

async fn send_close(sender: &mut WsSender, code: u16, reason: &'static str) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        })))
        .await;
}

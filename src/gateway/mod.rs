//! Transport gateway: the thin SSE and WebSocket upgrade endpoints that
//! hand a freshly-built [`Handle`] to the [`SubscriptionRegistry`] and
//! otherwise do nothing — no REST CRUD, no request validation beyond the
//! identifier extraction.
//!
//! `PreAuthedUser` stands in for the real auth collaborator: the actual
//! deployment is expected to authenticate the connection upstream (a
//! reverse proxy, a session cookie, whatever issues tokens) and populate a
//! trusted `X-User-Id` header before the request reaches this service.

use std::convert::Infallible;
use std::sync::Arc;

use axum::async_trait;
use axum::extract::{
    ws::{Message, WebSocket, WebSocketUpgrade},
    FromRequestParts, State,
};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{stream, SinkExt, Stream, StreamExt};
use uuid::Uuid;

use crate::model::UserId;
use crate::registry::{Handle, HandleKind, SubscriptionRegistry};
use crate::state::AppState;

pub struct PreAuthedUser(pub UserId);

#[async_trait]
impl FromRequestParts<AppState> for PreAuthedUser {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing X-User-Id").into_response())?;
        let id = Uuid::parse_str(raw)
            .map_err(|_| (StatusCode::BAD_REQUEST, "X-User-Id is not a valid UUID").into_response())?;
        Ok(PreAuthedUser(UserId(id)))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/groups/subscribe", get(sse_subscribe))
        .route("/groups/ws", get(ws_subscribe))
}

/// Drops its registry entry when the transport ends, whichever way that
/// happens (client disconnect, send failure, session-ceiling timeout
/// already closed the handle, server shutdown). Realized as an RAII guard
/// rather than a stored closure, since the registry itself already owns the
/// forced-timeout path.
struct UnsubscribeGuard {
    registry: SubscriptionRegistry,
    user: UserId,
    handle_id: Uuid,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let user = self.user;
        let handle_id = self.handle_id;
        tokio::spawn(async move {
            registry.unsubscribe(user, handle_id).await;
        });
    }
}

async fn sse_subscribe(
    PreAuthedUser(user): PreAuthedUser,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (handle, rx, close_signal) = Handle::new(HandleKind::Sse);
    let handle_id = handle.id;
    state.registry.subscribe(user, handle).await;

    let guard = UnsubscribeGuard {
        registry: state.registry.clone(),
        user,
        handle_id,
    };

    let connect = stream::once(async { Ok(Event::default().event("connect").data("connected")) });
    let messages = stream::unfold(
        (rx, close_signal, guard),
        |(mut rx, close_signal, guard)| async move {
            tokio::select! {
                biased;
                _ = close_signal.notified() => None,
                received = rx.recv() => received.map(|text| {
                    (Ok(Event::default().event("message").data(text)), (rx, close_signal, guard))
                }),
            }
        },
    );

    Sse::new(connect.chain(messages)).keep_alive(KeepAlive::default())
}

async fn ws_subscribe(
    PreAuthedUser(user): PreAuthedUser,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, user, state))
}

async fn handle_socket(socket: WebSocket, user: UserId, state: AppState) {
    let (handle, mut rx, close_signal) = Handle::new(HandleKind::Ws);
    let handle_id = handle.id;
    state.registry.subscribe(user, handle).await;
    let _guard = UnsubscribeGuard {
        registry: state.registry.clone(),
        user,
        handle_id,
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();

    if ws_sender
        .send(Message::Text("connect".to_owned()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = close_signal.notified() => break,
            outbound = rx.recv() => {
                match outbound {
                    Some(text) => {
                        if ws_sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = ws_receiver.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // This gateway is delivery-only (bus -> dispatch -> registry
                    // -> handle); any inbound client frame is drained and
                    // ignored rather than rejected, since there is no
                    // client-to-server message defined on this connection.
                    Some(Ok(_)) => continue,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::service::ChannelService;
    use crate::store::{InMemoryChannelStore, InMemoryUserDirectory};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let store: Arc<dyn crate::store::ChannelStore> = Arc::new(InMemoryChannelStore::new());
        let bus = Arc::new(LocalBus::new());
        let users: Arc<dyn crate::store::UserDirectory> = Arc::new(InMemoryUserDirectory::new());
        let service = ChannelService::new(store, bus.clone(), users, 5, Duration::from_millis(1));
        let registry = SubscriptionRegistry::new(bus, Duration::from_secs(900));
        AppState { service, registry }
    }

    #[tokio::test]
    async fn subscribe_without_user_header_is_rejected() {
        let app = router().with_state(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/groups/subscribe")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn subscribe_with_malformed_user_header_is_rejected() {
        let app = router().with_state(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/groups/subscribe")
                    .header("x-user-id", "not-a-uuid")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

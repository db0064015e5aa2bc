//! The WebSocket subscription endpoint:
//! multiplexes any number of per-resource-type subscriptions over one
//! socket, each backed by its own [`steve_ring::RingReader`].
//!
//! One ring-reader task runs per subscribed resource type, since each
//! resource type has its own ring rather than one shared broadcast channel;
//! outbound messages from every task are multiplexed onto the socket through
//! a shared `mpsc` channel.

#![forbid(unsafe_code)]

mod context;
mod protocol;

pub use context::{ResolvedType, SimpleContext, WatchContext};
pub use protocol::{ClientMessage, EventName, ServerMessage};

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use steve_access::{AccessSet, GroupResource, User};
use steve_indexer::{EventKind, EventRecord};
use steve_ring::RingError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often a live subscription re-checks the caller's access and the
/// watched GVK's indexing configuration. There is no push channel for
/// either condition, so polling is the simplest faithful implementation;
/// 2s matches the "near-real-time, not real-time" framing the whole cache
/// is built around.
const ACCESS_RECHECK_INTERVAL: Duration = Duration::from_secs(2);

/// The verb subscriptions are gated on — watching is a read, same as `list`.
const WATCH_VERB: &str = "watch";

/// Builds the router exposing `/v1/subscribe`. The caller's identity is
/// expected to already be in request extensions as a [`User`] by the time a
/// request reaches this router — authenticating the caller is out of scope
/// here and is left to whatever middleware runs in front of it.
pub fn router(ctx: Arc<dyn WatchContext>) -> Router {
    Router::new().route("/v1/subscribe", get(ws_handler)).with_state(ctx)
}

async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<Arc<dyn WatchContext>>, Extension(user): Extension<User>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, user))
}

/// Owns one socket: a reader half parsing [`ClientMessage`]s into new
/// subscriptions, a writer task draining a shared outbound channel, and one
/// spawned task per active `resourceType` (re-subscribing replaces the prior
/// task for that type, mirroring the wire protocol's one-subscription-per-
/// resource-type model).
async fn handle_socket(socket: WebSocket, ctx: Arc<dyn WatchContext>, user: User) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions: std::collections::HashMap<String, (JoinHandle<()>, CancellationToken)> = std::collections::HashMap::new();

    while let Some(Ok(msg)) = ws_rx.next().await {
        let Message::Text(text) = msg else { continue };
        let client_msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "ignoring malformed subscribe message");
                continue;
            }
        };

        if let Some((handle, token)) = subscriptions.remove(&client_msg.resource_type) {
            token.cancel();
            handle.abort();
        }

        let token = CancellationToken::new();
        let handle = spawn_subscription(Arc::clone(&ctx), user.clone(), client_msg.clone(), out_tx.clone(), token.clone());
        subscriptions.insert(client_msg.resource_type, (handle, token));
    }

    for (_, (handle, token)) in subscriptions {
        token.cancel();
        handle.abort();
    }
    writer.abort();
}

/// Runs one `resourceType` subscription to completion: resolves the type,
/// waits for its cache to be ready, positions a ring reader at the client's
/// requested revision (or the current head), and forwards events until the
/// socket closes, the reader is lapped, the ring closes, or access is
/// revoked.
fn spawn_subscription(ctx: Arc<dyn WatchContext>, user: User, msg: ClientMessage, out_tx: mpsc::Sender<Message>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let resource_type = msg.resource_type.clone();
        counter!("steve_watch_subscriptions_total", 1u64, "resource_type" => resource_type.clone());

        let Some(resolved) = ctx.resolve(&resource_type) else {
            let _ = send(&out_tx, ServerMessage::stop(&resource_type, "unknown resourceType")).await;
            return;
        };

        let access = ctx.access_for(&user);
        if !subscription_allowed(&access, &resolved.group_resource) {
            let _ = send(&out_tx, ServerMessage::stop(&resource_type, "forbidden")).await;
            return;
        }

        let handle = match ctx.cache_for(&resolved.gvk).await {
            Ok(h) => h,
            Err(e) => {
                warn!(resource_type = %resource_type, error = %e, "subscription failed to obtain cache handle");
                let _ = send(&out_tx, ServerMessage::stop(&resource_type, "cache unavailable")).await;
                return;
            }
        };
        let _handle = handle; // keeps the informer alive for the subscription's lifetime

        let Some(mut reader) = ctx.indexer().ring_reader(&resolved.gvk, None) else {
            let _ = send(&out_tx, ServerMessage::stop(&resource_type, "no ring for resourceType")).await;
            return;
        };

        if let Some(revision) = msg.revision.as_deref() {
            let found = reader.rewind(|e: &EventRecord| e.rv.as_deref() == Some(revision));
            if !found {
                // No mandated recovery here; resuming from the current head
                // (skipping whatever happened between `revision` and now) is
                // the same tradeoff the ring already makes for a lapped
                // reader, so reuse it rather than failing the subscription
                // outright.
                warn!(resource_type = %resource_type, revision, "resume revision not found in ring, starting from head");
                reader.jump_to_head();
            }
        }

        let mut recheck = tokio::time::interval(ACCESS_RECHECK_INTERVAL);
        let mut access = access;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = recheck.tick() => {
                    let fresh = ctx.access_for(&user);
                    if fresh.id() != access.id() {
                        if !subscription_allowed(&fresh, &resolved.group_resource) {
                            let _ = send(&out_tx, ServerMessage::stop(&resource_type, "access revoked")).await;
                            break;
                        }
                        access = fresh;
                    }
                }
                event = read_one(&mut reader, &token) => {
                    match event {
                        Ok(Some(record)) => {
                            if let Some(mut out) = translate(&record, &resolved.group_resource, &access) {
                                out.resource_type = resource_type.clone();
                                counter!("steve_watch_events_total", 1u64, "resource_type" => resource_type.clone());
                                if send(&out_tx, out).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(None) => break, // cancelled
                        Err(RingError::SlowReader { missed }) => {
                            warn!(resource_type = %resource_type, missed, "subscriber lapped, jumping to head");
                            reader.jump_to_head();
                            let _ = send(&out_tx, ServerMessage::stop(&resource_type, "slow reader, resubscribe")).await;
                            break;
                        }
                        Err(RingError::BufferClosed) => {
                            let _ = send(&out_tx, ServerMessage::stop(&resource_type, "resource type stopped")).await;
                            break;
                        }
                        Err(RingError::Cancelled) => break,
                    }
                }
            }
        }

        info!(resource_type = %resource_type, "subscription ended");
    })
}

/// Blocks the ring's synchronous reader inside a blocking task so it never
/// stalls the async runtime's worker threads.
async fn read_one(reader: &mut steve_ring::RingReader<EventRecord>, token: &CancellationToken) -> Result<Option<EventRecord>, RingError> {
    let token = token.clone();
    // `RingReader::read` already polls its own cancellation token internally
    // in short slices, so a direct call here (rather than spawn_blocking)
    // keeps ownership simple; the 100ms poll granularity bounds how long a
    // `select!` branch stays busy before yielding back to the loop.
    match tokio::task::block_in_place(|| reader.read(&token)) {
        Ok(record) => Ok(Some(record)),
        Err(RingError::Cancelled) if token.is_cancelled() => Ok(None),
        Err(e) => Err(e),
    }
}

fn subscription_allowed(access: &AccessSet, gr: &GroupResource) -> bool {
    access.is_passthrough(WATCH_VERB, gr) || !access.namespaces(WATCH_VERB, gr).is_empty()
}

/// Per-object visibility check plus translation into the wire event name.
fn translate(record: &EventRecord, gr: &GroupResource, access: &AccessSet) -> Option<ServerMessage> {
    let object = record.object.as_ref().or(record.prev_object.as_ref())?;
    let namespace = object.get("metadata").and_then(|m| m.get("namespace")).and_then(|v| v.as_str());
    let name = object.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or("");

    if !access.is_passthrough(WATCH_VERB, gr) && !access.grants(WATCH_VERB, gr, namespace, name) {
        return None;
    }

    let name = match record.kind {
        EventKind::Add => EventName::ResourceCreate,
        EventKind::Change => EventName::ResourceChange,
        EventKind::Remove => EventName::ResourceRemove,
    };
    Some(ServerMessage { name, resource_type: String::new(), object: object.clone() })
}

async fn send(tx: &mpsc::Sender<Message>, msg: ServerMessage) -> Result<(), ()> {
    let body = serde_json::to_string(&msg).map_err(|_| ())?;
    tx.send(Message::Text(body)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use steve_access::{compute_access_set, RbacInputs, User};

    fn empty_access(user: &User) -> AccessSet {
        compute_access_set(user, &RbacInputs { role_bindings: &[], cluster_role_bindings: &[], roles: &[], cluster_roles: &[] })
    }

    #[test]
    fn subscription_denied_with_no_grants() {
        let user = User::new("alice", vec![]);
        let access = empty_access(&user);
        let gr = GroupResource::new("", "pods");
        assert!(!subscription_allowed(&access, &gr));
    }

    #[test]
    fn translate_drops_event_for_invisible_object() {
        let user = User::new("alice", vec![]);
        let access = empty_access(&user);
        let gr = GroupResource::new("", "pods");
        let record = EventRecord {
            seq: 1,
            kind: EventKind::Add,
            key: "default/web".into(),
            object: Some(serde_json::json!({"metadata": {"name": "web", "namespace": "default"}})),
            prev_object: None,
            rv: Some("10".into()),
        };
        assert!(translate(&record, &gr, &access).is_none());
    }

    #[test]
    fn translate_maps_event_kinds_to_wire_names() {
        let record = EventRecord {
            seq: 1,
            kind: EventKind::Remove,
            key: "default/web".into(),
            object: None,
            prev_object: Some(serde_json::json!({"metadata": {"name": "web", "namespace": "default"}})),
            rv: None,
        };
        // A passthrough access set (no grants at all) still denies; this
        // just exercises the remove-uses-prev_object fallback path by
        // checking the filter sees a namespace/name to evaluate against.
        let user = User::new("alice", vec![]);
        let access = empty_access(&user);
        let gr = GroupResource::new("", "pods");
        assert!(translate(&record, &gr, &access).is_none());
    }
}

//! Subscription Registry: per-user set of live transport handles, with
//! bus-subscription lifetime tied to "does this user have any handle right
//! now" and a forced 15-minute session ceiling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify, RwLock};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::model::UserId;

use self::metrics::ONLINE_USERS;

mod metrics {
    use lazy_static::lazy_static;
    use prometheus::IntGauge;

    lazy_static! {
        /// Sum of live handle-set sizes across the whole registry.
        pub static ref ONLINE_USERS: IntGauge = IntGauge::new(
            "chat_group_channel_online_users",
            "Sum of live transport handles across all users in the Subscription Registry",
        )
        .expect("metric name/help are valid");
    }
}

/// Which transport a handle speaks. The registry and Dispatch Loop are
/// agnostic to this — it exists only for observability and for the
/// `gateway` module that constructs handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Sse,
    Ws,
}

/// A live transport endpoint delivering messages to one client session.
/// `Registered -> Active -> Closed`; `Closed` is terminal and idempotent,
/// enforced by `closed` below.
#[derive(Clone)]
pub struct Handle {
    pub id: Uuid,
    pub kind: HandleKind,
    sender: mpsc::UnboundedSender<String>,
    close_signal: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl Handle {
    /// Construct a handle and the receiver its transport task should drain.
    /// The transport task is expected to `select!` between `rx.recv()` and
    /// `close_signal.notified()` so a forced close (timeout, server
    /// shutdown) ends the loop even with no inbound traffic.
    pub fn new(kind: HandleKind) -> (Self, mpsc::UnboundedReceiver<String>, Arc<Notify>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let close_signal = Arc::new(Notify::new());
        let handle = Handle {
            id: Uuid::now_v7(),
            kind,
            sender: tx,
            close_signal: close_signal.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx, close_signal)
    }

    /// Send a text payload to this handle's transport. Fails if the
    /// transport's receiving task has already ended.
    pub fn send_text(&self, text: String) -> Result<(), ()> {
        self.sender.send(text).map_err(|_| ())
    }

    /// Idempotent: a second call is a documented no-op.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.close_signal.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Handle {}

#[derive(Default)]
struct UserEntry {
    handles: Vec<Handle>,
    /// The Dispatch Loop task draining this user's bus subscription.
    /// `None` only during the brief window before the first subscribe
    /// completes its bus handshake.
    dispatch_task: Option<tokio::task::JoinHandle<()>>,
}

/// Process-scoped singleton: pass it explicitly, no hidden globals.
/// Cheaply cloneable — all clones share the same underlying map via `Arc`.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    entries: Arc<RwLock<HashMap<Uuid, UserEntry>>>,
    bus: Arc<dyn MessageBus>,
    session_max_duration: Duration,
}

impl SubscriptionRegistry {
    pub fn new(bus: Arc<dyn MessageBus>, session_max_duration: Duration) -> Self {
        SubscriptionRegistry {
            entries: Arc::new(RwLock::new(HashMap::new())),
            bus,
            session_max_duration,
        }
    }

    /// Register `handle` as live for `user`. The first handle for a user
    /// opens a bus subscription.
    ///
    /// Atomic with respect to other registry operations on this `user`: the
    /// membership-set mutation and the bus-subscribe decision happen while
    /// holding the same write lock, so two concurrent first-subscribers for
    /// the same user can never both decide "I was first".
    pub async fn subscribe(&self, user: UserId, handle: Handle) {
        let became_first = {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(user.0).or_default();
            let was_empty = entry.handles.is_empty();
            entry.handles.push(handle.clone());
            was_empty
        };

        ONLINE_USERS.inc();

        if became_first {
            let subscription = self.bus.subscribe(&crate::subject::encode(user)).await;
            let task = crate::dispatch::spawn(subscription, user, self.clone());
            let mut entries = self.entries.write().await;
            if let Some(entry) = entries.get_mut(&user.0) {
                entry.dispatch_task = Some(task);
            } else {
                // The user unsubscribed entirely before the bus handshake
                // finished; nothing left to attach the task to.
                task.abort();
            }
        }

        let registry = self.clone();
        let max_duration = self.session_max_duration;
        let handle_for_timeout = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(max_duration).await;
            if !handle_for_timeout.is_closed() {
                registry.unsubscribe(user, handle_for_timeout.id).await;
            }
        });
    }

    /// Remove a handle for `user`. The last handle leaving a user closes its
    /// bus subscription.
    pub async fn unsubscribe(&self, user: UserId, handle_id: Uuid) {
        let (removed, became_empty, dispatch_task) = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(&user.0) else {
                return;
            };
            let before = entry.handles.len();
            let mut removed_handle = None;
            entry.handles.retain(|h| {
                if h.id == handle_id {
                    removed_handle = Some(h.clone());
                    false
                } else {
                    true
                }
            });
            let became_empty = entry.handles.is_empty();
            let dispatch_task = if became_empty {
                entries.remove(&user.0).and_then(|e| e.dispatch_task)
            } else {
                None
            };
            (removed_handle, became_empty && before != 0, dispatch_task)
        };

        let Some(handle) = removed else {
            return;
        };
        handle.close();
        ONLINE_USERS.dec();

        if became_empty {
            if let Some(task) = dispatch_task {
                task.abort();
            }
            self.bus.unsubscribe(&crate::subject::encode(user)).await;
        }
    }

    /// Fan `payload` out to every live handle for `user`.
    ///
    /// Snapshots the handle set before sending so concurrent
    /// subscribe/unsubscribe calls never race against an in-flight
    /// iteration. Sends run in parallel; a failed handle is logged and
    /// dropped via its own cleanup path rather than aborting the fan-out.
    pub async fn deliver(&self, user: UserId, payload: &str) {
        let handles = {
            let entries = self.entries.read().await;
            entries
                .get(&user.0)
                .map(|e| e.handles.clone())
                .unwrap_or_default()
        };

        let sends = handles.into_iter().map(|handle| {
            let payload = payload.to_owned();
            let registry = self.clone();
            async move {
                if handle.send_text(payload).is_err() {
                    tracing::warn!(
                        user_id = %user,
                        handle_id = %handle.id,
                        "transport send failed; dropping handle"
                    );
                    registry.unsubscribe(user, handle.id).await;
                }
            }
        });

        futures::future::join_all(sends).await;
    }

    /// Number of live handles for `user` — used by tests and by `stop()`.
    pub async fn handle_count(&self, user: UserId) -> usize {
        self.entries
            .read()
            .await
            .get(&user.0)
            .map(|e| e.handles.len())
            .unwrap_or(0)
    }

    /// Close every live handle and drop every entry. Intended for an
    /// explicit server-shutdown lifecycle rather than relying on process
    /// exit.
    pub async fn stop(&self) {
        let mut entries = self.entries.write().await;
        for (_, entry) in entries.drain() {
            for handle in entry.handles {
                handle.close();
                ONLINE_USERS.dec();
            }
        }
    }
}

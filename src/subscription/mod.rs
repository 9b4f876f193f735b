// Subscription registry: channel-scoped fan-out for passive listeners.
//
// Listeners register a callback per channel. Messages arrive on the
// registry's own queue from a StreamConnection, so a slow or failing
// listener never holds up the stream read loop, and one failing listener
// never stops delivery to the others.
//
// The connection is either supplied (shared with other consumers, never
// disconnected here) or created lazily on the first subscription (owned,
// disconnected by `close()`).

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bus::{BusApi, Message, TargetAddress, TargetType};
use crate::config::StreamConfig;
use crate::metrics::SUBSCRIPTION_CONNECTION;
use crate::stream::{StreamConnection, StreamEvent};

pub type Callback = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    channel_id: String,
    callback: Callback,
}

type Subscriptions = Arc<RwLock<BTreeMap<SubscriptionId, Subscription>>>;

struct Attached {
    connection: Arc<StreamConnection>,
    owned: bool,
    pump: Option<(CancellationToken, JoinHandle<()>)>,
}

pub struct SubscriptionRegistry {
    bus: Arc<dyn BusApi>,
    machine_id: String,
    stream_config: StreamConfig,
    attached: Mutex<Option<Attached>>,
    subscriptions: Subscriptions,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Registry that creates its own connection on first subscription.
    pub fn new(bus: Arc<dyn BusApi>, machine_id: impl Into<String>, stream_config: StreamConfig) -> Self {
        Self {
            bus,
            machine_id: machine_id.into(),
            stream_config,
            attached: Mutex::new(None),
            subscriptions: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registry sharing an existing connection.
    pub fn with_connection(bus: Arc<dyn BusApi>, connection: Arc<StreamConnection>) -> Self {
        Self {
            bus,
            machine_id: connection.machine_id().to_string(),
            stream_config: StreamConfig::default(),
            attached: Mutex::new(Some(Attached {
                connection,
                owned: false,
                pump: None,
            })),
            subscriptions: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register interest in `channel_id`. The first subscription attaches
    /// to (or creates) the connection.
    pub async fn subscribe<F>(&self, channel_id: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let channel_id = channel_id.into();
        debug!(channel_id = %channel_id, id = id.0, "subscribed");
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                Subscription {
                    channel_id,
                    callback: Arc::new(callback),
                },
            );
        self.ensure_pump().await;
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Deliver `message` to every subscriber of its channel. Returns how
    /// many callbacks completed successfully.
    pub fn dispatch(&self, message: &Message) -> usize {
        dispatch(&self.subscriptions, message)
    }

    /// The connection in use, if one is attached.
    pub async fn connection(&self) -> Option<Arc<StreamConnection>> {
        self.attached.lock().await.as_ref().map(|a| a.connection.clone())
    }

    /// Stop fan-out. An owned connection is disconnected and dropped; a
    /// shared one stays attached and running for its other consumers, so a
    /// later `subscribe` reuses it.
    pub async fn close(&self) {
        let mut slot = self.attached.lock().await;
        let Some(attached) = slot.as_mut() else {
            return;
        };
        if let Some((cancel, pump)) = attached.pump.take() {
            cancel.cancel();
            let _ = pump.await;
        }
        if attached.owned {
            attached.connection.disconnect().await;
            *slot = None;
        }
    }

    async fn ensure_pump(&self) {
        let mut slot = self.attached.lock().await;
        let attached = slot.get_or_insert_with(|| Attached {
            connection: Arc::new(
                StreamConnection::new(
                    self.bus.clone(),
                    self.machine_id.clone(),
                    self.stream_config.clone(),
                )
                .with_metrics_label(SUBSCRIPTION_CONNECTION),
            ),
            owned: true,
            pump: None,
        });
        if attached.pump.is_some() {
            return;
        }

        let mut events = attached.connection.subscribe();
        let cancel = CancellationToken::new();
        let subscriptions = self.subscriptions.clone();
        let token = cancel.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(StreamEvent::Message(message)) => {
                            dispatch(&subscriptions, &message);
                        }
                        Some(StreamEvent::Status(status)) => {
                            debug!(?status, "subscription stream status");
                        }
                        None => break,
                    },
                }
            }
        });
        attached.pump = Some((cancel, pump));

        if attached.owned {
            attached.connection.connect().await;
        }
    }
}

fn channel_of(message: &Message) -> Option<String> {
    if let Some(channel) = &message.channel_id {
        return Some(channel.clone());
    }
    (message.target_type == TargetType::Channel)
        .then(|| TargetAddress::parse(&message.target_address).key)
}

fn dispatch(subscriptions: &Subscriptions, message: &Message) -> usize {
    let Some(channel) = channel_of(message) else {
        return 0;
    };

    // Clone the matching callbacks out so none runs under the lock.
    let targets: Vec<(SubscriptionId, Callback)> = subscriptions
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .filter(|(_, sub)| sub.channel_id == channel)
        .map(|(id, sub)| (*id, sub.callback.clone()))
        .collect();

    let mut delivered = 0;
    for (id, callback) in targets {
        match catch_unwind(AssertUnwindSafe(|| callback(message))) {
            Ok(Ok(())) => delivered += 1,
            Ok(Err(e)) => {
                warn!(subscription = id.0, message_id = %message.id, error = %e, "subscriber failed")
            }
            Err(_) => {
                error!(subscription = id.0, message_id = %message.id, "subscriber panicked")
            }
        }
    }
    delivered
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use gcs_fc::{TelemetryStore, UpdateSink};
use tracing::{debug, info, warn};

use crate::registry::{Payload, Registry, Subscriber, SubscriberId};
use crate::{FanoutError, DEFAULT_PUSH_TIMEOUT};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    /// False when there was nobody to send to.
    pub serialized: bool,
}

/// Pushes the current snapshot to every registered subscriber.
#[derive(Debug)]
pub struct Fanout {
    store: Arc<TelemetryStore>,
    registry: Arc<Registry>,
    push_timeout: Duration,
}

impl Fanout {
    pub fn new(store: Arc<TelemetryStore>, registry: Arc<Registry>) -> Self {
        Self { store, registry, push_timeout: DEFAULT_PUSH_TIMEOUT }
    }

    pub fn with_push_timeout(mut self, push_timeout: Duration) -> Self {
        self.push_timeout = push_timeout;
        self
    }

    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Serializes the snapshot once and offers it to every subscriber.
    /// Subscribers whose push fails are unregistered afterwards. Never fails.
    pub async fn broadcast(&self) -> BroadcastReport {
        let subs = self.registry.current_subscribers();
        if subs.is_empty() {
            return BroadcastReport::default();
        }

        let payload = snapshot_payload(&self.store);
        let results = join_all(subs.iter().map(|(id, sub)| self.push(*id, sub, payload.clone()))).await;

        let mut report = BroadcastReport { serialized: true, ..Default::default() };
        for res in results {
            match res {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    let id = match e {
                        FanoutError::SubscriberClosed(id) | FanoutError::PushTimeout { id, .. } => id,
                        FanoutError::Serialization(_) => continue,
                    };
                    debug!("fanout: {}", e);
                    if self.registry.unregister(id) {
                        info!("fanout: dropped {} ({} left)", id, self.registry.len());
                    }
                    report.dropped += 1;
                }
            }
        }
        report
    }

    async fn push(&self, id: SubscriberId, sub: &Subscriber, payload: Payload) -> Result<(), FanoutError> {
        match tokio::time::timeout(self.push_timeout, sub.sender().send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(FanoutError::SubscriberClosed(id)),
            Err(_) => Err(FanoutError::PushTimeout { id, timeout: self.push_timeout }),
        }
    }
}

impl UpdateSink for Fanout {
    fn state_changed(&self) -> impl Future<Output = anyhow::Result<()>> + Send {
        async move {
            self.broadcast().await;
            Ok(())
        }
    }
}

/// JSON of the current snapshot, `{}` if it cannot be serialized.
pub fn snapshot_payload(store: &TelemetryStore) -> Payload {
    match serde_json::to_string(&store.snapshot()) {
        Ok(json) => Payload::from(json),
        Err(e) => {
            warn!("fanout: {}", FanoutError::Serialization(e.to_string()));
            Payload::from("{}")
        }
    }
}

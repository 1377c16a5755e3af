//! Discovery bridge: keeps the endpoint pool in sync with a service registry.
//!
//! Registry keys end in `/{module}/{address}`; everything before the last two
//! segments is a namespace prefix.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::pool::{Dialer, EndpointPool, Module};

/// A key change observed on the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub value: String,
    pub is_delete: bool,
}

impl WatchEvent {
    #[must_use]
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            is_delete: false,
        }
    }

    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: String::new(),
            is_delete: true,
        }
    }
}

pub type WatchCallback = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// External key/value registry with prefix watches.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn register(&self, registration: &Registration) -> anyhow::Result<()>;

    async fn unregister(&self, registration: &Registration) -> anyhow::Result<()>;

    /// Deliver every key under `prefix` to `on_event` until `cancel` fires.
    ///
    /// Returns once the watch is established; keys already present are
    /// delivered as puts.
    async fn watch(
        &self,
        cancel: CancellationToken,
        prefix: &str,
        on_event: WatchCallback,
    ) -> anyhow::Result<()>;
}

/// How a server announces itself to the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub app_id: String,
    pub end_type: String,
    pub module: Module,
    pub name: String,
    pub host: String,
    pub ttl: Duration,
}

impl Registration {
    /// Namespace shared by every server of the app and end type.
    #[must_use]
    pub fn prefix(&self) -> String {
        format!("/{}/rpc/{}", self.app_id, self.end_type)
    }

    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.prefix(), self.module, self.host)
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.host
    }
}

/// Split a registry key into `(module, address)` from its last two segments.
#[must_use]
pub fn parse_endpoint_key(key: &str) -> Option<(Module, String)> {
    let mut segments = key.rsplit('/');
    let address = segments.next().filter(|s| !s.is_empty())?;
    let module = segments.next().filter(|s| !s.is_empty())?;
    Some((Module::from(module), address.to_owned()))
}

/// Applies registry watch events to an [`EndpointPool`].
pub struct DiscoveryBridge<D: Dialer> {
    pool: Arc<EndpointPool<D>>,
}

impl<D: Dialer> Clone for DiscoveryBridge<D> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<D: Dialer> DiscoveryBridge<D> {
    #[must_use]
    pub fn new(pool: Arc<EndpointPool<D>>) -> Self {
        Self { pool }
    }

    /// Add or remove the endpoint named by `event.key`. Malformed keys are ignored.
    pub fn apply(&self, event: &WatchEvent) {
        let Some((module, address)) = parse_endpoint_key(&event.key) else {
            tracing::warn!(key = %event.key, "ignoring malformed rpc registry key");
            return;
        };
        if event.is_delete {
            tracing::info!(module = %module, address, "rpc endpoint gone");
            self.pool.remove(&module, &address);
        } else {
            tracing::info!(module = %module, address, "rpc endpoint discovered");
            self.pool.add(&module, &address);
        }
    }

    /// Watch `prefix` on `registry` and apply every event until `cancel` fires.
    ///
    /// # Errors
    /// Fails if the watch cannot be established.
    pub async fn start(
        &self,
        registry: &dyn ServiceRegistry,
        cancel: CancellationToken,
        prefix: &str,
    ) -> anyhow::Result<()> {
        let bridge = self.clone();
        registry
            .watch(cancel, prefix, Arc::new(move |event| bridge.apply(&event)))
            .await
    }
}

impl<D: Dialer> fmt::Debug for DiscoveryBridge<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryBridge")
            .field("pool", &self.pool)
            .finish()
    }
}

const WATCH_CHANNEL_CAPACITY: usize = 256;

/// In-process registry for single-process deployments and tests.
///
/// Registration TTLs are not enforced.
pub struct MemoryRegistry {
    entries: Mutex<BTreeMap<String, String>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    /// Current value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    /// Keys currently stored under `prefix`.
    #[must_use]
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        let event = WatchEvent::put(key, value);
        self.entries
            .lock()
            .insert(event.key.clone(), event.value.clone());
        self.publish(event);
    }

    pub fn delete(&self, key: &str) {
        if self.entries.lock().remove(key).is_some() {
            self.publish(WatchEvent::delete(key));
        }
    }

    fn publish(&self, event: WatchEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("no active registry watchers");
        }
    }
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn register(&self, registration: &Registration) -> anyhow::Result<()> {
        self.put(registration.key(), registration.value());
        Ok(())
    }

    async fn unregister(&self, registration: &Registration) -> anyhow::Result<()> {
        self.delete(&registration.key());
        Ok(())
    }

    async fn watch(
        &self,
        cancel: CancellationToken,
        prefix: &str,
        on_event: WatchCallback,
    ) -> anyhow::Result<()> {
        let mut rx = self.events.subscribe();
        let existing: Vec<(String, String)> = self
            .entries
            .lock()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in existing {
            on_event(WatchEvent::put(key, value));
        }

        let prefix = prefix.to_owned();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) if event.key.starts_with(&prefix) => on_event(event),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, prefix = %prefix, "registry watch lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!(prefix = %prefix, "registry watch stopped");
        });
        Ok(())
    }
}

impl fmt::Debug for MemoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegistry")
            .field("entries", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn key_splits_on_last_two_segments() {
        assert_eq!(
            parse_endpoint_key("/A1/rpc/backend/auth/10.0.0.5:7001"),
            Some((Module::from("auth"), "10.0.0.5:7001".to_owned()))
        );
        assert_eq!(
            parse_endpoint_key("auth/h:1"),
            Some((Module::from("auth"), "h:1".to_owned()))
        );
        assert_eq!(parse_endpoint_key("lonely"), None);
        assert_eq!(parse_endpoint_key("/auth/"), None);
        assert_eq!(parse_endpoint_key(""), None);
    }

    #[test]
    fn registration_key_layout() {
        let reg = Registration {
            app_id: "A1".to_owned(),
            end_type: "backend".to_owned(),
            module: Module::from("auth"),
            name: "auth-1".to_owned(),
            host: "10.0.0.5:7001".to_owned(),
            ttl: Duration::from_secs(10),
        };
        assert_eq!(reg.prefix(), "/A1/rpc/backend");
        assert_eq!(reg.key(), "/A1/rpc/backend/auth/10.0.0.5:7001");
        assert_eq!(reg.value(), "10.0.0.5:7001");
        assert_eq!(
            parse_endpoint_key(&reg.key()),
            Some((reg.module.clone(), reg.host.clone()))
        );
    }

    #[tokio::test]
    async fn memory_watch_replays_then_follows() {
        let registry = MemoryRegistry::new();
        registry.put("/A1/rpc/backend/auth/h:1", "h:1");
        registry.put("/OTHER/rpc/backend/auth/h:9", "h:9");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        registry
            .watch(
                cancel.clone(),
                "/A1/rpc/backend",
                Arc::new(move |event| {
                    tx.send(event).ok();
                }),
            )
            .await
            .expect("watch");

        assert_eq!(
            rx.recv().await,
            Some(WatchEvent::put("/A1/rpc/backend/auth/h:1", "h:1"))
        );

        registry.put("/OTHER/rpc/backend/auth/h:8", "h:8");
        registry.delete("/A1/rpc/backend/auth/h:1");
        assert_eq!(
            rx.recv().await,
            Some(WatchEvent::delete("/A1/rpc/backend/auth/h:1"))
        );

        cancel.cancel();
        assert_eq!(rx.recv().await, None, "watch task drops the callback on cancel");
    }
}

//! Endpoint registry and connection pool.
//!
//! Maps module name to the set of known addresses, and each address to lazily
//! dialed connections keyed by slot. A connection for a given
//! `(module, address, slot)` is dialed at most once concurrently; the registry
//! lock is never held across a dial.

use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::OnceCell;
use tracing::Instrument;

use crate::error::RpcError;

/// Connection slot index under one address.
pub type Slot = u32;

/// Slot used by module-addressed calls.
pub const DEFAULT_SLOT: Slot = 1;

/// Logical service name used for routing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Module(String);

impl Module {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Module {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for Module {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl AsRef<str> for Module {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Module {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A dialed connection able to carry unary invocations.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Invoke `path` (e.g. `/auth.Auth/Check`) with a single request message.
    async fn unary<Req, Resp>(
        &self,
        request: tonic::Request<Req>,
        path: &str,
    ) -> Result<tonic::Response<Resp>, tonic::Status>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + 'static;

    /// Stop accepting invocations. Must be idempotent.
    fn close(&self);
}

/// Opens connections to addresses.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: Connection;

    async fn dial(&self, address: &str) -> anyhow::Result<Self::Conn>;
}

type SlotCell<C> = Arc<OnceCell<Arc<C>>>;
type AddressSlots<C> = HashMap<Slot, SlotCell<C>>;
type ModuleAddresses<C> = HashMap<String, AddressSlots<C>>;

/// Registry of module addresses with lazily dialed pooled connections.
pub struct EndpointPool<D: Dialer> {
    dialer: D,
    modules: Mutex<HashMap<Module, ModuleAddresses<D::Conn>>>,
}

impl<D: Dialer> EndpointPool<D> {
    #[must_use]
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            modules: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Register `address` for `module`. No connection is opened.
    pub fn add(&self, module: &Module, address: &str) {
        let mut modules = self.modules.lock();
        let addresses = modules.entry(module.clone()).or_default();
        if !addresses.contains_key(address) {
            addresses.insert(address.to_owned(), HashMap::new());
            tracing::debug!(module = %module, address, "rpc address added");
        }
    }

    /// Forget `address` for `module` and close its pooled connections.
    ///
    /// Unknown modules and addresses are ignored.
    pub fn remove(&self, module: &Module, address: &str) {
        let removed = {
            let mut modules = self.modules.lock();
            modules
                .get_mut(module)
                .and_then(|addresses| addresses.remove(address))
        };
        let Some(slots) = removed else {
            return;
        };
        let closed = close_cells(slots.into_values());
        tracing::debug!(module = %module, address, closed, "rpc address removed");
    }

    /// Addresses known for `module`; `None` when the module was never added.
    #[must_use]
    pub fn list_addresses(&self, module: &Module) -> Option<BTreeSet<String>> {
        self.modules
            .lock()
            .get(module)
            .map(|addresses| addresses.keys().cloned().collect())
    }

    /// A uniformly random address for `module`, or `None` if it has none.
    #[must_use]
    pub fn pick_random(&self, module: &Module) -> Option<String> {
        let modules = self.modules.lock();
        let addresses = modules.get(module)?;
        if addresses.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..addresses.len());
        addresses.keys().nth(idx).cloned()
    }

    /// Pooled connection for `(module, address, slot)`, dialing it on first use.
    ///
    /// Concurrent callers for the same key share one dial. A failed dial
    /// leaves no entry behind. If the address is removed while the dial is in
    /// flight, the fresh connection is closed and the call fails.
    ///
    /// # Errors
    /// [`RpcError::ConnectFailure`] when the address is not registered, the
    /// dial fails, or the address was removed mid-dial.
    pub async fn get_connection(
        &self,
        module: &Module,
        address: &str,
        slot: Slot,
    ) -> Result<Arc<D::Conn>, RpcError> {
        let cell = {
            let mut modules = self.modules.lock();
            let Some(slots) = modules
                .get_mut(module)
                .and_then(|addresses| addresses.get_mut(address))
            else {
                return Err(RpcError::connect_failure(
                    module,
                    address,
                    "address not registered",
                ));
            };
            Arc::clone(slots.entry(slot).or_default())
        };

        if let Some(conn) = cell.get() {
            return Ok(Arc::clone(conn));
        }

        let span = tracing::debug_span!("rpc_dial", module = %module, address, slot);
        let dialed = cell
            .get_or_try_init(|| async { self.dialer.dial(address).await.map(Arc::new) })
            .instrument(span)
            .await;

        match dialed {
            Ok(conn) => {
                let conn = Arc::clone(conn);
                if self.is_current(module, address, slot, &cell) {
                    Ok(conn)
                } else {
                    conn.close();
                    Err(RpcError::connect_failure(
                        module,
                        address,
                        "address removed while dialing",
                    ))
                }
            }
            Err(e) => {
                self.discard_empty(module, address, slot, &cell);
                tracing::warn!(module = %module, address, slot, error = %e, "rpc dial failed");
                Err(RpcError::connect_failure(module, address, format!("{e:#}")))
            }
        }
    }

    /// Close every pooled connection. Known addresses stay registered.
    ///
    /// Returns the number of connections closed.
    pub fn release_all(&self) -> usize {
        let cells: Vec<SlotCell<D::Conn>> = {
            let mut modules = self.modules.lock();
            modules
                .values_mut()
                .flat_map(HashMap::values_mut)
                .flat_map(|slots| slots.drain().map(|(_, cell)| cell))
                .collect()
        };
        let closed = close_cells(cells);
        tracing::info!(closed, "rpc connections released");
        closed
    }

    fn is_current(
        &self,
        module: &Module,
        address: &str,
        slot: Slot,
        cell: &SlotCell<D::Conn>,
    ) -> bool {
        self.modules
            .lock()
            .get(module)
            .and_then(|addresses| addresses.get(address))
            .and_then(|slots| slots.get(&slot))
            .is_some_and(|current| Arc::ptr_eq(current, cell))
    }

    fn discard_empty(&self, module: &Module, address: &str, slot: Slot, cell: &SlotCell<D::Conn>) {
        let mut modules = self.modules.lock();
        let Some(slots) = modules
            .get_mut(module)
            .and_then(|addresses| addresses.get_mut(address))
        else {
            return;
        };
        let stale = slots
            .get(&slot)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && current.get().is_none());
        if stale {
            slots.remove(&slot);
        }
    }
}

impl<D: Dialer> fmt::Debug for EndpointPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let modules = self.modules.lock();
        let mut map = f.debug_map();
        for (module, addresses) in modules.iter() {
            let addrs: BTreeSet<&str> = addresses.keys().map(String::as_str).collect();
            map.entry(&module.as_str(), &addrs);
        }
        map.finish()
    }
}

fn close_cells<C: Connection>(cells: impl IntoIterator<Item = SlotCell<C>>) -> usize {
    let mut closed = 0;
    for cell in cells {
        if let Some(conn) = cell.get() {
            conn.close();
            closed += 1;
        }
    }
    closed
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn module_borrows_as_str() {
        let mut map: HashMap<Module, u8> = HashMap::new();
        map.insert(Module::from("auth"), 1);
        assert_eq!(map.get("auth"), Some(&1));
        assert_eq!(Module::new(String::from("auth")).to_string(), "auth");
    }
}

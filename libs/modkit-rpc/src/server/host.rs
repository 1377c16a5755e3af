//! gRPC server host with a start-key lifecycle.
//!
//! `start(key)` serves until `close(key)` is called with the same key.
//! Starting again while serving and closing with a foreign key are no-ops.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::RoutesBuilder;
use tonic::transport::Server;

use super::router::{MethodRouter, ServiceName};

/// Deferred registration of one service on the server's routes.
pub struct ServiceInstaller {
    pub service_name: &'static str,
    pub register: Box<dyn FnOnce(&mut RoutesBuilder) + Send>,
}

impl ServiceInstaller {
    #[must_use]
    pub fn new<F>(service_name: &'static str, register: F) -> Self
    where
        F: FnOnce(&mut RoutesBuilder) + Send + 'static,
    {
        Self {
            service_name,
            register: Box::new(register),
        }
    }

    /// Installer for a [`MethodRouter`].
    #[must_use]
    pub fn router<S: ServiceName>(router: MethodRouter<S>) -> Self {
        Self::new(S::NAME, move |routes| {
            routes.add_service(router);
        })
    }
}

impl fmt::Debug for ServiceInstaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInstaller")
            .field("service_name", &self.service_name)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Initialized,
    Serving,
    Closed,
}

struct Lifecycle {
    state: ServerState,
    start_key: Option<String>,
    shutdown: Option<CancellationToken>,
    listener: Option<TcpListener>,
    installers: Vec<ServiceInstaller>,
}

/// Hosts registered services on a pre-bound TCP listener.
pub struct GrpcServer {
    local_addr: SocketAddr,
    lifecycle: Mutex<Lifecycle>,
}

impl GrpcServer {
    /// Host on an already bound listener.
    ///
    /// # Errors
    /// Fails if the listener's local address cannot be read.
    pub fn new(listener: TcpListener) -> anyhow::Result<Self> {
        let local_addr = listener.local_addr().context("read listener address")?;
        Ok(Self {
            local_addr,
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::Created,
                start_key: None,
                shutdown: None,
                listener: Some(listener),
                installers: Vec::new(),
            }),
        })
    }

    /// Bind `addr` and host on it.
    ///
    /// # Errors
    /// Fails if the address cannot be bound.
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind rpc listener on {addr}"))?;
        Self::new(listener)
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address peers dial, `host:port`.
    #[must_use]
    pub fn endpoint(&self) -> String {
        self.local_addr.to_string()
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        self.lifecycle.lock().state
    }

    /// Add a service. Only allowed before serving starts.
    ///
    /// # Errors
    /// Fails once serving has started or for a duplicate service name.
    pub fn register_service(&self, installer: ServiceInstaller) -> anyhow::Result<()> {
        let mut lc = self.lifecycle.lock();
        if !matches!(lc.state, ServerState::Created | ServerState::Initialized) {
            anyhow::bail!(
                "cannot register {} in state {:?}",
                installer.service_name,
                lc.state
            );
        }
        if lc
            .installers
            .iter()
            .any(|i| i.service_name == installer.service_name)
        {
            anyhow::bail!("Duplicate gRPC service detected: {}", installer.service_name);
        }
        tracing::debug!(service = installer.service_name, "rpc service registered");
        lc.installers.push(installer);
        Ok(())
    }

    /// Move from `Created` to `Initialized`.
    ///
    /// # Errors
    /// Fails once the server was closed.
    pub fn init(&self) -> anyhow::Result<()> {
        let mut lc = self.lifecycle.lock();
        match lc.state {
            ServerState::Created => {
                if lc.installers.is_empty() {
                    tracing::warn!("no rpc service registered");
                }
                lc.state = ServerState::Initialized;
                Ok(())
            }
            ServerState::Initialized | ServerState::Serving => Ok(()),
            ServerState::Closed => anyhow::bail!("rpc server already closed"),
        }
    }

    /// Serve until [`GrpcServer::close`] is called with `key`.
    ///
    /// Returns immediately when already started.
    ///
    /// # Errors
    /// Fails if the server was closed or the transport stops with an error.
    pub async fn start(&self, key: &str) -> anyhow::Result<()> {
        match self.begin(key)? {
            Some(serving) => self.run_serving(key, serving).await,
            None => Ok(()),
        }
    }

    /// Serve on a background task; `on_error` is told if serving fails.
    ///
    /// The start key is recorded before this returns, so a [`GrpcServer::close`]
    /// issued right after it always stops the task. The server is closed with
    /// `key` when serving ends.
    pub fn spawn<F>(self: &Arc<Self>, key: String, on_error: F) -> JoinHandle<()>
    where
        F: FnOnce(anyhow::Error) + Send + 'static,
    {
        let begun = self.begin(&key);
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let result = match begun {
                Ok(Some(serving)) => server.run_serving(&key, serving).await,
                Ok(None) => return,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                on_error(e);
            }
            server.close(&key);
        })
    }

    /// Claim the listener and installers under `key`.
    ///
    /// `None` when serving was already started.
    fn begin(&self, key: &str) -> anyhow::Result<Option<Serving>> {
        let mut lc = self.lifecycle.lock();
        if lc.start_key.is_some() {
            return Ok(None);
        }
        if lc.state == ServerState::Closed {
            anyhow::bail!("rpc server already closed");
        }
        let listener = lc
            .listener
            .take()
            .context("rpc listener already consumed")?;
        let shutdown = CancellationToken::new();
        lc.start_key = Some(key.to_owned());
        lc.shutdown = Some(shutdown.clone());
        lc.state = ServerState::Serving;
        Ok(Some(Serving {
            listener,
            installers: std::mem::take(&mut lc.installers),
            shutdown,
        }))
    }

    async fn run_serving(&self, key: &str, serving: Serving) -> anyhow::Result<()> {
        tracing::info!(
            addr = %self.local_addr,
            services = serving.installers.len(),
            "rpc server listening"
        );
        let result = serve(serving).await;

        let mut lc = self.lifecycle.lock();
        if lc.start_key.as_deref() == Some(key) {
            lc.start_key = None;
            lc.shutdown = None;
        }
        lc.state = ServerState::Closed;
        result
    }

    /// Stop serving if `key` is the key serving was started with.
    ///
    /// Returns whether the server was stopped.
    pub fn close(&self, key: &str) -> bool {
        let mut lc = self.lifecycle.lock();
        if lc.start_key.as_deref() != Some(key) {
            return false;
        }
        if let Some(shutdown) = lc.shutdown.take() {
            shutdown.cancel();
        }
        lc.start_key = None;
        lc.state = ServerState::Closed;
        tracing::info!(addr = %self.local_addr, "rpc server closed");
        true
    }
}

impl fmt::Debug for GrpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcServer")
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Serving {
    listener: TcpListener,
    installers: Vec<ServiceInstaller>,
    shutdown: CancellationToken,
}

/// Serve the installed routes. With no services every call answers
/// `UNIMPLEMENTED`.
async fn serve(serving: Serving) -> anyhow::Result<()> {
    let Serving {
        listener,
        installers,
        shutdown,
    } = serving;

    let mut names = HashSet::new();
    let mut routes_builder = RoutesBuilder::default();
    for installer in installers {
        if names.insert(installer.service_name) {
            (installer.register)(&mut routes_builder);
        }
    }

    let incoming = TcpListenerStream::new(listener);
    Server::builder()
        .add_routes(routes_builder.routes())
        .serve_with_incoming_shutdown(incoming, async move {
            shutdown.cancelled().await;
        })
        .await?;
    Ok(())
}

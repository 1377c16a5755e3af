//! An RPC node: one server, one call manager, and the registry glue that
//! announces the server and discovers peers.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::CallManager;
use crate::config::NodeConfig;
use crate::discovery::{DiscoveryBridge, Registration, ServiceRegistry};
use crate::pool::{Dialer, Module};
use crate::server::{GrpcServer, HandlerChain, ServiceInstaller};
use crate::transport::GrpcDialer;

/// Server plus client side of one module, wired to an optional registry.
pub struct RpcNode<D: Dialer = GrpcDialer> {
    config: NodeConfig,
    registration: Registration,
    /// Further modules announced under the same host.
    extra: Vec<Registration>,
    start_key: String,
    manager: Arc<CallManager<D>>,
    chain: Arc<HandlerChain>,
    server: Arc<GrpcServer>,
    registry: Option<Arc<dyn ServiceRegistry>>,
    watch_cancel: CancellationToken,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Dialer> RpcNode<D> {
    /// Assemble a node on a pre-bound listener.
    ///
    /// Logging after-hooks are appended to both `manager` and `chain`.
    ///
    /// # Errors
    /// Fails when `config.id` or `config.name` is empty, or the listener
    /// address cannot be read.
    pub fn new(
        config: NodeConfig,
        mut manager: CallManager<D>,
        mut chain: HandlerChain,
        listener: TcpListener,
        registry: Option<Arc<dyn ServiceRegistry>>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.id.is_empty(), "rpc node id must not be empty");
        anyhow::ensure!(!config.name.is_empty(), "rpc node name must not be empty");

        let server = Arc::new(GrpcServer::new(listener)?);
        let registration = Registration {
            app_id: config.app_id.clone(),
            end_type: config.end_type.clone(),
            module: Module::new(config.id.clone()),
            name: config.name.clone(),
            host: server.endpoint(),
            ttl: config.registration_ttl,
        };

        manager.register_after_handler(|call, request, reply, error| {
            if let Some(e) = error {
                tracing::error!(
                    method = call.method,
                    from = %call.header.from,
                    to = %call.module,
                    address = call.address,
                    request = ?request,
                    error = %e,
                    "rpc call failed"
                );
            } else {
                tracing::debug!(
                    method = call.method,
                    to = %call.module,
                    address = call.address,
                    request = ?request,
                    reply = ?reply,
                    "rpc call done"
                );
            }
        });
        chain.register_after(|call, request, reply, error| {
            if let Some(e) = error {
                tracing::error!(
                    method = call.method,
                    from = %call.header.from,
                    request_id = %call.header.request_id,
                    request = ?request,
                    error = %e,
                    "rpc handle failed"
                );
            } else {
                tracing::debug!(
                    method = call.method,
                    from = %call.header.from,
                    request = ?request,
                    reply = ?reply,
                    "rpc handle done"
                );
            }
        });

        Ok(Self {
            config,
            registration,
            extra: Vec::new(),
            start_key: uuid::Uuid::new_v4().to_string(),
            manager: Arc::new(manager),
            chain: Arc::new(chain),
            server,
            registry,
            watch_cancel: CancellationToken::new(),
            serve_task: Mutex::new(None),
        })
    }

    /// Bind `config.listen_addr` and assemble the node.
    ///
    /// # Errors
    /// See [`RpcNode::new`]; also fails when the address does not parse or bind.
    pub async fn bind(
        config: NodeConfig,
        manager: CallManager<D>,
        chain: HandlerChain,
        registry: Option<Arc<dyn ServiceRegistry>>,
    ) -> anyhow::Result<Self> {
        let addr: SocketAddr = config
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen_addr '{}'", config.listen_addr))?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind rpc listener on {addr}"))?;
        Self::new(config, manager, chain, listener, registry)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Announce this server under one more module `id`.
    ///
    /// The extra registration shares the node's app id, end type, host and
    /// TTL. Registering an id that is already announced only renames it. Takes
    /// effect on the next [`RpcNode::run`].
    ///
    /// # Errors
    /// Fails when `id` or `name` is empty.
    pub fn add_registration(
        &mut self,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> anyhow::Result<()> {
        let module = Module::new(id);
        let name = name.into();
        anyhow::ensure!(!module.as_str().is_empty(), "rpc registration id must not be empty");
        anyhow::ensure!(!name.is_empty(), "rpc registration name must not be empty");

        if self.registration.module == module {
            self.registration.name = name;
        } else if let Some(existing) = self.extra.iter_mut().find(|r| r.module == module) {
            existing.name = name;
        } else {
            self.extra.push(Registration {
                module,
                name,
                ..self.registration.clone()
            });
        }
        Ok(())
    }

    /// Every registration of this node, the primary one first.
    pub fn registrations(&self) -> impl Iterator<Item = &Registration> {
        std::iter::once(&self.registration).chain(&self.extra)
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<CallManager<D>> {
        &self.manager
    }

    /// Chain shared by every [`MethodRouter`](crate::MethodRouter) of this node.
    #[must_use]
    pub fn chain(&self) -> &Arc<HandlerChain> {
        &self.chain
    }

    #[must_use]
    pub fn server(&self) -> &Arc<GrpcServer> {
        &self.server
    }

    /// # Errors
    /// See [`GrpcServer::register_service`].
    pub fn register_service(&self, installer: ServiceInstaller) -> anyhow::Result<()> {
        self.server.register_service(installer)
    }

    /// Announce the server, start discovery and serve in the background.
    ///
    /// # Errors
    /// Fails if the server cannot initialize, registration fails or the
    /// registry watch cannot be established.
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!(id = %self.config.id, name = %self.config.name, "rpc node starting");
        self.server.init()?;

        if let Some(registry) = &self.registry {
            if self.config.register {
                for registration in self.registrations() {
                    registry
                        .register(registration)
                        .await
                        .with_context(|| format!("register {}", registration.key()))?;
                    tracing::info!(key = %registration.key(), "rpc node registered");
                }
            }
            DiscoveryBridge::new(Arc::clone(self.manager.pool()))
                .start(
                    registry.as_ref(),
                    self.watch_cancel.clone(),
                    &self.registration.prefix(),
                )
                .await
                .context("watch rpc registry")?;
        }

        let name = self.config.name.clone();
        let handle = self
            .server
            .spawn(self.start_key.clone(), move |e| {
                tracing::error!(name = %name, error = %e, "rpc server stopped with error");
            });
        *self.serve_task.lock() = Some(handle);
        tracing::info!(addr = %self.server.local_addr(), "rpc node serving");
        Ok(())
    }

    /// Unregister, stop discovery, close pooled connections and stop serving.
    pub async fn release(&self) {
        if let Some(registry) = &self.registry {
            if self.config.register {
                for registration in self.registrations() {
                    if let Err(e) = registry.unregister(registration).await {
                        tracing::warn!(
                            key = %registration.key(),
                            error = %e,
                            "rpc unregister failed"
                        );
                    }
                }
            }
        }
        self.watch_cancel.cancel();
        self.manager.release_all();
        self.server.close(&self.start_key);

        let handle = self.serve_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "rpc serve task ended abnormally");
            }
        }
        tracing::info!(id = %self.config.id, "rpc node released");
    }
}

impl<D: Dialer> fmt::Debug for RpcNode<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcNode")
            .field("config", &self.config)
            .field("registration", &self.registration)
            .field("extra", &self.extra)
            .field("server", &self.server)
            .field("has_registry", &self.registry.is_some())
            .finish_non_exhaustive()
    }
}

//! Client call wrapper: resolves a module to a pooled connection, builds the
//! call envelope, runs the caller's callback and lifts application errors out
//! of the response metadata.

use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::humantime_serde;
use crate::envelope::{
    build_call_context, normalize_call_timeout, CallContext, MetadataCapture, Scope,
    DEFAULT_CALL_TIMEOUT,
};
use crate::error::{ApplicationError, BoxError, ErrorBuilder, RpcError};
use crate::metadata::{decode_application_error, CallHeader, REQUEST_KIND_RPC};
use crate::pool::{Connection, Dialer, EndpointPool, Module, Slot, DEFAULT_SLOT};

/// Client-side call settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Deadline applied to each call, normalized on load.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// What an interceptor sees about the invocation in flight.
#[derive(Debug, Clone, Copy)]
pub struct ClientCall<'a> {
    pub method: &'a str,
    pub header: &'a CallHeader,
    pub module: &'a Module,
    pub address: &'a str,
    pub slot: Slot,
}

/// Runs before each invocation; an error aborts it.
pub type BeforeInterceptor =
    Arc<dyn Fn(&ClientCall<'_>, &dyn Debug) -> Result<(), RpcError> + Send + Sync>;

/// Observes each completed invocation: request, reply and error.
pub type AfterHandler = Arc<
    dyn Fn(&ClientCall<'_>, &dyn Debug, Option<&dyn Debug>, Option<&RpcError>) + Send + Sync,
>;

#[derive(Clone, Default)]
struct ClientHooks {
    before: Vec<BeforeInterceptor>,
    after: Vec<AfterHandler>,
    error_builder: Option<ErrorBuilder>,
}

impl ClientHooks {
    fn application_error(&self, capture: &MetadataCapture) -> Option<ApplicationError> {
        let err = decode_application_error(&capture.header)
            .or_else(|| decode_application_error(&capture.trailer))?;
        Some(self.build(err))
    }

    fn build(&self, err: ApplicationError) -> ApplicationError {
        match &self.error_builder {
            Some(builder) => {
                let inner = builder(err.code(), err.message(), err.status());
                err.with_source(inner)
            }
            None => err,
        }
    }
}

/// Issues module-addressed calls over an [`EndpointPool`].
///
/// Hook registration takes `&mut self` and is meant for startup; calls only
/// need `&self`, so a configured manager is shared behind an `Arc`.
pub struct CallManager<D: Dialer> {
    pool: Arc<EndpointPool<D>>,
    call_timeout: Duration,
    hooks: Arc<ClientHooks>,
}

impl<D: Dialer> CallManager<D> {
    #[must_use]
    pub fn new(dialer: D, config: &ClientConfig) -> Self {
        Self::with_pool(Arc::new(EndpointPool::new(dialer)), config)
    }

    #[must_use]
    pub fn with_pool(pool: Arc<EndpointPool<D>>, config: &ClientConfig) -> Self {
        Self {
            pool,
            call_timeout: normalize_call_timeout(config.call_timeout),
            hooks: Arc::new(ClientHooks::default()),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<EndpointPool<D>> {
        &self.pool
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Set the per-call deadline. Values under 10ns are taken as seconds.
    pub fn set_call_timeout(&mut self, timeout: Duration) {
        self.call_timeout = normalize_call_timeout(timeout);
    }

    /// Append an interceptor run before every invocation, in registration order.
    pub fn register_before_interceptor<F>(&mut self, interceptor: F)
    where
        F: Fn(&ClientCall<'_>, &dyn Debug) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.hooks).before.push(Arc::new(interceptor));
    }

    /// Append a handler run after every invocation, in registration order.
    pub fn register_after_handler<F>(&mut self, handler: F)
    where
        F: Fn(&ClientCall<'_>, &dyn Debug, Option<&dyn Debug>, Option<&RpcError>)
            + Send
            + Sync
            + 'static,
    {
        Arc::make_mut(&mut self.hooks).after.push(Arc::new(handler));
    }

    /// Build the inner error of every decoded [`ApplicationError`] with `builder`.
    pub fn set_application_error_builder<F>(&mut self, builder: F)
    where
        F: Fn(&str, &str, &str) -> BoxError + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.hooks).error_builder = Some(Arc::new(builder));
    }

    /// Close all pooled connections.
    pub fn release_all(&self) {
        self.pool.release_all();
    }

    /// Call the module named by `header.to` at a random known address.
    ///
    /// # Errors
    /// See [`CallManager::call_value`].
    pub async fn call<F, Fut>(
        &self,
        parent: &Scope,
        header: CallHeader,
        callback: Option<F>,
    ) -> Result<(), RpcError>
    where
        F: FnOnce(CallContext, ClientConn<D::Conn>) -> Fut,
        Fut: Future<Output = Result<(), RpcError>>,
    {
        self.call_value(parent, header, callback).await
    }

    /// Like [`CallManager::call`], returning the callback's value.
    ///
    /// # Errors
    /// [`RpcError::NoRoute`] when the module has no address,
    /// [`RpcError::ConnectFailure`] when no connection could be obtained,
    /// [`RpcError::NilCallback`] without a callback, the callback's own
    /// error, or [`RpcError::Application`] when the peer reported one.
    pub async fn call_value<T, F, Fut>(
        &self,
        parent: &Scope,
        header: CallHeader,
        callback: Option<F>,
    ) -> Result<T, RpcError>
    where
        F: FnOnce(CallContext, ClientConn<D::Conn>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let module = Module::new(header.to.clone());
        let Some(address) = self.pool.pick_random(&module) else {
            tracing::debug!(module = %module, "no rpc address for module");
            return Err(RpcError::NoRoute { module });
        };
        self.host_value_call(parent, &address, DEFAULT_SLOT, header, callback)
            .await
    }

    /// Call a specific address and slot of the module named by `header.to`.
    ///
    /// # Errors
    /// See [`CallManager::call_value`].
    pub async fn host_call<F, Fut>(
        &self,
        parent: &Scope,
        address: &str,
        slot: Slot,
        header: CallHeader,
        callback: Option<F>,
    ) -> Result<(), RpcError>
    where
        F: FnOnce(CallContext, ClientConn<D::Conn>) -> Fut,
        Fut: Future<Output = Result<(), RpcError>>,
    {
        self.host_value_call(parent, address, slot, header, callback)
            .await
    }

    /// Like [`CallManager::host_call`], returning the callback's value.
    ///
    /// # Errors
    /// See [`CallManager::call_value`].
    pub async fn host_value_call<T, F, Fut>(
        &self,
        parent: &Scope,
        address: &str,
        slot: Slot,
        header: CallHeader,
        callback: Option<F>,
    ) -> Result<T, RpcError>
    where
        F: FnOnce(CallContext, ClientConn<D::Conn>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let module = Module::new(header.to.clone());
        let conn = self.pool.get_connection(&module, address, slot).await?;
        let Some(callback) = callback else {
            return Err(RpcError::NilCallback);
        };

        let header = CallHeader {
            request_kind: REQUEST_KIND_RPC.to_owned(),
            ..header
        };
        let (ctx, _guard) = build_call_context(parent, header, self.call_timeout);
        let client = ClientConn {
            conn,
            module,
            address: address.to_owned(),
            slot,
            hooks: Arc::clone(&self.hooks),
        };

        let value = callback(ctx.clone(), client).await?;
        if let Some(err) = self.hooks.application_error(&ctx.captured()) {
            return Err(err.into());
        }
        Ok(value)
    }
}

impl<D: Dialer> Debug for CallManager<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallManager")
            .field("pool", &self.pool)
            .field("call_timeout", &self.call_timeout)
            .field("before", &self.hooks.before.len())
            .field("after", &self.hooks.after.len())
            .finish_non_exhaustive()
    }
}

/// Connection handed to a call callback.
pub struct ClientConn<C> {
    conn: Arc<C>,
    module: Module,
    address: String,
    slot: Slot,
    hooks: Arc<ClientHooks>,
}

impl<C> Clone for ClientConn<C> {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            module: self.module.clone(),
            address: self.address.clone(),
            slot: self.slot,
            hooks: Arc::clone(&self.hooks),
        }
    }
}

impl<C: Connection> ClientConn<C> {
    #[must_use]
    pub fn module(&self) -> &Module {
        &self.module
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// The underlying pooled connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<C> {
        &self.conn
    }

    /// Invoke `method` with the call's metadata and deadline.
    ///
    /// Response metadata is recorded into `ctx`. A transport success that
    /// carries `err_*` metadata is returned as [`RpcError::Application`].
    ///
    /// # Errors
    /// A before-interceptor's error, [`RpcError::Transport`] on transport
    /// failure, cancellation or deadline, or [`RpcError::Application`].
    pub async fn unary<Req, Resp>(
        &self,
        ctx: &CallContext,
        method: &str,
        message: Req,
    ) -> Result<Resp, RpcError>
    where
        Req: prost::Message + Debug + Clone + 'static,
        Resp: prost::Message + Debug + Default + 'static,
    {
        let call = ClientCall {
            method,
            header: ctx.header(),
            module: &self.module,
            address: &self.address,
            slot: self.slot,
        };
        for before in &self.hooks.before {
            before(&call, &message)?;
        }
        let observed = (!self.hooks.after.is_empty()).then(|| message.clone());

        let request = ctx.request(message);
        let outcome = tokio::select! {
            biased;
            () = ctx.token().cancelled() => Err(tonic::Status::cancelled("rpc call cancelled")),
            res = tokio::time::timeout_at(
                ctx.deadline().into(),
                self.conn.unary::<Req, Resp>(request, method),
            ) => res.unwrap_or_else(|_| {
                Err(tonic::Status::deadline_exceeded("rpc call deadline exceeded"))
            }),
        };

        let (reply, error) = match outcome {
            Ok(response) => {
                ctx.record_header(response.metadata());
                let err = decode_application_error(response.metadata())
                    .map(|err| RpcError::from(self.hooks.build(err)));
                (Some(response.into_inner()), err)
            }
            Err(status) => {
                ctx.record_trailer(status.metadata());
                (None, Some(RpcError::Transport(status)))
            }
        };

        if let Some(request) = &observed {
            for after in &self.hooks.after {
                after(
                    &call,
                    request,
                    reply.as_ref().map(|r| r as &dyn Debug),
                    error.as_ref(),
                );
            }
        }

        match error {
            Some(err) => Err(err),
            None => Ok(reply.unwrap_or_default()),
        }
    }
}

impl<C> Debug for ClientConn<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn")
            .field("module", &self.module)
            .field("address", &self.address)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// Callback type for calls that pass no callback.
pub type NoCallback<C, T> =
    fn(CallContext, ClientConn<C>) -> futures::future::Ready<Result<T, RpcError>>;

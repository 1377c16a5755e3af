//! A tonic service assembled from plain async handlers.
//!
//! Each method is decoded with the prost codec and runs through the shared
//! [`HandlerChain`]. Unknown methods answer `UNIMPLEMENTED`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tonic::body::Body;
use tonic::server::NamedService;

use super::chain::HandlerChain;

/// Fully-qualified gRPC service name, e.g. `auth.Auth`.
pub trait ServiceName: Send + Sync + 'static {
    const NAME: &'static str;
}

trait ErasedUnary: Send + Sync {
    fn call(
        &self,
        chain: Arc<HandlerChain>,
        request: http::Request<Body>,
    ) -> BoxFuture<'static, http::Response<Body>>;
}

struct UnaryMethod<Req, Resp, F> {
    path: Arc<str>,
    handler: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F, Fut> ErasedUnary for UnaryMethod<Req, Resp, F>
where
    Req: prost::Message + Debug + Default + Clone + 'static,
    Resp: prost::Message + Debug + Default + 'static,
    F: Fn(tonic::Request<Req>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
{
    fn call(
        &self,
        chain: Arc<HandlerChain>,
        request: http::Request<Body>,
    ) -> BoxFuture<'static, http::Response<Body>> {
        let svc = ChainedUnary {
            chain,
            path: Arc::clone(&self.path),
            handler: self.handler.clone(),
            _types: PhantomData::<fn(Req) -> Resp>,
        };
        Box::pin(async move {
            let codec = tonic_prost::ProstCodec::<Resp, Req>::default();
            let mut grpc = tonic::server::Grpc::new(codec);
            grpc.unary(svc, request).await
        })
    }
}

struct ChainedUnary<Req, Resp, F> {
    chain: Arc<HandlerChain>,
    path: Arc<str>,
    handler: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F, Fut> tonic::server::UnaryService<Req> for ChainedUnary<Req, Resp, F>
where
    Req: prost::Message + Debug + Default + Clone + 'static,
    Resp: prost::Message + Debug + Default + 'static,
    F: Fn(tonic::Request<Req>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
{
    type Response = Resp;
    type Future = BoxFuture<'static, Result<tonic::Response<Resp>, tonic::Status>>;

    fn call(&mut self, request: tonic::Request<Req>) -> Self::Future {
        let chain = Arc::clone(&self.chain);
        let path = Arc::clone(&self.path);
        let handler = self.handler.clone();
        Box::pin(async move { chain.unary(&path, request, handler).await })
    }
}

/// Service named `S::NAME` routing each method path to its handler.
pub struct MethodRouter<S> {
    chain: Arc<HandlerChain>,
    methods: Arc<HashMap<String, Arc<dyn ErasedUnary>>>,
    _service: PhantomData<fn() -> S>,
}

impl<S> Clone for MethodRouter<S> {
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
            methods: Arc::clone(&self.methods),
            _service: PhantomData,
        }
    }
}

impl<S: ServiceName> MethodRouter<S> {
    #[must_use]
    pub fn new(chain: Arc<HandlerChain>) -> Self {
        Self {
            chain,
            methods: Arc::new(HashMap::new()),
            _service: PhantomData,
        }
    }

    /// Route `/{S::NAME}/{method}` to `handler`.
    #[must_use]
    pub fn unary<Req, Resp, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        Req: prost::Message + Debug + Default + Clone + 'static,
        Resp: prost::Message + Debug + Default + 'static,
        F: Fn(tonic::Request<Req>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        let path = format!("/{}/{}", S::NAME, method);
        let entry = UnaryMethod {
            path: Arc::from(path.as_str()),
            handler,
            _types: PhantomData::<fn(Req) -> Resp>,
        };
        Arc::make_mut(&mut self.methods).insert(path, Arc::new(entry));
        self
    }

    /// Full method paths served by this router.
    #[must_use]
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }
}

impl<S: ServiceName> NamedService for MethodRouter<S> {
    const NAME: &'static str = S::NAME;
}

impl<S: ServiceName> tower::Service<http::Request<Body>> for MethodRouter<S> {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        match self.methods.get(request.uri().path()) {
            Some(method) => {
                let fut = method.call(Arc::clone(&self.chain), request);
                Box::pin(async move { Ok(fut.await) })
            }
            None => {
                tracing::debug!(path = request.uri().path(), "unknown rpc method");
                Box::pin(async move {
                    Ok(tonic::Status::unimplemented("method not found").into_http())
                })
            }
        }
    }
}

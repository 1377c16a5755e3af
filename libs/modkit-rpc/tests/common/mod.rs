//! Shared fixtures: a counting in-process dialer whose connections hand
//! encoded requests to a loopback server closure.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use modkit_rpc::{Connection, Dialer, HandlerChain};
use parking_lot::Mutex;
use prost::Message;

pub type LoopbackFuture = BoxFuture<'static, Result<tonic::Response<Vec<u8>>, tonic::Status>>;

pub type Loopback = Arc<dyn Fn(String, tonic::Request<Vec<u8>>) -> LoopbackFuture + Send + Sync>;

#[derive(Clone, PartialEq, prost::Message)]
pub struct CheckRequest {
    #[prost(string, tag = "1")]
    pub user_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CheckReply {
    #[prost(bool, tag = "1")]
    pub allowed: bool,
}

pub const CHECK: &str = "/auth.Auth/Check";

pub struct StubConnection {
    pub id: usize,
    pub address: String,
    closed: AtomicBool,
    loopback: Option<Loopback>,
}

impl StubConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for StubConnection {
    async fn unary<Req, Resp>(
        &self,
        request: tonic::Request<Req>,
        path: &str,
    ) -> Result<tonic::Response<Resp>, tonic::Status>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + 'static,
    {
        if self.is_closed() {
            return Err(tonic::Status::unavailable("connection closed"));
        }
        let Some(loopback) = &self.loopback else {
            return Err(tonic::Status::unimplemented("no loopback server"));
        };
        let request = request.map(|m| m.encode_to_vec());
        let response = loopback(path.to_owned(), request).await?;
        let (metadata, bytes, extensions) = response.into_parts();
        let reply = Resp::decode(bytes.as_slice())
            .map_err(|e| tonic::Status::internal(format!("decode reply: {e}")))?;
        Ok(tonic::Response::from_parts(metadata, reply, extensions))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Dialer recording every connection it creates.
#[derive(Default)]
pub struct StubDialer {
    pub dials: AtomicUsize,
    pub fail_next: AtomicUsize,
    pub delay: Mutex<Option<Duration>>,
    pub created: Mutex<Vec<Arc<StubConnection>>>,
    pub loopback: Mutex<Option<Loopback>>,
}

impl StubDialer {
    pub fn with_loopback(loopback: Loopback) -> Self {
        let dialer = Self::default();
        *dialer.loopback.lock() = Some(loopback);
        dialer
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn closed_count(&self) -> usize {
        self.created.lock().iter().filter(|c| c.is_closed()).count()
    }
}

/// Pool-owned handle sharing state with the dialer's record.
pub struct SharedStub(pub Arc<StubConnection>);

impl std::fmt::Debug for SharedStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStub")
            .field("id", &self.0.id)
            .field("address", &self.0.address)
            .field("closed", &self.0.is_closed())
            .finish()
    }
}

#[async_trait]
impl Connection for SharedStub {
    async fn unary<Req, Resp>(
        &self,
        request: tonic::Request<Req>,
        path: &str,
    ) -> Result<tonic::Response<Resp>, tonic::Status>
    where
        Req: prost::Message + 'static,
        Resp: prost::Message + Default + 'static,
    {
        self.0.unary::<Req, Resp>(request, path).await
    }

    fn close(&self) {
        self.0.close();
    }
}

#[async_trait]
impl Dialer for StubDialer {
    type Conn = SharedStub;

    async fn dial(&self, address: &str) -> anyhow::Result<SharedStub> {
        let id = self.dials.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            anyhow::bail!("connection refused by {address}");
        }
        let conn = Arc::new(StubConnection {
            id,
            address: address.to_owned(),
            closed: AtomicBool::new(false),
            loopback: self.loopback.lock().clone(),
        });
        self.created.lock().push(Arc::clone(&conn));
        Ok(SharedStub(conn))
    }
}

/// Loopback server for the auth check: user "42" is denied with
/// `("42", "denied", "403")`, everyone else allowed.
pub fn auth_loopback(chain: Arc<HandlerChain>, invocations: Arc<AtomicUsize>) -> Loopback {
    Arc::new(move |path: String, request: tonic::Request<Vec<u8>>| {
        let chain = Arc::clone(&chain);
        let invocations = Arc::clone(&invocations);
        async move {
            invocations.fetch_add(1, Ordering::SeqCst);
            if path != CHECK {
                return Err(tonic::Status::unimplemented(path));
            }
            let (metadata, extensions, bytes) = request.into_parts();
            let message = CheckRequest::decode(bytes.as_slice())
                .map_err(|e| tonic::Status::invalid_argument(e.to_string()))?;
            let request = tonic::Request::from_parts(metadata, extensions, message);

            let response = chain
                .unary(CHECK, request, |req| async move {
                    let user = req.into_inner().user_id;
                    if user == "42" {
                        return Err(anyhow::Error::from(modkit_rpc::ApplicationError::new(
                            "42", "denied", "403",
                        )));
                    }
                    if user == "slow" {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                    Ok::<_, anyhow::Error>(CheckReply { allowed: true })
                })
                .await?;
            Ok(response.map(|reply| reply.encode_to_vec()))
        }
        .boxed()
    })
}

//! Server-side handler chain: panic recovery, before/after hooks and
//! translation of handler errors into the `err_*` metadata side channel.
//!
//! A handler error never becomes a transport error. The response is always
//! transport-successful; failures travel as `err_code`, `err_message` and
//! `err_status` on the response headers.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt::{self, Debug};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Once};

use futures::FutureExt;
use tonic::metadata::MetadataMap;

use crate::error::{ApplicationError, RpcError};
use crate::metadata::{encode_application_error, CallHeader};

/// What a server hook sees about the call being handled.
#[derive(Debug, Clone, Copy)]
pub struct ServerCall<'a> {
    pub method: &'a str,
    pub header: &'a CallHeader,
    pub metadata: &'a MetadataMap,
}

/// Runs before the handler; an error short-circuits it.
pub type ServerBeforeHook =
    Arc<dyn Fn(&ServerCall<'_>, &dyn Debug) -> anyhow::Result<()> + Send + Sync>;

/// Observes each handled call: request, reply and error.
pub type ServerAfterHook = Arc<
    dyn Fn(&ServerCall<'_>, &dyn Debug, Option<&dyn Debug>, Option<&anyhow::Error>)
        + Send
        + Sync,
>;

/// Maps a handler error to the `(code, message, status)` triple put on the wire.
pub type ErrorParser = Arc<dyn Fn(&anyhow::Error) -> ApplicationError + Send + Sync>;

/// Told about every recovered panic with its message and backtrace.
pub type RecoveryHandler = Arc<dyn Fn(&str, &str, &Backtrace) + Send + Sync>;

thread_local! {
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

/// Chain a panic hook that records the backtrace of panics raised while a
/// handler is being polled on this thread.
fn install_panic_capture() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if IN_HANDLER.get() {
                PANIC_BACKTRACE.set(Some(Backtrace::force_capture()));
            }
            previous(info);
        }));
    });
}

/// Marks the current thread as polling a handler until dropped.
struct HandlerScope {
    outer: bool,
}

impl HandlerScope {
    fn enter() -> Self {
        Self {
            outer: IN_HANDLER.replace(true),
        }
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        IN_HANDLER.set(self.outer);
    }
}

/// Default parser: an [`ApplicationError`] keeps its own triple, anything
/// else becomes code `"1"`, status `"500"` with the error chain as message.
#[must_use]
pub fn default_error_parser(err: &anyhow::Error) -> ApplicationError {
    match err.downcast_ref::<ApplicationError>() {
        Some(app) => app.clone(),
        None => ApplicationError::internal(format!("{err:#}")),
    }
}

#[derive(Clone, Default)]
pub struct HandlerChain {
    before: Vec<ServerBeforeHook>,
    after: Vec<ServerAfterHook>,
    error_parser: Option<ErrorParser>,
    recovery: Option<RecoveryHandler>,
}

impl HandlerChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_before<F>(&mut self, hook: F)
    where
        F: Fn(&ServerCall<'_>, &dyn Debug) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.before.push(Arc::new(hook));
    }

    pub fn register_after<F>(&mut self, hook: F)
    where
        F: Fn(&ServerCall<'_>, &dyn Debug, Option<&dyn Debug>, Option<&anyhow::Error>)
            + Send
            + Sync
            + 'static,
    {
        self.after.push(Arc::new(hook));
    }

    pub fn set_error_parser<F>(&mut self, parser: F)
    where
        F: Fn(&anyhow::Error) -> ApplicationError + Send + Sync + 'static,
    {
        self.error_parser = Some(Arc::new(parser));
    }

    /// Replace the default panic logger. Receives `(method, panic, backtrace)`.
    pub fn set_recovery_handler<F>(&mut self, handler: F)
    where
        F: Fn(&str, &str, &Backtrace) + Send + Sync + 'static,
    {
        self.recovery = Some(Arc::new(handler));
    }

    /// Run `handler` for one unary call.
    ///
    /// Always returns `Ok`: on handler failure (including panics and before
    /// hook rejections) the response carries a default message and the
    /// encoded error metadata.
    ///
    /// # Errors
    /// Never; the `Result` matches tonic's unary service signature.
    pub async fn unary<Req, Resp, F, Fut>(
        &self,
        method: &str,
        request: tonic::Request<Req>,
        handler: F,
    ) -> Result<tonic::Response<Resp>, tonic::Status>
    where
        Req: Debug + Clone,
        Resp: Debug + Default,
        F: FnOnce(tonic::Request<Req>) -> Fut,
        Fut: Future<Output = anyhow::Result<Resp>>,
    {
        install_panic_capture();
        let mut run = std::pin::pin!(self.run(method, request, handler));
        let scoped = futures::future::poll_fn(|cx| {
            let _scope = HandlerScope::enter();
            run.as_mut().poll(cx)
        });
        let outcome = AssertUnwindSafe(scoped).catch_unwind().await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(self.recover(method, panic.as_ref())),
        };
        Ok(self.respond(method, result))
    }

    async fn run<Req, Resp, F, Fut>(
        &self,
        method: &str,
        request: tonic::Request<Req>,
        handler: F,
    ) -> anyhow::Result<Resp>
    where
        Req: Debug + Clone,
        Resp: Debug,
        F: FnOnce(tonic::Request<Req>) -> Fut,
        Fut: Future<Output = anyhow::Result<Resp>>,
    {
        let metadata = request.metadata().clone();
        let header = CallHeader::from_metadata(&metadata);
        let call = ServerCall {
            method,
            header: &header,
            metadata: &metadata,
        };

        for before in &self.before {
            if let Err(err) = before(&call, request.get_ref()) {
                self.observe(&call, request.get_ref(), None, Some(&err));
                return Err(err);
            }
        }

        let observed = (!self.after.is_empty()).then(|| request.get_ref().clone());
        let result = handler(request).await;
        if let Some(request) = &observed {
            self.observe(
                &call,
                request,
                result.as_ref().ok().map(|r| r as &dyn Debug),
                result.as_ref().err(),
            );
        }
        result
    }

    fn observe(
        &self,
        call: &ServerCall<'_>,
        request: &dyn Debug,
        reply: Option<&dyn Debug>,
        error: Option<&anyhow::Error>,
    ) {
        for after in &self.after {
            after(call, request, reply, error);
        }
    }

    fn recover(&self, method: &str, panic: &(dyn Any + Send)) -> anyhow::Error {
        let message = panic_message(panic);
        // The hook ran on this thread during the same poll.
        let backtrace = PANIC_BACKTRACE
            .take()
            .unwrap_or_else(Backtrace::force_capture);
        if let Some(handler) = &self.recovery {
            handler(method, &message, &backtrace);
        } else {
            tracing::error!(
                method,
                panic = %message,
                backtrace = %backtrace,
                "rpc handler panicked"
            );
        }
        RpcError::PanicRecovered { message }.into()
    }

    fn respond<Resp: Default>(
        &self,
        method: &str,
        result: anyhow::Result<Resp>,
    ) -> tonic::Response<Resp> {
        match result {
            Ok(reply) => tonic::Response::new(reply),
            Err(err) => {
                let app = match &self.error_parser {
                    Some(parser) => parser(&err),
                    None => default_error_parser(&err),
                };
                tracing::debug!(
                    method,
                    code = app.code(),
                    status = app.status(),
                    error = %app.message(),
                    "rpc handler failed"
                );
                let mut response = tonic::Response::new(Resp::default());
                encode_application_error(response.metadata_mut(), &app);
                response
            }
        }
    }
}

impl Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain")
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .field("custom_error_parser", &self.error_parser.is_some())
            .field("custom_recovery", &self.recovery.is_some())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

//! Error taxonomy shared by the client and server side of the call layer.

use std::fmt;
use std::sync::Arc;

use crate::metadata::{DEFAULT_ERR_CODE, DEFAULT_ERR_STATUS};
use crate::pool::Module;

/// Boxed error produced by a custom application error builder.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Builds the inner error of an [`ApplicationError`] from `(code, message, status)`.
pub type ErrorBuilder = Arc<dyn Fn(&str, &str, &str) -> BoxError + Send + Sync>;

/// Errors surfaced by the call layer.
///
/// Every variant is a distinct kind; callers branch with `matches!` or the
/// `is_*` helpers instead of inspecting messages.
#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error("no rpc addr for module '{module}'")]
    NoRoute { module: Module },

    #[error("fetch client failed for module '{module}' at '{address}': {reason}")]
    ConnectFailure {
        module: Module,
        address: String,
        reason: String,
    },

    #[error("callback is nil")]
    NilCallback,

    #[error(transparent)]
    Application(#[from] ApplicationError),

    #[error("rpc transport error: {0}")]
    Transport(#[from] tonic::Status),

    #[error("handle failed, err={message}")]
    PanicRecovered { message: String },

    #[error("rpc call rejected: {reason}")]
    Rejected { reason: String },
}

impl RpcError {
    pub(crate) fn connect_failure(
        module: &Module,
        address: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self::ConnectFailure {
            module: module.clone(),
            address: address.to_owned(),
            reason: reason.into(),
        }
    }

    /// Create a rejection error, typically returned from a before-interceptor.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_no_route(&self) -> bool {
        matches!(self, Self::NoRoute { .. })
    }

    #[must_use]
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Self::ConnectFailure { .. })
    }

    #[must_use]
    pub fn is_application(&self) -> bool {
        matches!(self, Self::Application(_))
    }

    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// The peer's application error, if this is one.
    #[must_use]
    pub fn application(&self) -> Option<&ApplicationError> {
        match self {
            Self::Application(app) => Some(app),
            _ => None,
        }
    }

    /// The transport status, if the transport itself failed.
    #[must_use]
    pub fn status(&self) -> Option<&tonic::Status> {
        match self {
            Self::Transport(status) => Some(status),
            _ => None,
        }
    }
}

/// A business-level failure carried in the `err_*` metadata side channel.
///
/// The transport reported success for the call; the peer encoded the failure
/// as `(code, message, status)`. When a custom builder is registered on the
/// client, the built error becomes the [`source`](std::error::Error::source)
/// and drives `Display`.
#[derive(Clone)]
pub struct ApplicationError {
    code: String,
    message: String,
    status: String,
    inner: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ApplicationError {
    #[must_use]
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: status.into(),
            inner: None,
        }
    }

    /// Application error with the default code `"1"` and status `"500"`.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(DEFAULT_ERR_CODE, message, DEFAULT_ERR_STATUS)
    }

    #[must_use]
    pub fn with_source(mut self, inner: BoxError) -> Self {
        self.inner = Some(Arc::from(inner));
        self
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn status(&self) -> &str {
        &self.status
    }

    /// The status parsed as a numeric (HTTP-like) code, if it is one.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        self.status.parse().ok()
    }
}

impl fmt::Debug for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("status", &self.status)
            .field("has_source", &self.inner.is_some())
            .finish()
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => write!(f, "{inner}"),
            None => write!(f, "{}[{} {}]", self.message, self.status, self.code),
        }
    }
}

impl std::error::Error for ApplicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl PartialEq for ApplicationError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.message == other.message && self.status == other.status
    }
}

impl Eq for ApplicationError {}

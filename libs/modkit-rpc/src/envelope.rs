//! Per-call envelope: cancellation scope, deadline, outgoing metadata and
//! the response metadata capture.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::metadata::MetadataMap;

use crate::metadata::CallHeader;

/// Timeout applied to a call when none is configured.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

const SECONDS_THRESHOLD_NANOS: u128 = 10;

/// Interpret tiny timeouts as whole seconds.
///
/// A value below 10ns is almost certainly a unitless seconds count that
/// slipped through, so `Duration::from_nanos(5)` becomes five seconds.
#[must_use]
pub fn normalize_call_timeout(timeout: Duration) -> Duration {
    if timeout.as_nanos() < SECONDS_THRESHOLD_NANOS {
        Duration::from_secs(u64::from(timeout.subsec_nanos()))
    } else {
        timeout
    }
}

/// Cancellation scope a call inherits from its caller.
#[derive(Clone, Debug, Default)]
pub struct Scope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Scope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Tighten the scope's deadline. An earlier existing deadline wins.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Response metadata observed by the last invocation made with a context.
///
/// For unary calls the transport folds trailers into the response metadata,
/// so `trailer` is only populated when the call failed at the transport level.
#[derive(Clone, Debug, Default)]
pub struct MetadataCapture {
    pub header: MetadataMap,
    pub trailer: MetadataMap,
}

/// Everything a callback needs to issue invocations for one call.
///
/// Clones share the cancellation token and the metadata capture.
#[derive(Clone, Debug)]
pub struct CallContext {
    header: Arc<CallHeader>,
    scope: Scope,
    deadline: Instant,
    outgoing: MetadataMap,
    capture: Arc<Mutex<MetadataCapture>>,
}

impl CallContext {
    #[must_use]
    pub fn header(&self) -> &CallHeader {
        &self.header
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it passed.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        self.scope.token()
    }

    /// Scope for nested calls: this call's token and deadline.
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.scope.clone()
    }

    #[must_use]
    pub fn outgoing_metadata(&self) -> &MetadataMap {
        &self.outgoing
    }

    /// Wrap `message` with the outgoing header metadata and remaining timeout.
    #[must_use]
    pub fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        *request.metadata_mut() = self.outgoing.clone();
        request.set_timeout(self.remaining());
        request
    }

    /// Record response header metadata from an invocation.
    pub fn record_header(&self, metadata: &MetadataMap) {
        self.capture.lock().header = metadata.clone();
    }

    /// Record trailer metadata from an invocation.
    pub fn record_trailer(&self, metadata: &MetadataMap) {
        self.capture.lock().trailer = metadata.clone();
    }

    /// Snapshot of the captured response metadata.
    #[must_use]
    pub fn captured(&self) -> MetadataCapture {
        self.capture.lock().clone()
    }
}

/// Releases a call's resources when dropped: the call's token is cancelled.
#[derive(Debug)]
pub struct CallGuard {
    _guard: DropGuard,
}

impl CallGuard {
    /// Release now instead of at end of scope.
    pub fn release(self) {}
}

/// Derive a call context from `parent`.
///
/// The child token is cancelled when the parent is, or when the returned
/// guard is dropped. The deadline is the earlier of `now + timeout` and the
/// parent's own deadline.
#[must_use]
pub fn build_call_context(
    parent: &Scope,
    header: CallHeader,
    timeout: Duration,
) -> (CallContext, CallGuard) {
    let now = Instant::now();
    let local = now
        .checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(u64::from(u32::MAX)));
    let deadline = parent.deadline().map_or(local, |d| d.min(local));

    let token = parent.token().child_token();
    let mut outgoing = MetadataMap::new();
    header.write_to(&mut outgoing);

    let ctx = CallContext {
        header: Arc::new(header),
        scope: Scope {
            token: token.clone(),
            deadline: Some(deadline),
        },
        deadline,
        outgoing,
        capture: Arc::new(Mutex::new(MetadataCapture::default())),
    };
    let guard = CallGuard {
        _guard: token.drop_guard(),
    };
    (ctx, guard)
}

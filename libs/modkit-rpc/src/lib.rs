#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Module-addressed unary RPC over gRPC.
//!
//! Callers name a target module; the [`CallManager`] picks one of its known
//! addresses from the [`EndpointPool`], hands the callback a pooled
//! connection plus a [`CallContext`], and surfaces business failures sent by
//! the peer in the `err_*` response metadata as [`RpcError::Application`].
//! Servers wrap handlers in a [`HandlerChain`] that turns handler errors and
//! panics into that metadata. The [`DiscoveryBridge`] feeds the pool from a
//! [`ServiceRegistry`].

pub mod client;
pub mod config;
pub mod discovery;
pub mod envelope;
pub mod error;
pub mod metadata;
pub mod node;
pub mod pool;
pub mod server;
pub mod transport;

pub use client::{
    AfterHandler, BeforeInterceptor, CallManager, ClientCall, ClientConfig, ClientConn,
    NoCallback,
};
pub use config::{ConfigError, NodeConfig, RpcConfig};
pub use discovery::{
    parse_endpoint_key, DiscoveryBridge, MemoryRegistry, Registration, ServiceRegistry,
    WatchCallback, WatchEvent,
};
pub use envelope::{
    build_call_context, normalize_call_timeout, CallContext, CallGuard, MetadataCapture, Scope,
    DEFAULT_CALL_TIMEOUT,
};
pub use error::{ApplicationError, BoxError, ErrorBuilder, RpcError};
pub use metadata::CallHeader;
pub use node::RpcNode;
pub use pool::{Connection, Dialer, EndpointPool, Module, Slot, DEFAULT_SLOT};
pub use server::{
    GrpcServer, HandlerChain, MethodRouter, ServerCall, ServerState, ServiceInstaller,
    ServiceName,
};
pub use transport::{endpoint_uri, GrpcClientConfig, GrpcConnection, GrpcDialer};

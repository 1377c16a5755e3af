//! Server side: handler chain, method routing and the serving host.

mod chain;
mod host;
mod router;

pub use chain::{
    default_error_parser, ErrorParser, HandlerChain, RecoveryHandler, ServerAfterHook,
    ServerBeforeHook, ServerCall,
};
pub use host::{GrpcServer, ServerState, ServiceInstaller};
pub use router::{MethodRouter, ServiceName};

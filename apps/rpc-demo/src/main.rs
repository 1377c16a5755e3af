use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use modkit_rpc::{
    ApplicationError, CallContext, CallHeader, CallManager, ClientConn, GrpcConnection,
    GrpcDialer, HandlerChain, MemoryRegistry, MethodRouter, RpcConfig, RpcNode, Scope,
    ServiceInstaller, ServiceName, ServiceRegistry,
};
use tracing_subscriber::EnvFilter;

/// ModKit RPC demo: serves an `auth` module and calls it through discovery
#[derive(Parser)]
#[command(name = "rpc-demo")]
#[command(about = "Serve an auth module and call it through the registry")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// User id the auth module refuses
    #[arg(long, default_value = "42")]
    deny: String,

    /// Keep serving after the demo calls until Ctrl+C
    #[arg(long)]
    serve: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
struct CheckRequest {
    #[prost(string, tag = "1")]
    user_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct CheckReply {
    #[prost(bool, tag = "1")]
    allowed: bool,
}

struct AuthService;

impl ServiceName for AuthService {
    const NAME: &'static str = "auth.Auth";
}

const CHECK: &str = "/auth.Auth/Check";

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn auth_router(chain: Arc<HandlerChain>, denied: String) -> MethodRouter<AuthService> {
    MethodRouter::new(chain).unary("Check", move |req: tonic::Request<CheckRequest>| {
        let denied = denied.clone();
        async move {
            let user = req.into_inner().user_id;
            if user == denied {
                return Err(ApplicationError::new("403001", "user is not allowed", "403").into());
            }
            Ok::<_, anyhow::Error>(CheckReply { allowed: true })
        }
    })
}

async fn check(node: &RpcNode, user: &str) -> Result<bool, modkit_rpc::RpcError> {
    let request = CheckRequest {
        user_id: user.to_owned(),
    };
    let header = CallHeader::new(node.id(), "auth")
        .with_app_id(node.registration().app_id.clone())
        .with_request_id(uuid::Uuid::new_v4().to_string());
    let reply: CheckReply = node
        .manager()
        .call_value(
            &Scope::new(),
            header,
            Some(
                |ctx: CallContext, conn: ClientConn<GrpcConnection>| async move {
                    conn.unary::<CheckRequest, CheckReply>(&ctx, CHECK, request)
                        .await
                },
            ),
        )
        .await?;
    Ok(reply.allowed)
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await.map_err(|e| {
        tracing::error!(%e, "Error handling Ctrl+C signal");
        e
    })?;
    tracing::info!("Received Ctrl+C signal");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = RpcConfig::load(cli.config.as_deref())?;
    if config.node.id.is_empty() {
        "auth".clone_into(&mut config.node.id);
    }
    if config.node.name.is_empty() {
        config.node.name = format!("{}-1", config.node.id);
    }

    let manager = CallManager::new(GrpcDialer::new(config.transport.clone()), &config.client);
    let registry: Arc<dyn ServiceRegistry> = Arc::new(MemoryRegistry::new());
    let node = RpcNode::bind(config.node, manager, HandlerChain::new(), Some(registry)).await?;
    node.register_service(ServiceInstaller::router(auth_router(
        Arc::clone(node.chain()),
        cli.deny.clone(),
    )))?;
    node.run().await?;
    tracing::info!(key = %node.registration().key(), "auth module announced");

    for user in ["7", cli.deny.as_str()] {
        match check(&node, user).await {
            Ok(allowed) => println!("check user={user}: allowed={allowed}"),
            Err(e) => {
                if let Some(app) = e.application() {
                    println!(
                        "check user={user}: refused code={} status={} message={}",
                        app.code(),
                        app.status(),
                        app.message()
                    );
                } else {
                    println!("check user={user}: failed: {e}");
                }
            }
        }
    }

    if cli.serve {
        println!("serving on {}; press Ctrl+C to stop", node.local_addr());
        wait_for_shutdown().await?;
    }

    node.release().await;
    Ok(())
}

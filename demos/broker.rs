//! A tunnel broker and a toy provider in one binary.
//!
//! Run the broker, then a provider for some session, then send requests:
//!
//! ```text
//! cargo run --example broker -- broker --listen 127.0.0.1:8080
//! cargo run --example broker -- provider --broker 127.0.0.1:8080 --session demo
//! curl -d hello http://127.0.0.1:8080/session/demo/echo
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use backhaul::body::{Request, Response};
use backhaul::{provider, Body, Server, Tunnel, TunnelConfig};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Context as _, Result};
use http_body_util::BodyExt as _;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Reverse tunnel broker demo")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept providers and renters.
    Broker {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: SocketAddr,

        /// JSON file with tunnel configuration.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Request timeout in seconds, overriding the configuration.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Dial a broker and echo every tunnelled request.
    Provider {
        /// Broker address.
        #[arg(long, default_value = "127.0.0.1:8080")]
        broker: SocketAddr,

        /// Session to serve.
        #[arg(long)]
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,backhaul=debug".into()))
        .init();

    match Args::parse().command {
        Command::Broker {
            listen,
            config,
            timeout,
        } => broker(listen, config, timeout).await,
        Command::Provider { broker, session } => serve_provider(broker, session).await,
    }
}

async fn broker(listen: SocketAddr, config: Option<PathBuf>, timeout: Option<u64>) -> Result<()> {
    let config: TunnelConfig = match config {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .wrap_err_with(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).wrap_err("parsing tunnel configuration")?
        }
        None => TunnelConfig::default(),
    };

    let mut tunnel = Tunnel::new_with_config(config);
    if let Some(seconds) = timeout {
        tunnel.set_request_timeout(Duration::from_secs(seconds));
    }

    let server = Server::bind(listen, tunnel).await?;
    println!("broker listening on {}", server.local_addr()?);

    server
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            eprintln!();
            println!("ctrl-c received, shutting down");
        })
        .await?;
    Ok(())
}

async fn echo(req: Request) -> Result<Response, Infallible> {
    let head = format!("{} {}\n", req.method(), req.uri());
    let body = match req.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(error) => format!("failed to read body: {error}").into(),
    };

    let mut reply = head.into_bytes();
    reply.extend_from_slice(&body);
    Ok(http::Response::new(Body::from(reply)))
}

async fn serve_provider(broker: SocketAddr, session: String) -> Result<()> {
    let stream = tokio::net::TcpStream::connect(broker)
        .await
        .wrap_err_with(|| format!("connecting to {broker}"))?;
    let transport = provider::connect(stream, &session).await?;
    println!("serving session {session} via {broker}");

    provider::serve(session, transport, tower::service_fn(echo)).await;
    println!("broker hung up");
    Ok(())
}

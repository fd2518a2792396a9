//! Veil Tunnel Client
//!
//! Accepts plain TCP connections locally and multiplexes each one as a
//! stream over a pool of carrier connections to the remote peer. The
//! carriers here are raw TCP; a production deployment wraps them in the
//! carrier disguise before handing them to the session.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};
use veil_tunnel::mux::{Session, SessionRole, Stream};
use veil_tunnel::ClientState;

/// Veil Tunnel Client - multiplexing tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "veil-client")]
#[command(about = "Veil Tunnel Client - traffic-obfuscating tunnel endpoint")]
#[command(version)]
struct Args {
    /// Configuration: a JSON file path or a single-line Key=Value;... string
    #[arg(short, long)]
    config: String,

    /// Local listen address
    #[arg(short, long, default_value = "127.0.0.1:1984")]
    local: String,

    /// Remote server address
    #[arg(short, long)]
    remote: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

fn split_host_port(addr: &str) -> Result<(String, String)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("address '{}' is not host:port", addr))?;
    Ok((host.to_string(), port.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let (local_host, local_port) = split_host_port(&args.local)?;
    let (remote_host, remote_port) = split_host_port(&args.remote)?;

    let mut state = ClientState::init(
        local_host,
        local_port,
        remote_host,
        remote_port,
        Arc::new(SystemTime::now),
    );
    state
        .parse_config(&args.config)
        .context("Failed to parse configuration")?;

    let mut id_bytes = [0u8; 4];
    veil_tunnel::crypto::random_bytes(&mut id_bytes);
    state.set_session_id(u32::from_be_bytes(id_bytes));

    let obfs = state
        .record_obfuscator()
        .context("Failed to build obfuscator")?;

    info!("Veil Tunnel Client v{}", veil_tunnel::VERSION);
    info!(
        "Remote: {}:{}, carriers: {}",
        state.remote_host, state.remote_port, state.num_conn
    );

    let remote_addr = format!("{}:{}", state.remote_host, state.remote_port);
    let first = TcpStream::connect(&remote_addr)
        .await
        .context("Failed to connect first carrier")?;
    first.set_nodelay(true)?;

    let session = Session::new(
        state.session_id() as i32,
        SessionRole::Initiator,
        first,
        obfs,
    );
    for _ in 1..state.num_conn.max(1) {
        let conn = TcpStream::connect(&remote_addr)
            .await
            .context("Failed to connect carrier")?;
        conn.set_nodelay(true)?;
        session.add_connection(conn);
    }

    let listen_addr = format!("{}:{}", state.local_host, state.local_port);
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    info!("Listening on {}", listen_addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (conn, peer) = accepted?;
                debug!("local connection from {}", peer);
                let session = session.clone();
                tokio::spawn(async move {
                    match session.open_stream().await {
                        Ok(stream) => relay(conn, stream).await,
                        Err(e) => error!("cannot open stream: {}", e),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                if let Err(e) = session.close().await {
                    debug!("close: {}", e);
                }
                return Ok(());
            }
        }
    }
}

/// Pump bytes both ways between a local TCP connection and a tunnel stream.
async fn relay(conn: TcpStream, stream: Arc<Stream>) {
    let stream_id = stream.id();
    let (mut local_read, mut local_write) = conn.into_split();

    let upstream = {
        let stream = stream.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 16384];
            loop {
                match local_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            if let Err(e) = stream.close().await {
                debug!(stream = stream_id, "close: {}", e);
            }
        })
    };

    let downstream = tokio::spawn(async move {
        let mut buf = vec![0u8; 16384];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if local_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = local_write.shutdown().await;
    });

    let _ = tokio::join!(upstream, downstream);
    debug!(stream = stream_id, "relay finished");
}

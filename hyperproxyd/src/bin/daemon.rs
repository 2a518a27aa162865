//! Universal daemon binary: multiplexes client sockets onto per-VM agent
//! connections.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use hyperproxyd::{Daemon, DaemonConfig};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(author, version, about = "hyperproxyd - VM I/O multiplexing daemon")]
struct DaemonArgs {
    /// Path of the client-facing unix socket.
    #[arg(long, default_value = "/run/hyperproxy/hyperproxy.sock")]
    socket_path: PathBuf,

    /// Bound on a single agent control-channel request, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    command_reply_timeout_ms: u64,

    /// Bound on `execcmd`/`newcontainer`'s wait for a shim to attach.
    #[arg(long, default_value_t = 5000)]
    wait_for_shim_timeout_ms: u64,

    /// Bound on stdin/signal handlers' wait for the process to start.
    #[arg(long, default_value_t = 5000)]
    wait_for_process_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = DaemonArgs::parse();

    let config = DaemonConfig {
        socket_path: args.socket_path,
        command_reply_timeout: Duration::from_millis(args.command_reply_timeout_ms),
        wait_for_shim_timeout: Duration::from_millis(args.wait_for_shim_timeout_ms),
        wait_for_process_timeout: Duration::from_millis(args.wait_for_process_timeout_ms),
        ..DaemonConfig::default()
    };

    let daemon = Daemon::new(config);
    daemon.run().await?;
    Ok(())
}

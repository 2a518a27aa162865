//! Top-level daemon: owns the registry and the accept loop (§2, §5).

use std::sync::Arc;

use tokio::net::UnixListener;

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::registry::Registry;

pub struct Daemon {
    config: Arc<DaemonConfig>,
    registry: Registry,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: Registry::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Bind the client socket and accept connections until the process is
    /// killed. Each connection gets its own task; a panic inside one is
    /// caught by the tokio runtime and only aborts that task, never the
    /// accept loop (§7: "panics in a handler task must not crash the process").
    pub async fn run(&self) -> DaemonResult<()> {
        if let Some(parent) = self.config.socket_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let _ = tokio::fs::remove_file(&self.config.socket_path).await;

        let listener = UnixListener::bind(&self.config.socket_path).map_err(DaemonError::Io)?;
        tracing::info!(path = %self.config.socket_path.display(), "listening");

        loop {
            let (stream, _addr) = listener.accept().await.map_err(DaemonError::Io)?;
            let registry = self.registry.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                crate::dispatch::run_client(stream, registry, config).await;
            });
        }
    }
}

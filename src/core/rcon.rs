// src/core/rcon.rs

//! Short-lived authenticated RCON command channels to running instances.
//!
//! Each call opens a fresh connection, authenticates, issues one command,
//! and closes. No persistent pooling is needed for correctness; a fresh
//! connection also guarantees a channel never outlives its instance.

use crate::core::errors::BlockforgeError;
use crate::core::registry::InstanceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Issues commands over the RCON protocol using each instance's declared
/// port and password.
pub struct RconPool {
    registry: Arc<InstanceRegistry>,
    timeout: Duration,
}

impl RconPool {
    pub fn new(registry: Arc<InstanceRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Connects, authenticates, executes one command, and returns the reply.
    /// Connection and auth failures surface as `RconUnavailable`.
    pub async fn execute(&self, id: &str, command: &str) -> Result<String, BlockforgeError> {
        let instance = self.registry.get(id)?;
        let address = format!("localhost:{}", instance.rcon_port);
        debug!("RCON '{}' -> {} ({})", command, instance.name, address);

        let mut connection = tokio::time::timeout(
            self.timeout,
            rcon::Connection::<TcpStream>::builder()
                .enable_minecraft_quirks(true)
                .connect(&address, &instance.rcon_password),
        )
        .await
        .map_err(|_| {
            BlockforgeError::RconUnavailable(format!("connect to {address} timed out"))
        })??;

        let reply = tokio::time::timeout(self.timeout, connection.cmd(command))
            .await
            .map_err(|_| {
                BlockforgeError::RconUnavailable(format!("command to {address} timed out"))
            })??;
        Ok(reply)
    }
}

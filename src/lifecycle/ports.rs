//! Free host port allocation

use crate::error::{PreviewError, PreviewResult};
use tokio::net::TcpListener;

/// Ask the OS for a currently unused loopback port
///
/// The port is released again before returning, so another process could
/// grab it before the container binds it.
pub async fn free_port() -> PreviewResult<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(PreviewError::PortAllocation)?;
    let addr = listener.local_addr().map_err(PreviewError::PortAllocation)?;
    Ok(addr.port())
}

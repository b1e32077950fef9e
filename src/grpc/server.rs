//! tonic server wiring.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::error::Result;
use crate::grpc::daemon_service::FleetDaemonService;
use crate::node::NodeState;
use crate::proto::fleet_daemon_server::FleetDaemonServer;

/// Serve the daemon until the shutdown token fires.
pub async fn serve(
    state: Arc<NodeState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<()> {
    let service = FleetDaemonService::new(state);
    tracing::info!(%addr, "daemon listening");
    Server::builder()
        .add_service(FleetDaemonServer::new(service))
        .serve_with_shutdown(addr, shutdown.cancelled())
        .await?;
    tracing::info!("daemon stopped");
    Ok(())
}

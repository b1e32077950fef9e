//! gRPC surface: service implementation, shared method dispatch, and server
//! wiring.

pub mod daemon_service;
pub mod dispatch;
pub mod server;

pub use daemon_service::FleetDaemonService;
pub use dispatch::MethodDispatcher;

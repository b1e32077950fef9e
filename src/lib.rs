pub mod config;
pub mod error;
pub mod grpc;
pub mod machine;
pub mod net;
pub mod node;
pub mod promise;
pub mod scheduler;
pub mod shutdown;
pub mod signal;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("fleetd");
}

pub mod addr;
pub mod balance;
pub mod client;
pub mod frame;
pub mod registry;
pub mod rendezvous;
pub mod stun;
pub mod tunnel;

pub use client::{DeliveryClient, DirectClient, PeerClient, ProxyClient};
pub use registry::NodeRegistry;

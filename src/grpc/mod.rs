//! Client side of the cluster manager gRPC service.

pub mod channel;

pub use channel::{connect_manager, manager_client, manager_uri};

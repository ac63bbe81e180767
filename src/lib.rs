// Library half of the daemon: everything except argument parsing and
// logging setup lives here so the integration tests can drive a `Node`
// against a scripted server.

pub mod block;
pub mod chain_error;
pub mod config;
pub mod error;
pub mod events;
pub mod headers;
pub mod network;
pub mod network_type;
pub mod node;
pub mod reconnect;
pub mod shutdown;

pub use config::Config;
pub use error::{AppError, FailureClass, NodeError, NodeResult};
pub use network_type::NetworkType;
pub use node::{Node, NodeStatus};

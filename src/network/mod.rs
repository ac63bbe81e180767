pub mod client;
pub mod message;
pub mod session_cost;
pub mod tls;
pub mod transport;
pub mod wire;

pub use client::{ClientError, ClientSettings, ElectrumClient, Notifications};
pub use message::{ScripthashNotification, TipNotification};
pub use session_cost::{CostConfig, SessionCost};
pub use transport::{ServerAddress, Transport};

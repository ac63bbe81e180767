pub mod chain;
pub mod file;
pub mod sync;

pub use chain::{HeaderChain, RecoveryState};
pub use file::HeaderFile;
pub use sync::{HeaderSource, HeaderSync, StalePolicy, SyncSettings, SyncState};

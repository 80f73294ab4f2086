mod audit;
mod config;
mod fills;
mod lots;
mod markets;
mod orders;
mod snapshots;
mod state;

pub use audit::AuditRepo;
pub use config::ConfigRepo;
pub use fills::FillRepo;
pub use lots::LotRepo;
pub use markets::MarketRepo;
pub use orders::OrderRepo;
pub use snapshots::SnapshotRepo;
pub use state::StateRepo;

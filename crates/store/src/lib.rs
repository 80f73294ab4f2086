pub mod models;
pub mod repositories;
pub mod store;

pub use models::{
    AuditRecord, FillRecord, LotRecord, LotStatus, MarketRecord, MarketState, OrderRecord,
    ProfitTracker, SnapshotRecord,
};
pub use store::Store;

pub mod backoff;
pub mod config;
pub mod errors;
pub mod events;
pub mod traits;
pub mod types;

pub use backoff::Backoff;
pub use config::{AppConfig, DatabaseConfig, EngineSettings, ExchangeConfig, GridConfig, ServerConfig};
pub use errors::ExchangeError;
pub use events::BotEvent;
pub use traits::ExchangeAdapter;
pub use types::{
    CancelOutcome, EngineMode, FillEvent, OpenOrder, OrderStatus, PlaceOrderRequest, Product,
    ProfitMode, Side, SizingMode, TickerUpdate,
};

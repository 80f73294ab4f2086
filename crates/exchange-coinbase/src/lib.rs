pub mod adapter;
pub mod client;
pub mod websocket;

pub use adapter::CoinbaseAdapter;
pub use client::{CoinbaseClient, CoinbaseCredentials};

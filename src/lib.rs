pub mod boltz;
pub mod chain;
pub mod config;
pub mod error;
pub mod lightning;
pub mod logging;
pub mod network;
pub mod nursery;
pub mod swap;
pub mod taproot;
pub mod transaction;

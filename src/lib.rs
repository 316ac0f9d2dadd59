//! WhaleGuard - ERC20 whale transfer monitor
//!
//! Keeps a roster of a token's top holders, polls confirmed `Transfer` logs, and alerts when
//! a rostered whale buys or sells more than a USD threshold.
//!
//! This is a **read-only** tool: no keys, no transactions.

pub mod config;
pub mod dashboard;
pub mod error;
pub mod modules;
pub mod utils;

pub use config::Config;
pub use error::{ConfigError, DecodeError, EnrichError, SourceError};

//! Utility modules

pub mod address;
pub mod alerts;
pub mod backoff;
pub mod database;
pub mod logger;
pub mod metrics;
pub mod pricing;
pub mod ranking;
pub mod rpc;
pub mod sources;
#[cfg(test)]
pub(crate) mod test_http;

pub use alerts::AlertService;
pub use database::StateStore;
pub use logger::init_logger;
pub use metrics::MetricsService;
pub use rpc::EvmRpcService;

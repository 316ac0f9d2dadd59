//! Read-only status server

pub mod server;

pub use server::DashboardServer;

//! HTTP entry point: one route per caller id in front of the rate limiter.

mod handler;
mod server;

pub use handler::{check_caller, router, SharedLimiter};
pub use server::HttpServer;

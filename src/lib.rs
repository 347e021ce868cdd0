//! Ratewindow - Fixed and Sliding Window Rate Limiting
//!
//! This crate decides whether a caller may act based on how often it has
//! acted within a time window. It ships six interchangeable strategies behind
//! one [`ratelimit::RateLimiter`] trait: fixed-window and sliding-window
//! semantics, each over local memory or a shared store (memcached or redis)
//! so that several processes can enforce one budget.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;

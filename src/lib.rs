//! Ratebucket - In-Process Token Bucket Rate Limiting
//!
//! This crate implements a token bucket rate limiter with burst support and
//! token debt, a pluggable storage contract, and an in-memory store that
//! evicts stale buckets from a cancellable background task.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

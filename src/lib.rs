//! Tollgate - client-side rate limit gate
//!
//! This crate keeps an API client within the request and connection limits
//! published by a remote service. Every outbound action passes through a
//! [`RateLimitGate`](ratelimit::RateLimitGate), which waits (or fails) until
//! all applicable guards have room, and records the action's weight once it
//! is sent.

pub mod config;
pub mod error;
pub mod ratelimit;

//! Tollgate - Admission-Control and Rate-Limiting Engine
//!
//! This crate decides, per request key, whether a request may proceed. Policies
//! are matched by method and path in declaration order, quotas are tracked in
//! token or leaky buckets, and every bucket update runs atomically inside a
//! swappable state store.

pub mod config;
pub mod error;
pub mod management;
pub mod ratelimit;

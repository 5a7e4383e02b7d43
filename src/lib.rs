//! Rooftop solar forecast engine backed by the Solcast API.
//!
//! Keeps up to two years of half-hourly history per site, applies
//! dampening and a hard limit to build an aggregate series, and derives
//! energy and power figures from it.

pub mod api;
pub mod config;
pub mod domain;
pub mod engine;
pub mod forecast;
pub mod quota;
pub mod scheduler;
pub mod solcast;
pub mod storage;
pub mod store;
pub mod telemetry;

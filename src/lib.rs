//! Uptrail - availability monitoring engine.
//!
//! Probes configured endpoints on jittered schedules, classifies and retries
//! failures, tracks SLA coverage per period and drives alerts and incidents.

pub mod config;
pub mod db;
pub mod notify;
pub mod probe;
pub mod scheduler;
pub mod web;

//! # artifact-forwarder
//!
//! Pipeline between a deception platform's sensors and a dynamic-analysis
//! engine. Workers claim artifact-observed events from a shared backlog
//! (SQLite or PostgreSQL), locate the artifact on disk, hash it, drop
//! duplicates and submit novel artifacts, recording every outcome.

pub mod backlog;
pub mod config;
pub mod db;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod identify;
pub mod model;
pub mod resolver;
pub mod storage;
pub mod submit;
pub mod telemetry;

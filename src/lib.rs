//! dbsync - Database Health Monitoring Engine
//!
//! Probes remote database targets under strict time budgets, normalizes
//! their statistics, keeps target definitions and an event trail in SQLite,
//! and answers control requests over a WebSocket push channel and an HTTP
//! administrative channel.

pub mod config;
pub mod control;
pub mod db;
pub mod engine;
pub mod metrics;
pub mod probe;
pub mod scheduler;
pub mod web;

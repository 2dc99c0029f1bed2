//! Hostdeck - a single-host deploy platform
//!
//! This library turns a git repository, an uploaded archive or a stock OS
//! image into a running container reachable at `<name>.<base domain>`:
//! - Deploys run through one global FIFO queue, so builds never overlap
//! - Build plans are resolved from marker files and rendered into recipes
//! - Each service gets a unique host port on loopback
//! - A subdomain reverse proxy fronts every service and the platform API
//! - Container output, status changes and stats stream to WebSocket clients

pub mod api;
pub mod builder;
pub mod config;
pub mod control;
pub mod db;
pub mod docker;
pub mod engine;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;
pub mod plan;
pub mod platform;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod source;
pub mod vm;
pub mod ws;

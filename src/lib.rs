//! Photo upload service with asynchronous duplicate detection.
//!
//! The HTTP server (`src/main.rs`) stores uploaded photos and enqueues one
//! duplicate-check job per photo; the worker binary (`src/bin/worker.rs`)
//! consumes those jobs and records each photo's duplicate status.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod worker;

//! Common types and configuration shared across the chartdata crates.
//!
//! - **Configuration**: Strongly typed application configuration (`config`).
//! - **Authentication**: The authenticated caller (`auth`).
//! - **Telemetry**: Logging setup (`telemetry`).
pub mod auth;
pub mod config;
pub mod telemetry;

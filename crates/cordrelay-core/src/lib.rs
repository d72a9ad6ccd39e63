//! `cordrelay` Core Library
//!
//! Shared functionality for the relay:
//! - Configuration loading, defaults and environment overrides
//! - Placeholder template substitution
//! - IP-to-country lookup with flag glyphs
//! - Common error types and tracing setup

pub mod config;
pub mod error;
pub mod geo;
pub mod template;
pub mod tracing_init;

pub use config::RelayConfig;
pub use error::{Error, Result};
pub use geo::{GeoInfo, GeoLookup};

//! ---
//! ph_section: "01-core-functionality"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Shared primitives and utilities for the core runtime."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
//! Core shared primitives for the printhost workspace.
//! This crate exposes the sectioned configuration store, typed section
//! accessors, and the tracing setup consumed across the workspace.

pub mod config;
pub mod logging;
pub mod time;

pub use self::config::{ConfigError, ConfigSection, ConfigStore, FloatBounds, ROOT_SECTION};
pub use self::logging::{init_tracing, LogFormat, LoggingGuard, LoggingOptions};

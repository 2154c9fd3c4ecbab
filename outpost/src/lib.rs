//! Configuration and seeding for the outpost dispatch engine.

pub mod config;

pub use config::{ConfigError, OutpostConfig, SeedConfig, Seeded, find_config_file};

//! Core engine settings shared by every subsystem

pub mod config;

pub use config::{EngineConfig, TlasPolicy};

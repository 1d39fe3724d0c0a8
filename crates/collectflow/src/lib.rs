//! Compliance-gated collection reminder campaigns and mechanic's lien deadline tracking.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod workflows;

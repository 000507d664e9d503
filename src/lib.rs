//! Inline request mitigation for web servers.
//!
//! Each inbound request is rate limited per source, checked against a
//! country policy, and scanned for malicious input before application
//! logic runs. [`service::MitigationPipeline::evaluate`] is the single
//! decision entry point; [`middleware`] embeds it into an axum server.

pub mod config;
pub mod core;
pub mod middleware;
pub mod service;
pub mod utils;

pub use config::{Settings, ShieldPolicy};
pub use service::{Block, BlockCategory, Collaborators, MitigationPipeline, Request, Verdict};

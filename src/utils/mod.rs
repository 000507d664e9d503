//! Utility modules for the request shield.
//! This module contains the error type and logging helpers shared
//! across the pipeline components.

mod error;
mod logging;

pub use logging::{
    create_request_span, init_logging, log_allow, log_block, log_fail_open, log_rate_limit,
};

pub use error::{WafError, WafResult};

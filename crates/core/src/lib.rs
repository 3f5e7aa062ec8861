#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared plumbing for the brenda render-farm tools: configuration, error
//! classification and retry, URL schemes, filesystem helpers and task
//! template expansion.

pub mod config;
pub mod error;
pub mod fsutil;
pub mod retry;
pub mod template;
pub mod urls;

pub use config::Config;
pub use error::TaskError;
pub use retry::{RetryPolicy, retry};

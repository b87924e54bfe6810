#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![forbid(unsafe_code)]

mod classifier;
mod client;
mod config;
mod coordinator;
mod credentials;
pub mod error;
mod pipeline;
mod renewal;
pub use classifier::*;
pub use client::*;
pub use config::*;
pub use coordinator::*;
pub use credentials::*;
pub use error::{Error, RenewalError, Result};
pub use pipeline::RequestPipeline;
pub use renewal::*;

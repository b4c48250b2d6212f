//! previewd - On-demand preview environments
//!
//! Builds a container image for each requested commit through a bounded
//! queue, starts containers on first request, proxies traffic to them and
//! reaps the ones nobody has visited for a while.

pub mod build;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod orchestration;
pub mod reaper;
pub mod server;
pub mod source;
pub mod state;

#[cfg(test)]
mod testing;

pub use error::{PreviewError, PreviewResult};

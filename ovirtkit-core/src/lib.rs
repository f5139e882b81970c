pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod mock;
pub mod rest;
pub mod retry;
pub mod types;

#[cfg(test)]
mod tests;

pub use api::EngineApi;
pub use config::*;
pub use error::*;
pub use jobs::{wait_for_disk_ok, wait_for_disk_stable, wait_for_jobs};
pub use mock::{MockBehavior, MockEngine, MockOp};
pub use rest::{RestEngine, client_builder};
pub use retry::{RetryStrategy, retry};
pub use types::*;

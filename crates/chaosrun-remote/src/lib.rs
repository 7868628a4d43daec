//! Remote command execution for chaos runs.

pub mod mock;
pub mod ssh;

pub use mock::{MockCall, MockExecutor, MockResponse};
pub use ssh::SshExecutor;

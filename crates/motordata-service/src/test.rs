//! Helpers for testing the service.
//!
//! In every test, call [`setup`] first so console output is captured by the
//! test runner. When using [`tempdir`], keep the handle alive for the whole
//! test, or the cache directory silently disappears from under the store.

use std::time::Duration;

pub use motordata_test::*;

use crate::config::Config;

/// A config pointing all upstream URLs at the given test server, with fast
/// retries and no cache directory.
pub fn config_for(server: &Server) -> Config {
    let mut config = Config::default();
    config.fetch.base_url = server.url("/api/v1/");
    config.fetch.manual_base_url = server.url("/api/v1/");
    config.fetch.retry.base_delay = Duration::from_millis(10);
    config.fetch.timeouts.request = Duration::from_secs(2);
    config
}

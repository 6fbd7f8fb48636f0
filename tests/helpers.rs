//! Shared test helpers for E2E tests.

#[path = "helpers_loopback.rs"]
pub mod loopback;

#[path = "helpers_polling.rs"]
pub mod polling;

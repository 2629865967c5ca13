//! Test handlers and fixtures for drover.
//!
//! The handlers record every call they receive so tests can assert on
//! attempt numbers and timing without inspecting the store.

mod fixtures;
mod mock;

pub use fixtures::*;
pub use mock::*;

//! Shared fixtures for the Bazaar integration tests.

pub mod helpers;

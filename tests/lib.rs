//! Shared fixtures for the Tether integration suites.

pub mod test_helpers;

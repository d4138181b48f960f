//! Integration tests module
//!
//! This module organizes all integration tests for r-chime.

pub mod broker_test;
pub mod config_test;

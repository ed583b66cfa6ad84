//! Utility library for the bundler evaluation tooling

pub mod manifest;
pub mod other;

//! Common utilities and types shared across the mesh call crates.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes (users, conversations, streams)
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

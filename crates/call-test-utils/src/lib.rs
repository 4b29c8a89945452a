//! # Call Test Utilities
//!
//! Shared test utilities for the mesh call core.
//!
//! This crate provides mock implementations and test fixtures for running
//! several call clients against each other in one process, without a real
//! signaling service, camera or network.
//!
//! ## Modules
//!
//! - `mock_transport` - In-memory broadcast signaling bus
//! - `mock_peer` - Loopback peer connections that pair up by fake SDP
//! - `mock_capture` - Scriptable capture devices
//! - `fixtures` - Multi-client call harness and polling helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use call_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let call = TestCall::new();
//!     let alice = call.client("alice");
//!     let bob = call.client("bob");
//!
//!     alice.handle.join(true).await.unwrap();
//!     bob.handle.join(true).await.unwrap();
//!
//!     alice.wait_for("bob visible", |s| s.participants.len() == 1).await;
//! }
//! ```

pub mod fixtures;
pub mod mock_capture;
pub mod mock_peer;
pub mod mock_transport;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_capture::*;
pub use mock_peer::*;
pub use mock_transport::*;

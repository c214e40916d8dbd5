//! # Covault Testkit
//!
//! Testing utilities for Covault.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: deterministic agents, open CoValues and quiet transport
//!   settings for setting up test scenarios
//! - **Generators**: Proptest strategies for JSON values, map changes and
//!   multi-agent write histories
//! - **Storage**: an adapter that can be taken down to simulate outages
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use covault_testkit::generators::map_history;
//!
//! proptest! {
//!     #[test]
//!     fn history_is_never_empty(history in map_history(3, 16)) {
//!         prop_assert!(!history.is_empty());
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust
//! use covault_core::CoValueKind;
//! use covault_testkit::fixtures::{multi_party, open_covalue};
//!
//! let agents = multi_party(2);
//! let mut core = open_covalue(CoValueKind::Map, "example");
//! agents[0].append(&mut core, &[serde_json::json!({"op": "set", "key": "a", "value": 1})], None, 1);
//! ```

pub mod fixtures;
pub mod generators;
pub mod storage;

pub use fixtures::{
    init_tracing, multi_party, open_covalue, open_header, quiet_transport, TestAgent,
};
pub use generators::{map_history, MapWrite};
pub use storage::FlakyStorage;

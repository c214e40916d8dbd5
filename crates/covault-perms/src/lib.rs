//! # Covault Permissions
//!
//! Roles, group replay and read-key sharing.
//!
//! ## Overview
//!
//! Permissions are themselves CoValues. A group is a map whose keys assign
//! roles to agents (or to `everyone`), name the current read key, reveal
//! read keys to members and link to parent groups. Replaying a group's
//! transactions in `(madeAt, session, index)` order yields a
//! [`GroupState`], from which the role of any agent at any point in time
//! can be read.
//!
//! The [`PermissionResolver`] plugs into `covault-core` from both sides:
//!
//! - as the `WriteGate` it decides which transactions of a group or of a
//!   group-owned CoValue are valid;
//! - as the `KeySource` it recovers read keys sealed to the local agent,
//!   revealed publicly, or encrypted with a parent group's key.
//!
//! ## Roles
//!
//! `admin > writer > reader`, with `writeOnly` beside `reader` and
//! `revoked` below all. A child group's members inherit the roles they
//! hold in the groups it extends, or the extension's role when it names one.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use covault_core::{AgentSecret, NativeCrypto};
//! use covault_perms::PermissionResolver;
//!
//! let agent = AgentSecret::generate();
//! let resolver = PermissionResolver::new(Arc::new(NativeCrypto::new())).with_agent(agent);
//!
//! // core.refresh_validity(&resolver);
//! // resolver.update_group(&group_core);
//! ```

pub mod error;
pub mod group;
pub mod keys;
pub mod resolver;
pub mod role;

pub use error::{PermsError, Result};
pub use group::{GroupKey, GroupState, Member, RevealTarget, EVERYONE, READ_KEY};
pub use keys::{
    add_member_changes, create_group_changes, extend_changes, new_read_key, read_key_change,
    reveal_change, set_role_change, ExtendChanges,
};
pub use resolver::{PermissionResolver, ReadKey, Rotation};
pub use role::{ParentRole, Role};

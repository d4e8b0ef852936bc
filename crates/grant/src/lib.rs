//! bouncer_grant
//!
//! Grant Session Manager (§4.6): pre-approved fixed command sets with TTL
//! and an execution counter, including the `{placeholder}`/`*` pattern
//! compiler with its backtracking guards.

pub mod manager;
pub mod pattern;

pub use manager::{apply_approval, execute, request_grant, ApproverAction, GrantError, GrantRequest};
pub use pattern::{compile_pattern, CompiledPattern, PatternError};

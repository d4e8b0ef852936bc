//! bouncer_store
//!
//! Storage and external-collaborator contracts (§4.8, §4.5, §4.6, §4.11,
//! §9): `ApprovalStore`, `TrustStore`, `GrantStore`, `RateLimitStore` own
//! persisted state; `Notifier` and `Executor` are the narrow seams to the
//! chat surface and the command sandbox. Each trait ships an in-memory
//! implementation usable directly in tests.

pub mod approval_store;
pub mod executor;
pub mod grant_store;
pub mod notifier;
pub mod page_store;
pub mod rate_store;
pub mod trust_store;

pub use approval_store::{ApprovalStore, InMemoryApprovalStore, RequestPatch, StoreError, TransitionOutcome};
pub use executor::{ExecError, ExecutionRequest, ExecutionResult, Executor, FakeExecutor};
pub use grant_store::{GrantMutation, GrantStore, GrantStoreError, InMemoryGrantStore};
pub use notifier::{NotifyError, Notifier, OutgoingMessage, RecordingNotifier};
pub use page_store::{InMemoryPageStore, PageStore, PageStoreError};
pub use rate_store::{InMemoryRateLimitStore, RateLimitStore, RateStoreError};
pub use trust_store::{InMemoryTrustStore, TrustStore, TrustStoreError};

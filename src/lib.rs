//! TEE attestation verification engine for dstack deployments.
//!
//! Given a TDX attestation quote and the compose/event-log artifacts a CVM
//! claims to have run, this crate decides whether the presented measurements
//! are consistent with a known-good reference image build, and whether the
//! on-chain governance registry agrees the application is legitimately
//! deployed.
//!
//! The verification flow per target:
//! 1. Decode the fixed-layout quote ([`quote`])
//! 2. Replay the event log into expected RTMR values ([`eventlog`])
//! 3. Compare launch measurements against the cached reference image
//!    ([`image`])
//! 4. Bind the measured compose hash to the independently fetched compose
//!    document ([`compose_hash`])
//! 5. Confirm the identity with the governance registry ([`registry`])
//!
//! Jobs run under a bounded, retrying queue ([`task`]); the per-target logic
//! lives in [`verifier`]. This engine only reads the registry's view of
//! truth and verifies evidence against it — it does not generate quotes or
//! attest itself.

pub mod compose_hash;
pub mod config;
pub mod error;
pub mod eventlog;
pub mod image;
pub mod logging;
pub mod quote;
pub mod registry;
pub mod task;
pub mod verifier;

pub use config::VerifierConfig;
pub use error::{DecodeError, FieldMismatch, VerificationError};
pub use eventlog::{replay_rtmrs, EventLogEntry};
pub use image::{CachedImage, FetchImage, HttpFetcher, ImageName, ImageStore, ImageVariant};
pub use quote::Quote;
pub use registry::{EvmRegistry, KmsInfo, ReadRegistry};
pub use task::{JobQueue, Task, TaskId, TaskStatus, TaskStore};
pub use verifier::{
    AttestationBundle, TargetKind, TargetSpec, TargetStatus, VerificationJob, VerificationResult,
    Verifier,
};

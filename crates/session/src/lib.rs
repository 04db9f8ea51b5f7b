//! Client-side cloud session for CloudLink devices.
//!
//! Drives a device from provisioning input through sign-up, sign-in and
//! resource publication, and keeps the session alive afterwards:
//!
//! ```text
//!   provision ──► SignUp ──► SignIn ──► PublishPrimary ──┬─► PublishSecondary ─┐
//!                   │          ▲  │                      └─► PublishProfile ───┴─► Stopped
//!                   │          │  ▼                                                 │
//!                   │        Refresh ◄──────── expiry / keep-alive ─────────────────┘
//!                   ▼
//!           FailedToRegister / FailedToPublish ──► Stopped
//! ```
//!
//! One task owns the state machine.  Every request is registered with the
//! [`RequestCorrelator`] and watched by the [`TimeoutSupervisor`]; a
//! response and a timeout for the same request race through
//! [`RequestCorrelator::compare_and_clear`] and exactly one of them is
//! handled.  Provisioning input that arrives while an attempt is running
//! is cached in a single slot and started once the session is idle.

pub mod backoff;
pub mod builder;
pub mod collaborators;
pub mod correlator;
pub mod credentials;
pub mod handle;
mod machine;
mod supervisor;
pub mod timeout;
pub mod types;

pub use backoff::BackoffCalculator;
pub use builder::{SessionManager, SessionManagerBuilder};
pub use collaborators::{
    AlwaysAttached, CredentialPersistence, LogObserver, NetworkStatus, Observer,
    OutboundRequest, ResourceProvider, Responder, Transport,
};
pub use correlator::{Operation, PublishTarget, RequestCorrelator};
pub use credentials::{CredentialStore, InMemoryCredentials, JsonFileCredentials};
pub use handle::SessionHandle;
pub use timeout::{TimeoutRecord, TimeoutSupervisor};
pub use types::{
    CloudStatus, FailureReason, SessionError, SessionOutcome, SessionState, Stage,
};

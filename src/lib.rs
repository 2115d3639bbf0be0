//! Multi-tenant supervisor for long-running agent conversations driving
//! external LLM-backed runtimes (spec §1).
//!
//! `host::SessionHost` is the entry point: it creates/loads/unloads
//! sessions, each one a `session::Session` running its own serial query
//! pipeline against a `runner::Runner`/`ee::ExecutionEnvironment` pair,
//! folding converter output into a `model::ConversationState` through the
//! pure `reducer`, and fanning it out through `eventbus::EventBus`.
//! Everything below the `PersistenceAdapter` contract (storage backend,
//! wire transport, UI) is supplied by the embedder.

pub mod config;
pub mod converter;
pub mod ee;
pub mod error;
pub mod eventbus;
pub mod host;
pub mod ids;
pub mod model;
pub mod persistence;
pub mod reducer;
pub mod runner;
pub mod session;
pub mod transcript;

pub use config::HostConfig;
pub use ee::{EEDriver, EeHandle, TerminationOutcome};
pub use error::{HostError, HostResult};
pub use eventbus::{EventBus, SubscriptionError};
pub use host::{SessionFactory, SessionHost};
pub use persistence::{LoadedSession, PersistenceAdapter};
pub use runner::{MessageSink, Runner};
pub use session::{Session, SessionSnapshot};

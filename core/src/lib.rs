#![deny(missing_docs)]
//! deck_core: job model, launch resolution, process registry and cron
//! scheduling for scriptdeck.

/// Configuration helpers (AppId, dirs, load_or_init, etc.)
pub mod cfg;
/// File-backed record store and the job collection on top of it.
pub mod store;
/// Tracing/log initialization helpers.
pub mod logx;
/// Job descriptors, preferences, results and events.
pub mod job;
/// Error taxonomy shared by every operation.
pub mod error;
/// Launch resolution: interpreter, shell and PATH for a job.
pub mod launch;
/// Process registry, output streaming and stop handling.
pub mod engine;
/// Cron timers, one per scheduled job.
pub mod scheduler;
/// The operations front ends call, tying store, scheduler and engine together.
pub mod deck;

pub use deck::{Deck, FilePicker, SavedJob};
pub use error::{CoreError, CoreResult, Reply};
pub use job::{Event, ExecPrefs, ExecutionResult, JobDescriptor, JobTarget};

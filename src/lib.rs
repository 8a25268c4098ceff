//! NiceMail sync and classification core
//!
//! Keeps a local mail store in sync with remote accounts and routes new
//! messages through an external spam classifier, off the sync path. The
//! [`Engine`] is the entry point: build it from an [`AppConfig`],
//! subscribe to per-account [`ChangeEvent`]s and read folders from the
//! local store. Classification verdicts arrive asynchronously and only
//! ever move forward from `unclassified`.

pub mod adapter;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod scheduler;
pub mod store;
pub mod types;

pub use bus::Subscription;
pub use config::{AppConfig, ConfigLoader};
pub use engine::Engine;
pub use error::{CoreError, Result};
pub use scheduler::AccountState;
pub use store::MailStore;
pub use types::{Account, ChangeEvent, MailFolder, MailMessage, MessageFlag, Verdict, VerdictLabel};

/// Route tracing output into the test harness; safe to call from every
/// test, only the first call installs the subscriber.
#[cfg(test)]
pub(crate) fn test_trace_init() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

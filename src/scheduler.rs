//! Per-account sync scheduler
//!
//! One independent task per account; accounts never block each other.
//! Each cycle connects (or reuses the session), enumerates folders,
//! fetches past the stored watermark, persists messages with their
//! verdict placeholders, advances the watermark and emits change events.
//!
//! Transient failures back off exponentially with jitter up to a cap,
//! preserving the last successfully synced state. A rejected login is
//! terminal: the account moves to `Disabled`, one `SyncError` is
//! surfaced and no further attempts are made until reconfiguration.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterSession, MailAdapter, RemoteFolder};
use crate::bus::ChangeBus;
use crate::config::SchedulerConfig;
use crate::error::{CoreError, Result};
use crate::store::MailStore;
use crate::types::{Account, ChangeEvent};

/// Account sync state machine:
/// `Idle -> Connecting -> Syncing -> (Idle | Backoff)`,
/// `Backoff -> Connecting`, with `Disabled` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountState {
    Idle,
    Connecting,
    Syncing,
    Backoff,
    /// Authentication rejected; requires reconfiguration
    Disabled,
}

/// Control handle held by the engine while the task runs
#[derive(Clone)]
pub struct SchedulerHandle {
    shutdown: Arc<AtomicBool>,
    stop_tx: flume::Sender<()>,
    state: Arc<RwLock<AccountState>>,
}

impl SchedulerHandle {
    /// Request the task to stop; any wait is interrupted
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.send(());
    }

    pub fn state(&self) -> AccountState {
        *self.state.read().expect("state lock poisoned")
    }
}

/// The per-account sync loop
pub struct SyncScheduler {
    account: Account,
    adapter: Arc<dyn MailAdapter>,
    store: Arc<MailStore>,
    bus: Arc<ChangeBus>,
    config: SchedulerConfig,
    poll_interval: Duration,
    state: Arc<RwLock<AccountState>>,
    shutdown: Arc<AtomicBool>,
    stop_rx: flume::Receiver<()>,
}

impl SyncScheduler {
    pub fn new(
        account: Account,
        adapter: Arc<dyn MailAdapter>,
        store: Arc<MailStore>,
        bus: Arc<ChangeBus>,
        config: SchedulerConfig,
        poll_interval_override: Option<u64>,
    ) -> (Self, SchedulerHandle) {
        let poll_interval =
            Duration::from_secs(poll_interval_override.unwrap_or(config.poll_interval_secs));
        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(RwLock::new(AccountState::Idle));
        let (stop_tx, stop_rx) = flume::bounded(1);

        let handle = SchedulerHandle {
            shutdown: shutdown.clone(),
            stop_tx,
            state: state.clone(),
        };
        let scheduler = Self {
            account,
            adapter,
            store,
            bus,
            config,
            poll_interval,
            state,
            shutdown,
            stop_rx,
        };
        (scheduler, handle)
    }

    fn set_state(&self, state: AccountState) {
        *self.state.write().expect("state lock poisoned") = state;
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Shutdown-aware sleep
    async fn wait(&self, duration: Duration) {
        let _ = tokio::time::timeout(duration, self.stop_rx.recv_async()).await;
    }

    /// Run until stopped or disabled
    pub async fn run(&self) {
        info!("Starting sync task for account {}", self.account.id);
        let mut session: Option<Box<dyn AdapterSession>> = None;
        let mut failures: u32 = 0;

        while !self.is_shutdown() {
            match self.sync_cycle(&mut session).await {
                Ok(new_messages) => {
                    failures = 0;
                    self.set_state(AccountState::Idle);
                    if new_messages > 0 {
                        info!(
                            "Sync cycle for {} stored {} new messages",
                            self.account.id, new_messages
                        );
                    }
                    self.wait(self.poll_interval).await;
                }
                Err(e) if e.is_fatal() => {
                    error!("Authentication failed for {}: {}", self.account.id, e);
                    session = None;
                    self.set_state(AccountState::Disabled);
                    self.bus.publish(ChangeEvent::SyncError {
                        account_id: self.account.id.clone(),
                        reason: e.to_string(),
                        fatal: true,
                    });
                    break;
                }
                Err(e) => {
                    failures += 1;
                    session = None;
                    self.set_state(AccountState::Backoff);
                    let delay = backoff_delay(failures, &self.config);
                    warn!(
                        "Sync cycle for {} failed ({} consecutive): {}; retrying in {:?}",
                        self.account.id, failures, e, delay
                    );
                    self.bus.publish(ChangeEvent::SyncError {
                        account_id: self.account.id.clone(),
                        reason: e.to_string(),
                        fatal: false,
                    });
                    self.wait(with_jitter(delay)).await;
                }
            }
        }

        if let Some(mut s) = session {
            let _ = s.logout().await;
        }
        info!("Sync task stopped for account {}", self.account.id);
    }

    /// One sync pass over all folders of the account
    pub(crate) async fn sync_cycle(
        &self,
        session: &mut Option<Box<dyn AdapterSession>>,
    ) -> Result<u32> {
        if session.is_none() {
            self.set_state(AccountState::Connecting);
            *session = Some(self.adapter.connect(&self.account).await?);
        }
        let sess = match session.as_mut() {
            Some(s) => s,
            None => unreachable!("session established above"),
        };

        self.set_state(AccountState::Syncing);
        let mut folders = sess.list_folders().await?;
        if folders.is_empty() {
            // Some servers return nothing for a LIST of selectable
            // folders; the primary folder always exists.
            folders.push(RemoteFolder {
                name: "INBOX".to_string(),
                remote_id: "INBOX".to_string(),
            });
        }
        debug!("Account {} has {} folders", self.account.id, folders.len());

        let mut total_new = 0u32;
        for folder in &folders {
            if self.is_shutdown() {
                break;
            }
            self.store
                .ensure_folder(&self.account.id, &folder.name, &folder.remote_id)?;
            let watermark = self.store.watermark(&self.account.id, &folder.name)?;

            let page = match sess.fetch_new(&folder.name, watermark).await {
                Ok(page) => page,
                Err(e @ CoreError::Protocol(_)) => {
                    // Malformed response for this folder; skip it this
                    // cycle, it is retried on the next one.
                    warn!(
                        "Protocol error in {}/{}: {}",
                        self.account.id, folder.name, e
                    );
                    self.bus.publish(ChangeEvent::SyncError {
                        account_id: self.account.id.clone(),
                        reason: format!("folder {}: {}", folder.name, e),
                        fatal: false,
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Persist first; the watermark only advances after the
            // messages and their verdict placeholders are durable.
            let inserted = self
                .store
                .upsert_messages(&self.account.id, &folder.name, &page.messages)?;
            if page.watermark > watermark {
                self.store
                    .advance_watermark(&self.account.id, &folder.name, page.watermark)?;
            }

            for message in &page.messages {
                if inserted.contains(&message.uid) {
                    self.bus.publish(ChangeEvent::NewMessage {
                        account_id: self.account.id.clone(),
                        folder: folder.name.clone(),
                        uid: message.uid,
                        subject: message.subject.clone(),
                        sender: message.sender.clone(),
                    });
                }
            }
            self.bus.publish(ChangeEvent::FolderSynced {
                account_id: self.account.id.clone(),
                folder: folder.name.clone(),
                new_messages: inserted.len() as u32,
                watermark: page.watermark,
            });
            total_new += inserted.len() as u32;
        }

        Ok(total_new)
    }
}

/// Deterministic exponential backoff, capped. The first failure waits
/// the base delay.
pub(crate) fn backoff_delay(failures: u32, config: &SchedulerConfig) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let ms = config
        .backoff_base_ms
        .saturating_mul(1u64 << exp)
        .min(config.backoff_cap_ms);
    Duration::from_millis(ms)
}

/// Add up to 25% jitter on top of the deterministic delay, so the floor
/// is never undercut.
pub(crate) fn with_jitter(delay: Duration) -> Duration {
    let ms = delay.as_millis() as u64;
    let jitter = rand::thread_rng().gen_range(0..=ms / 4);
    delay + Duration::from_millis(jitter)
}

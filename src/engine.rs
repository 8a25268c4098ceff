//! Engine facade
//!
//! Owns the store, the change bus, the classification pipeline and one
//! sync task per configured account. Callers construct it from an
//! [`AppConfig`] snapshot, subscribe to change events and read the local
//! store; reloading hands in a fresh snapshot and the account set is
//! replaced atomically, leaving unchanged accounts running.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapter::imap::ImapAdapter;
use crate::adapter::MailAdapter;
use crate::bus::{ChangeBus, Subscription, DEFAULT_CAPACITY};
use crate::config::{AppConfig, SchedulerConfig};
use crate::error::{CoreError, Result};
use crate::pipeline::{ClassifierPipeline, OpenAiProvider, SpamProvider, SpamSettings};
use crate::scheduler::{AccountState, SchedulerHandle, SyncScheduler};
use crate::store::MailStore;
use crate::types::{
    Account, MailFolder, MailMessage, MessageFlag, ProtocolKind, Verdict, VerdictLabel,
};

struct AccountEntry {
    account: Account,
    poll_override: Option<u64>,
    handle: SchedulerHandle,
    task: JoinHandle<()>,
}

/// The sync and classification engine
pub struct Engine {
    store: Arc<MailStore>,
    bus: Arc<ChangeBus>,
    adapters: HashMap<ProtocolKind, Arc<dyn MailAdapter>>,
    accounts: HashMap<String, AccountEntry>,
    settings: Arc<RwLock<SpamSettings>>,
    scheduler_config: SchedulerConfig,
    pipeline_task: JoinHandle<()>,
}

impl Engine {
    /// Build the engine and start sync tasks for every configured account
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let db_path = resolve_db_path(config)?;
        info!("Opening mail store at {:?}", db_path);
        let store = Arc::new(MailStore::new(&db_path)?);
        Self::with_store(config, store).await
    }

    /// Same as [`Engine::new`] but over an existing store (used by tests
    /// with an in-memory database)
    pub async fn with_store(config: &AppConfig, store: Arc<MailStore>) -> Result<Self> {
        let (bus, tap) = ChangeBus::new(DEFAULT_CAPACITY);
        let bus = Arc::new(bus);
        let settings = Arc::new(RwLock::new(SpamSettings::from_config(config)));

        let provider: Arc<dyn SpamProvider> = Arc::new(OpenAiProvider::new(
            settings.clone(),
            Duration::from_secs(config.pipeline.request_timeout_secs),
        )?);
        let pipeline = ClassifierPipeline::new(
            store.clone(),
            bus.clone(),
            tap,
            provider,
            config.pipeline.clone(),
            settings.clone(),
        );
        let pipeline_task = tokio::spawn(pipeline.run());

        let mut adapters: HashMap<ProtocolKind, Arc<dyn MailAdapter>> = HashMap::new();
        let imap = ImapAdapter::new(Duration::from_secs(config.scheduler.connect_timeout_secs));
        adapters.insert(ProtocolKind::Imap, Arc::new(imap));

        let mut engine = Self {
            store,
            bus,
            adapters,
            accounts: HashMap::new(),
            settings,
            scheduler_config: config.scheduler.clone(),
            pipeline_task,
        };
        engine.apply_config(config).await?;
        Ok(engine)
    }

    /// Replace the built-in adapter for a protocol, or add one for a
    /// protocol the engine does not serve yet. Takes effect for accounts
    /// started after the call.
    pub fn register_adapter(&mut self, adapter: Arc<dyn MailAdapter>) {
        self.adapters.insert(adapter.protocol(), adapter);
    }

    /// Apply a configuration snapshot: stop removed accounts, keep
    /// unchanged ones running, start added or modified ones. Stopped
    /// tasks are awaited before a replacement spawns, so two sync passes
    /// for the same account never overlap. Fails without side effects
    /// when an account names a protocol no adapter serves.
    pub async fn apply_config(&mut self, config: &AppConfig) -> Result<()> {
        let mut desired: HashMap<String, (Account, Option<u64>)> = HashMap::new();
        for account_config in &config.accounts {
            let account = account_config.to_account();
            if !self.adapters.contains_key(&account.protocol) {
                return Err(CoreError::NotSupported(format!(
                    "no adapter for protocol {} (account {})",
                    account.protocol.as_str(),
                    account.id
                )));
            }
            desired.insert(
                account.id.clone(),
                (account, account_config.poll_interval_secs),
            );
        }

        if let Ok(mut guard) = self.settings.write() {
            *guard = SpamSettings::from_config(config);
        }
        self.scheduler_config = config.scheduler.clone();

        let removed: Vec<String> = self
            .accounts
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            if let Some(entry) = self.accounts.remove(&id) {
                info!("Stopping sync for removed account {}", id);
                entry.handle.stop();
                entry.task.abort();
                let _ = entry.task.await;
            }
            self.bus.remove_account(&id);
        }

        for (id, (account, poll_override)) in desired {
            let unchanged = self
                .accounts
                .get(&id)
                .map(|entry| {
                    entry.account == account
                        && entry.poll_override == poll_override
                        && entry.handle.state() != AccountState::Disabled
                })
                .unwrap_or(false);
            if unchanged {
                continue;
            }
            if let Some(entry) = self.accounts.remove(&id) {
                info!("Restarting sync for modified account {}", id);
                entry.handle.stop();
                entry.task.abort();
                // The old task must be fully gone before its successor
                // starts, or two sync passes could briefly overlap.
                let _ = entry.task.await;
            }
            self.start_account(account, poll_override);
        }
        Ok(())
    }

    fn start_account(&mut self, account: Account, poll_override: Option<u64>) {
        let adapter = match self.adapters.get(&account.protocol) {
            Some(adapter) => adapter.clone(),
            None => {
                // apply_config validated this already
                warn!("No adapter for account {}", account.id);
                return;
            }
        };
        let id = account.id.clone();
        let (scheduler, handle) = SyncScheduler::new(
            account.clone(),
            adapter,
            self.store.clone(),
            self.bus.clone(),
            self.scheduler_config.clone(),
            poll_override,
        );
        let task = tokio::spawn(async move { scheduler.run().await });
        self.accounts.insert(
            id,
            AccountEntry {
                account,
                poll_override,
                handle,
                task,
            },
        );
    }

    /// Subscribe to change events for one account
    pub fn subscribe(&self, account_id: &str) -> Subscription {
        self.bus.subscribe(account_id)
    }

    /// Current state of an account's sync task
    pub fn account_state(&self, account_id: &str) -> Option<AccountState> {
        self.accounts.get(account_id).map(|e| e.handle.state())
    }

    /// Accounts the engine currently serves
    pub fn account_ids(&self) -> Vec<String> {
        self.accounts.keys().cloned().collect()
    }

    /// Known folders of an account, from the local store
    pub fn folders(&self, account_id: &str) -> Result<Vec<MailFolder>> {
        self.store.folders(account_id)
    }

    /// Read a folder from the local store, newest first, optionally
    /// filtered by verdict label. Never touches the network.
    pub fn read_folder(
        &self,
        account_id: &str,
        folder: &str,
        filter: Option<VerdictLabel>,
    ) -> Result<Vec<(MailMessage, Verdict)>> {
        self.store.read_folder(account_id, folder, filter)
    }

    /// Fetch a message body, serving the local cache when possible and
    /// otherwise opening a short-lived session to the account's server.
    pub async fn fetch_body(&self, account_id: &str, folder: &str, uid: u32) -> Result<Vec<u8>> {
        if self
            .store
            .get_message(account_id, folder, uid)?
            .is_none()
        {
            return Err(CoreError::MessageNotFound(format!(
                "{}/{}/{}",
                account_id, folder, uid
            )));
        }
        if let Some(body) = self.store.cached_body(account_id, folder, uid)? {
            return Ok(body);
        }

        let entry = self
            .accounts
            .get(account_id)
            .ok_or_else(|| CoreError::AccountNotFound(account_id.to_string()))?;
        let adapter = self
            .adapters
            .get(&entry.account.protocol)
            .ok_or_else(|| {
                CoreError::NotSupported(format!(
                    "no adapter for protocol {}",
                    entry.account.protocol.as_str()
                ))
            })?;

        let mut session = adapter.connect(&entry.account).await?;
        let body = session.fetch_body(folder, uid).await;
        let _ = session.logout().await;
        let body = body?;
        self.store.cache_body(account_id, folder, uid, &body)?;
        Ok(body)
    }

    /// Mark a message read/unread or star/unstar it: pushed to the
    /// server over a short-lived session, then mirrored into the cache.
    pub async fn set_flag(
        &self,
        account_id: &str,
        folder: &str,
        uid: u32,
        flag: MessageFlag,
        value: bool,
    ) -> Result<()> {
        let entry = self
            .accounts
            .get(account_id)
            .ok_or_else(|| CoreError::AccountNotFound(account_id.to_string()))?;
        let adapter = self
            .adapters
            .get(&entry.account.protocol)
            .ok_or_else(|| {
                CoreError::NotSupported(format!(
                    "no adapter for protocol {}",
                    entry.account.protocol.as_str()
                ))
            })?;

        let mut session = adapter.connect(&entry.account).await?;
        let result = session.set_flags(folder, uid, flag, value).await;
        let _ = session.logout().await;
        result?;
        self.store.set_flag(account_id, folder, uid, flag, value)
    }

    /// Stop all sync tasks and the pipeline, waiting for them to finish
    pub async fn shutdown(&mut self) {
        info!("Shutting down engine");
        for (id, entry) in self.accounts.drain() {
            entry.handle.stop();
            entry.task.abort();
            let _ = entry.task.await;
            self.bus.remove_account(&id);
        }
        self.pipeline_task.abort();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for (_, entry) in self.accounts.drain() {
            entry.handle.stop();
            entry.task.abort();
        }
        self.pipeline_task.abort();
    }
}

/// Database location: explicit config, else the platform data directory
fn resolve_db_path(config: &AppConfig) -> Result<PathBuf> {
    if let Some(path) = &config.db_path {
        return Ok(path.clone());
    }
    let data_dir = dirs::data_dir()
        .ok_or_else(|| CoreError::Config("cannot determine data directory".to_string()))?;
    Ok(data_dir.join("nicemail").join("cache.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterSession, FetchPage, RemoteFolder};
    use crate::types::ChangeEvent;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    type FlagCalls = Arc<Mutex<Vec<(String, u32, MessageFlag, bool)>>>;

    struct NullAdapter {
        protocol: ProtocolKind,
        connects: Arc<AtomicUsize>,
        flag_calls: FlagCalls,
    }

    impl NullAdapter {
        fn imap() -> Self {
            Self {
                protocol: ProtocolKind::Imap,
                connects: Arc::new(AtomicUsize::new(0)),
                flag_calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl MailAdapter for NullAdapter {
        fn protocol(&self) -> ProtocolKind {
            self.protocol
        }

        async fn connect(&self, _account: &Account) -> Result<Box<dyn AdapterSession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullSession {
                flag_calls: self.flag_calls.clone(),
            }))
        }
    }

    struct NullSession {
        flag_calls: FlagCalls,
    }

    #[async_trait]
    impl AdapterSession for NullSession {
        async fn list_folders(&mut self) -> Result<Vec<RemoteFolder>> {
            Ok(Vec::new())
        }

        async fn fetch_new(&mut self, _folder: &str, watermark: u32) -> Result<FetchPage> {
            Ok(FetchPage {
                messages: Vec::new(),
                watermark,
            })
        }

        async fn fetch_body(&mut self, _folder: &str, _uid: u32) -> Result<Vec<u8>> {
            Ok(b"body".to_vec())
        }

        async fn set_flags(
            &mut self,
            folder: &str,
            uid: u32,
            flag: MessageFlag,
            value: bool,
        ) -> Result<()> {
            self.flag_calls
                .lock()
                .unwrap()
                .push((folder.to_string(), uid, flag, value));
            Ok(())
        }

        fn supports_idle(&self) -> bool {
            false
        }

        async fn logout(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Adapter whose sessions linger in fetch_new, flagging any moment
    /// two of them run at once.
    struct SlowAdapter {
        active: Arc<AtomicUsize>,
        overlapped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MailAdapter for SlowAdapter {
        fn protocol(&self) -> ProtocolKind {
            ProtocolKind::Imap
        }

        async fn connect(&self, _account: &Account) -> Result<Box<dyn AdapterSession>> {
            Ok(Box::new(SlowSession {
                active: self.active.clone(),
                overlapped: self.overlapped.clone(),
            }))
        }
    }

    struct SlowSession {
        active: Arc<AtomicUsize>,
        overlapped: Arc<AtomicBool>,
    }

    // Decrements on drop so a task cancelled mid-fetch still releases
    // its slot.
    struct CycleGuard(Arc<AtomicUsize>);

    impl Drop for CycleGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AdapterSession for SlowSession {
        async fn list_folders(&mut self) -> Result<Vec<RemoteFolder>> {
            Ok(Vec::new())
        }

        async fn fetch_new(&mut self, _folder: &str, watermark: u32) -> Result<FetchPage> {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            let _guard = CycleGuard(self.active.clone());
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(FetchPage {
                messages: Vec::new(),
                watermark,
            })
        }

        async fn fetch_body(&mut self, _folder: &str, _uid: u32) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn set_flags(
            &mut self,
            _folder: &str,
            _uid: u32,
            _flag: MessageFlag,
            _value: bool,
        ) -> Result<()> {
            Ok(())
        }

        fn supports_idle(&self) -> bool {
            false
        }

        async fn logout(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn config_with(addresses: &[&str]) -> AppConfig {
        let accounts = addresses
            .iter()
            .map(|a| {
                toml::from_str(&format!(
                    r#"
                    name = "Test"
                    address = "{}"
                    incoming_server = "imap.example.com"
                    password = "secret"
                    "#,
                    a
                ))
                .unwrap()
            })
            .collect();
        AppConfig {
            accounts,
            ..AppConfig::default()
        }
    }

    async fn engine_with(config: &AppConfig) -> Engine {
        let store = Arc::new(MailStore::in_memory().unwrap());
        let mut engine = Engine::with_store(&AppConfig::default(), store).await.unwrap();
        engine.register_adapter(Arc::new(NullAdapter::imap()));
        engine.apply_config(config).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_accounts_follow_config() {
        crate::test_trace_init();
        let mut engine = engine_with(&config_with(&["a@example.com", "b@example.com"])).await;
        let mut ids = engine.account_ids();
        ids.sort();
        assert_eq!(ids, vec!["a@example.com", "b@example.com"]);
        assert!(engine.account_state("a@example.com").is_some());

        // Reload without the second account
        engine
            .apply_config(&config_with(&["a@example.com"]))
            .await
            .unwrap();
        assert_eq!(engine.account_ids(), vec!["a@example.com"]);
        assert!(engine.account_state("b@example.com").is_none());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsupported_protocol_is_rejected() {
        let store = Arc::new(MailStore::in_memory().unwrap());
        let mut engine = Engine::with_store(&AppConfig::default(), store).await.unwrap();

        let mut config = config_with(&["a@example.com"]);
        config.accounts[0].protocol = ProtocolKind::Pop3;
        let result = engine.apply_config(&config).await;
        assert!(matches!(result, Err(CoreError::NotSupported(_))));
        assert!(engine.account_ids().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_body_prefers_cache() {
        let adapter = NullAdapter::imap();
        let connects = adapter.connects.clone();

        let store = Arc::new(MailStore::in_memory().unwrap());
        store.ensure_folder("a@example.com", "INBOX", "INBOX").unwrap();
        let message = MailMessage {
            uid: 1,
            subject: "s".to_string(),
            sender: "x@example.com".to_string(),
            date: chrono::Utc::now(),
            snippet: String::new(),
            is_unread: true,
            is_flagged: false,
            size: None,
        };
        store
            .upsert_messages("a@example.com", "INBOX", &[message])
            .unwrap();
        store
            .cache_body("a@example.com", "INBOX", 1, b"cached body")
            .unwrap();

        let mut engine = Engine::with_store(&AppConfig::default(), store).await.unwrap();
        engine.register_adapter(Arc::new(adapter));
        engine
            .apply_config(&config_with(&["a@example.com"]))
            .await
            .unwrap();

        // Wait for the first sync cycle so the task is parked on its poll
        // interval and the connect count is stable.
        let mut sub = engine.subscribe("a@example.com");
        loop {
            match sub.recv().await {
                Some(ChangeEvent::FolderSynced { .. }) => break,
                Some(_) => continue,
                None => panic!("bus closed before first sync"),
            }
        }
        let before = connects.load(Ordering::SeqCst);

        let body = engine.fetch_body("a@example.com", "INBOX", 1).await.unwrap();
        assert_eq!(body, b"cached body");
        assert_eq!(connects.load(Ordering::SeqCst), before);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_fetch_body_unknown_message() {
        let mut engine = engine_with(&config_with(&["a@example.com"])).await;
        let result = engine.fetch_body("a@example.com", "INBOX", 42).await;
        assert!(matches!(result, Err(CoreError::MessageNotFound(_))));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_flag_hits_server_and_cache() {
        let adapter = NullAdapter::imap();
        let flag_calls = adapter.flag_calls.clone();

        let store = Arc::new(MailStore::in_memory().unwrap());
        store.ensure_folder("a@example.com", "INBOX", "INBOX").unwrap();
        let message = MailMessage {
            uid: 1,
            subject: "s".to_string(),
            sender: "x@example.com".to_string(),
            date: chrono::Utc::now(),
            snippet: String::new(),
            is_unread: true,
            is_flagged: false,
            size: None,
        };
        store
            .upsert_messages("a@example.com", "INBOX", &[message])
            .unwrap();

        let mut engine = Engine::with_store(&AppConfig::default(), store.clone())
            .await
            .unwrap();
        engine.register_adapter(Arc::new(adapter));
        engine
            .apply_config(&config_with(&["a@example.com"]))
            .await
            .unwrap();

        engine
            .set_flag("a@example.com", "INBOX", 1, MessageFlag::Seen, true)
            .await
            .unwrap();

        let calls = flag_calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("INBOX".to_string(), 1, MessageFlag::Seen, true)]);
        let (stored, _) = store
            .get_message("a@example.com", "INBOX", 1)
            .unwrap()
            .unwrap();
        assert!(!stored.is_unread);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_waits_for_previous_task() {
        crate::test_trace_init();
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));

        let store = Arc::new(MailStore::in_memory().unwrap());
        let mut engine = Engine::with_store(&AppConfig::default(), store).await.unwrap();
        engine.register_adapter(Arc::new(SlowAdapter {
            active: active.clone(),
            overlapped: overlapped.clone(),
        }));

        // Each reload modifies the account, forcing a restart while the
        // old task may still be inside its slow fetch.
        for round in 0..5 {
            let mut config = config_with(&["a@example.com"]);
            config.accounts[0].password = Some(format!("secret-{}", round));
            engine.apply_config(&config).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        engine.shutdown().await;

        assert!(!overlapped.load(Ordering::SeqCst));
    }
}

//! Asynchronous spam classification pipeline
//!
//! Consumes new-message events off the change bus tap, batches them and
//! submits each batch to an external provider. Verdicts are written back
//! through the store, which enforces the forward-only transition from
//! `unclassified`; a `VerdictUpdated` event is emitted only when a row
//! actually changed. Classification never blocks sync: a provider outage
//! leaves messages `unclassified` and they are retried up to a bounded
//! number of attempts before being marked `not_evaluated`.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::ChangeBus;
use crate::config::{AppConfig, PipelineConfig, SpamConfig};
use crate::error::{CoreError, Result};
use crate::store::MailStore;
use crate::types::{ChangeEvent, Verdict, VerdictLabel};

/// Identifies one message awaiting classification
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub account_id: String,
    pub folder: String,
    pub uid: u32,
}

/// What the provider sees for one message. Bodies are never sent; the
/// snippet is already length-bounded by the adapter.
#[derive(Debug, Clone)]
pub struct MessageFeatures {
    /// Position within the batch, echoed back by the provider
    pub id: usize,
    pub sender: String,
    pub subject: String,
    pub snippet: String,
}

/// One provider judgement
#[derive(Debug, Clone)]
pub struct SpamAssessment {
    pub id: usize,
    /// Probability in [0, 1] that the message is spam
    pub spam_probability: f32,
}

/// External spam assessment backend
#[async_trait]
pub trait SpamProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Assess a batch. Returning fewer assessments than messages is
    /// allowed; missing ones are treated as failed attempts.
    async fn assess(&self, messages: &[MessageFeatures]) -> Result<Vec<SpamAssessment>>;
}

/// Classification settings shared between the engine and the pipeline.
/// Replaced wholesale on configuration reload.
#[derive(Debug, Clone, Default)]
pub struct SpamSettings {
    pub global: SpamConfig,
    /// Per-account threshold overrides, keyed by account id
    pub thresholds: HashMap<String, f32>,
}

impl SpamSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let thresholds = config
            .accounts
            .iter()
            .filter_map(|a| a.spam_threshold.map(|t| (a.address.clone(), t)))
            .collect();
        Self {
            global: config.spam.clone(),
            thresholds,
        }
    }

    fn threshold_for(&self, account_id: &str) -> f32 {
        self.thresholds
            .get(account_id)
            .copied()
            .unwrap_or(self.global.threshold)
    }
}

/// How long the pipeline sits idle before sweeping the store for
/// unclassified messages it never saw an event for
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const SYSTEM_PROMPT: &str = "You are an email security assistant. For each numbered \
message you are given, judge whether it is spam (unsolicited bulk mail, phishing, \
scams or fraud). Respond with only a JSON array of objects of the form \
{\"id\": <number>, \"is_spam\": <true|false>, \"confidence\": <0.0-1.0>} and no \
other text.";

/// OpenAI-compatible chat completions provider. Reads the shared
/// settings on every call so a configuration reload takes effect
/// without rebuilding the pipeline.
pub struct OpenAiProvider {
    client: reqwest::Client,
    settings: Arc<RwLock<SpamSettings>>,
    name: String,
}

impl OpenAiProvider {
    pub fn new(settings: Arc<RwLock<SpamSettings>>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        let name = settings
            .read()
            .map(|s| s.global.provider.clone())
            .unwrap_or_else(|_| "chatgpt".to_string());
        Ok(Self {
            client,
            settings,
            name,
        })
    }

    fn current_config(&self) -> Result<SpamConfig> {
        self.settings
            .read()
            .map(|s| s.global.clone())
            .map_err(|_| CoreError::Classifier("settings lock poisoned".to_string()))
    }

    fn user_payload(messages: &[MessageFeatures]) -> String {
        let mut payload = String::new();
        for m in messages {
            payload.push_str(&format!(
                "Message {}:\nFrom: {}\nSubject: {}\nPreview: {}\n\n",
                m.id, m.sender, m.subject, m.snippet
            ));
        }
        payload
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize)]
struct RawAssessment {
    id: usize,
    is_spam: bool,
    confidence: f32,
}

/// Models wrap JSON in markdown fences often enough to handle it here
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

fn parse_assessments(content: &str) -> Result<Vec<SpamAssessment>> {
    let raw: Vec<RawAssessment> = serde_json::from_str(strip_code_fence(content))
        .map_err(|e| CoreError::Classifier(format!("unparseable provider reply: {}", e)))?;
    Ok(raw
        .into_iter()
        .map(|r| {
            let confidence = r.confidence.clamp(0.0, 1.0);
            SpamAssessment {
                id: r.id,
                spam_probability: if r.is_spam { confidence } else { 1.0 - confidence },
            }
        })
        .collect())
}

#[async_trait]
impl SpamProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn assess(&self, messages: &[MessageFeatures]) -> Result<Vec<SpamAssessment>> {
        let config = self.current_config()?;
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| CoreError::Classifier("no API key configured".to_string()))?;

        let body = json!({
            "model": config.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": Self::user_payload(messages) },
            ],
        });
        let url = format!("{}/chat/completions", config.api_base.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(CoreError::Classifier(format!(
                "provider returned {}: {}",
                status,
                detail.chars().take(200).collect::<String>()
            )));
        }

        let reply: ChatResponse = response.json().await?;
        let content = reply
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| CoreError::Classifier("provider reply had no choices".to_string()))?;
        parse_assessments(content)
    }
}

/// The batching classification loop
pub struct ClassifierPipeline {
    store: Arc<MailStore>,
    bus: Arc<ChangeBus>,
    events: flume::Receiver<ChangeEvent>,
    provider: Arc<dyn SpamProvider>,
    config: PipelineConfig,
    settings: Arc<RwLock<SpamSettings>>,
    attempts: HashMap<MessageRef, u32>,
    retries: VecDeque<MessageRef>,
}

impl ClassifierPipeline {
    pub fn new(
        store: Arc<MailStore>,
        bus: Arc<ChangeBus>,
        events: flume::Receiver<ChangeEvent>,
        provider: Arc<dyn SpamProvider>,
        config: PipelineConfig,
        settings: Arc<RwLock<SpamSettings>>,
    ) -> Self {
        Self {
            store,
            bus,
            events,
            provider,
            config,
            settings,
            attempts: HashMap::new(),
            retries: VecDeque::new(),
        }
    }

    /// Run until the event tap disconnects
    pub async fn run(mut self) {
        info!("Classification pipeline started");
        loop {
            let batch = match self.collect_batch().await {
                Some(batch) => batch,
                None => break,
            };
            if !batch.is_empty() {
                self.process_batch(batch).await;
            }
        }
        info!("Classification pipeline stopped");
    }

    /// Gather the next batch: retries first, then bus events until the
    /// batch is full or the time window expires. `None` means the tap is
    /// closed and the pipeline should stop.
    async fn collect_batch(&mut self) -> Option<Vec<MessageRef>> {
        let mut batch: Vec<MessageRef> = Vec::new();
        while batch.len() < self.config.max_batch {
            match self.retries.pop_front() {
                Some(m) => batch.push(m),
                None => break,
            }
        }

        // Block for the first event only when nothing is pending yet.
        if batch.is_empty() {
            loop {
                match tokio::time::timeout(SWEEP_INTERVAL, self.events.recv_async()).await {
                    Ok(Ok(event)) => {
                        if let Some(m) = candidate_from(&event) {
                            batch.push(m);
                            break;
                        }
                    }
                    Ok(Err(_)) => return None,
                    Err(_) => {
                        // Idle long enough that anything shed off the tap
                        // (or left over from a previous run) is worth
                        // sweeping out of the store directly.
                        return Some(self.sweep_batch());
                    }
                }
            }
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.batch_window_ms);
        while batch.len() < self.config.max_batch {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.events.recv_async()).await {
                Ok(Ok(event)) => {
                    if let Some(m) = candidate_from(&event) {
                        batch.push(m);
                    }
                }
                Ok(Err(_)) => {
                    // Tap closed; flush what we have, stop next round
                    break;
                }
                Err(_) => break,
            }
        }
        Some(batch)
    }

    /// Unclassified rows straight from the store. Catches messages whose
    /// events were shed from a full tap and placeholders surviving a
    /// previous process.
    pub(crate) fn sweep_batch(&self) -> Vec<MessageRef> {
        let backlog = match self.store.unclassified(self.config.max_batch) {
            Ok(backlog) => backlog,
            Err(e) => {
                warn!("Backlog sweep failed: {}", e);
                return Vec::new();
            }
        };
        backlog
            .into_iter()
            .map(|(account_id, folder, uid)| MessageRef {
                account_id,
                folder,
                uid,
            })
            .filter(|m| !self.retries.contains(m))
            .collect()
    }

    /// Classify one batch and write verdicts back
    pub(crate) async fn process_batch(&mut self, batch: Vec<MessageRef>) {
        let settings = match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };

        // Only messages still unclassified are candidates; everything
        // else raced with a previous attempt or a reload.
        let mut candidates: Vec<MessageRef> = Vec::new();
        let mut features: Vec<MessageFeatures> = Vec::new();
        for m in batch {
            let entry = match self.store.get_message(&m.account_id, &m.folder, m.uid) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.attempts.remove(&m);
                    continue;
                }
                Err(e) => {
                    warn!("Failed to load {}/{}/{}: {}", m.account_id, m.folder, m.uid, e);
                    continue;
                }
            };
            let (message, verdict) = entry;
            if verdict.label != VerdictLabel::Unclassified {
                self.attempts.remove(&m);
                continue;
            }
            features.push(MessageFeatures {
                id: candidates.len(),
                sender: message.sender,
                subject: message.subject,
                snippet: message.snippet,
            });
            candidates.push(m);
        }
        if candidates.is_empty() {
            return;
        }

        if !settings.global.is_active() {
            // No key or disabled: mark without ever calling out
            for m in &candidates {
                self.write_and_emit(m, Verdict {
                    label: VerdictLabel::NotEvaluated,
                    confidence: None,
                    provider: None,
                    classified_at: Some(Utc::now()),
                });
                self.attempts.remove(m);
            }
            return;
        }

        debug!("Submitting batch of {} to {}", candidates.len(), self.provider.name());
        match self.provider.assess(&features).await {
            Ok(assessments) => {
                let by_id: HashMap<usize, f32> = assessments
                    .into_iter()
                    .map(|a| (a.id, a.spam_probability))
                    .collect();
                for (id, m) in candidates.iter().enumerate() {
                    match by_id.get(&id) {
                        Some(&probability) => {
                            let threshold = settings.threshold_for(&m.account_id);
                            let label = if probability >= threshold {
                                VerdictLabel::Spam
                            } else {
                                VerdictLabel::Ham
                            };
                            self.write_and_emit(m, Verdict {
                                label,
                                confidence: Some(probability),
                                provider: Some(self.provider.name().to_string()),
                                classified_at: Some(Utc::now()),
                            });
                            self.attempts.remove(m);
                        }
                        None => self.record_failure(m.clone()),
                    }
                }
            }
            Err(e) => {
                warn!("Spam provider call failed: {}", e);
                for m in candidates {
                    self.record_failure(m);
                }
            }
        }
    }

    /// Count a failed attempt; after the last one the message is marked
    /// `not_evaluated` instead of being retried forever.
    fn record_failure(&mut self, m: MessageRef) {
        let attempts = self.attempts.entry(m.clone()).or_insert(0);
        *attempts += 1;
        if *attempts >= self.config.max_attempts {
            debug!(
                "Giving up on {}/{}/{} after {} attempts",
                m.account_id, m.folder, m.uid, attempts
            );
            self.attempts.remove(&m);
            self.write_and_emit(&m, Verdict {
                label: VerdictLabel::NotEvaluated,
                confidence: None,
                provider: None,
                classified_at: Some(Utc::now()),
            });
        } else {
            self.retries.push_back(m);
        }
    }

    fn write_and_emit(&self, m: &MessageRef, verdict: Verdict) {
        match self.store.write_verdict(&m.account_id, &m.folder, m.uid, &verdict) {
            Ok(true) => {
                self.bus.publish(ChangeEvent::VerdictUpdated {
                    account_id: m.account_id.clone(),
                    folder: m.folder.clone(),
                    uid: m.uid,
                    label: verdict.label,
                    classified_at: verdict.classified_at.unwrap_or_else(Utc::now),
                });
            }
            Ok(false) => {
                // Already classified by someone else; stale attempt
            }
            Err(e) => {
                warn!(
                    "Failed to store verdict for {}/{}/{}: {}",
                    m.account_id, m.folder, m.uid, e
                );
            }
        }
    }

    #[cfg(test)]
    fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    #[cfg(test)]
    fn drain_retries(&mut self) -> Vec<MessageRef> {
        self.retries.drain(..).collect()
    }
}

/// Only freshly stored messages enter the pipeline
fn candidate_from(event: &ChangeEvent) -> Option<MessageRef> {
    match event {
        ChangeEvent::NewMessage {
            account_id,
            folder,
            uid,
            ..
        } => Some(MessageRef {
            account_id: account_id.clone(),
            folder: folder.clone(),
            uid: *uid,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DEFAULT_CAPACITY;
    use crate::types::MailMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubProvider {
        calls: AtomicUsize,
        replies: Mutex<VecDeque<Result<Vec<SpamAssessment>>>>,
    }

    impl StubProvider {
        fn with_replies(replies: Vec<Result<Vec<SpamAssessment>>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                replies: Mutex::new(replies.into()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SpamProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn assess(&self, _messages: &[MessageFeatures]) -> Result<Vec<SpamAssessment>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CoreError::Classifier("script exhausted".into())))
        }
    }

    fn message(uid: u32, subject: &str) -> MailMessage {
        MailMessage {
            uid,
            subject: subject.to_string(),
            sender: "sender@example.com".to_string(),
            date: Utc::now(),
            snippet: "preview text".to_string(),
            is_unread: true,
            is_flagged: false,
            size: None,
        }
    }

    fn message_ref(uid: u32) -> MessageRef {
        MessageRef {
            account_id: "a@example.com".to_string(),
            folder: "INBOX".to_string(),
            uid,
        }
    }

    fn active_settings(threshold: f32) -> SpamSettings {
        SpamSettings {
            global: SpamConfig {
                api_key: Some("sk-test".to_string()),
                threshold,
                ..SpamConfig::default()
            },
            thresholds: HashMap::new(),
        }
    }

    struct Fixture {
        pipeline: ClassifierPipeline,
        store: Arc<MailStore>,
        provider: Arc<StubProvider>,
    }

    fn fixture(
        settings: SpamSettings,
        replies: Vec<Result<Vec<SpamAssessment>>>,
        uids: &[u32],
    ) -> Fixture {
        let store = Arc::new(MailStore::in_memory().unwrap());
        store.ensure_folder("a@example.com", "INBOX", "INBOX").unwrap();
        let messages: Vec<MailMessage> = uids
            .iter()
            .map(|&uid| message(uid, &format!("subject {}", uid)))
            .collect();
        store
            .upsert_messages("a@example.com", "INBOX", &messages)
            .unwrap();

        let (bus, tap) = ChangeBus::new(DEFAULT_CAPACITY);
        let provider = StubProvider::with_replies(replies);
        let pipeline = ClassifierPipeline::new(
            store.clone(),
            Arc::new(bus),
            tap,
            provider.clone(),
            PipelineConfig::default(),
            Arc::new(RwLock::new(settings)),
        );
        Fixture {
            pipeline,
            store,
            provider,
        }
    }

    fn verdict_of(store: &MailStore, uid: u32) -> Verdict {
        store
            .get_message("a@example.com", "INBOX", uid)
            .unwrap()
            .unwrap()
            .1
    }

    #[tokio::test]
    async fn test_inactive_config_short_circuits() {
        crate::test_trace_init();
        let mut f = fixture(SpamSettings::default(), vec![], &[1, 2]);
        let mut sub = f.pipeline.bus.subscribe("a@example.com");

        f.pipeline
            .process_batch(vec![message_ref(1), message_ref(2)])
            .await;

        assert_eq!(f.provider.calls(), 0);
        assert_eq!(verdict_of(&f.store, 1).label, VerdictLabel::NotEvaluated);
        assert_eq!(verdict_of(&f.store, 2).label, VerdictLabel::NotEvaluated);
        for _ in 0..2 {
            match sub.try_recv() {
                Some(ChangeEvent::VerdictUpdated { label, .. }) => {
                    assert_eq!(label, VerdictLabel::NotEvaluated)
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_threshold_splits_spam_from_ham() {
        let replies = vec![Ok(vec![
            SpamAssessment {
                id: 0,
                spam_probability: 0.8,
            },
            SpamAssessment {
                id: 1,
                spam_probability: 0.4,
            },
        ])];
        let mut f = fixture(active_settings(0.6), replies, &[10, 11]);

        f.pipeline
            .process_batch(vec![message_ref(10), message_ref(11)])
            .await;

        assert_eq!(f.provider.calls(), 1);
        let spam = verdict_of(&f.store, 10);
        assert_eq!(spam.label, VerdictLabel::Spam);
        assert_eq!(spam.confidence, Some(0.8));
        assert_eq!(spam.provider.as_deref(), Some("stub"));
        assert_eq!(verdict_of(&f.store, 11).label, VerdictLabel::Ham);
    }

    #[tokio::test]
    async fn test_exact_threshold_is_spam() {
        let replies = vec![Ok(vec![SpamAssessment {
            id: 0,
            spam_probability: 0.6,
        }])];
        let mut f = fixture(active_settings(0.6), replies, &[5]);
        f.pipeline.process_batch(vec![message_ref(5)]).await;
        assert_eq!(verdict_of(&f.store, 5).label, VerdictLabel::Spam);
    }

    #[tokio::test]
    async fn test_account_threshold_override() {
        let mut settings = active_settings(0.6);
        settings.thresholds.insert("a@example.com".to_string(), 0.9);
        let replies = vec![Ok(vec![SpamAssessment {
            id: 0,
            spam_probability: 0.8,
        }])];
        let mut f = fixture(settings, replies, &[5]);
        f.pipeline.process_batch(vec![message_ref(5)]).await;
        // 0.8 clears the global default but not this account's override
        assert_eq!(verdict_of(&f.store, 5).label, VerdictLabel::Ham);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds_before_giving_up() {
        let replies = vec![
            Err(CoreError::Classifier("outage".into())),
            Err(CoreError::Classifier("outage".into())),
            Ok(vec![SpamAssessment {
                id: 0,
                spam_probability: 0.9,
            }]),
        ];
        let mut f = fixture(active_settings(0.6), replies, &[7]);
        let mut sub = f.pipeline.bus.subscribe("a@example.com");

        f.pipeline.process_batch(vec![message_ref(7)]).await;
        assert_eq!(f.pipeline.pending_retries(), 1);
        assert_eq!(verdict_of(&f.store, 7).label, VerdictLabel::Unclassified);

        let retry = f.pipeline.drain_retries();
        f.pipeline.process_batch(retry).await;
        let retry = f.pipeline.drain_retries();
        f.pipeline.process_batch(retry).await;

        assert_eq!(f.provider.calls(), 3);
        assert_eq!(verdict_of(&f.store, 7).label, VerdictLabel::Spam);
        // Exactly one VerdictUpdated despite three attempts
        assert!(matches!(
            sub.try_recv(),
            Some(ChangeEvent::VerdictUpdated { .. })
        ));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let replies = vec![
            Err(CoreError::Classifier("outage".into())),
            Err(CoreError::Classifier("outage".into())),
            Err(CoreError::Classifier("outage".into())),
        ];
        let mut f = fixture(active_settings(0.6), replies, &[7]);

        for _ in 0..3 {
            let mut batch = f.pipeline.drain_retries();
            if batch.is_empty() {
                batch = vec![message_ref(7)];
            }
            f.pipeline.process_batch(batch).await;
        }

        assert_eq!(f.provider.calls(), 3);
        assert_eq!(f.pipeline.pending_retries(), 0);
        let verdict = verdict_of(&f.store, 7);
        assert_eq!(verdict.label, VerdictLabel::NotEvaluated);
        assert_eq!(verdict.confidence, None);
    }

    #[tokio::test]
    async fn test_already_classified_is_skipped() {
        let replies = vec![Ok(vec![SpamAssessment {
            id: 0,
            spam_probability: 0.9,
        }])];
        let mut f = fixture(active_settings(0.6), replies, &[3]);
        f.store
            .write_verdict(
                "a@example.com",
                "INBOX",
                3,
                &Verdict {
                    label: VerdictLabel::Ham,
                    confidence: Some(0.2),
                    provider: Some("stub".to_string()),
                    classified_at: Some(Utc::now()),
                },
            )
            .unwrap();

        f.pipeline.process_batch(vec![message_ref(3)]).await;

        // Nothing left to classify, so the provider is never called
        assert_eq!(f.provider.calls(), 0);
        assert_eq!(verdict_of(&f.store, 3).label, VerdictLabel::Ham);
    }

    #[tokio::test]
    async fn test_sweep_recovers_eventless_backlog() {
        // Messages landed in the store but their events never reached the
        // pipeline (shed tap); the sweep still finds them.
        let mut f = fixture(active_settings(0.6), vec![], &[20, 21]);
        f.pipeline.retries.push_back(message_ref(21));

        let swept = f.pipeline.sweep_batch();
        // Pending retries are not double-collected
        assert_eq!(swept, vec![message_ref(20)]);

        f.store
            .write_verdict(
                "a@example.com",
                "INBOX",
                20,
                &Verdict {
                    label: VerdictLabel::Ham,
                    confidence: Some(0.1),
                    provider: Some("stub".to_string()),
                    classified_at: Some(Utc::now()),
                },
            )
            .unwrap();
        f.pipeline.retries.clear();
        let swept = f.pipeline.sweep_batch();
        assert_eq!(swept, vec![message_ref(21)]);
    }

    #[test]
    fn test_parse_assessments_plain_and_fenced() {
        let plain = r#"[{"id": 0, "is_spam": true, "confidence": 0.95}]"#;
        let parsed = parse_assessments(plain).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!((parsed[0].spam_probability - 0.95).abs() < f32::EPSILON);

        let fenced = "```json\n[{\"id\": 1, \"is_spam\": false, \"confidence\": 0.9}]\n```";
        let parsed = parse_assessments(fenced).unwrap();
        assert_eq!(parsed[0].id, 1);
        // Confident-ham maps to a low spam probability
        assert!((parsed[0].spam_probability - 0.1).abs() < 1e-6);

        assert!(parse_assessments("not json").is_err());
    }

    #[test]
    fn test_settings_from_config() {
        let config: AppConfig = toml::from_str(
            r#"
            [[accounts]]
            name = "A"
            address = "a@example.com"
            incoming_server = "imap.example.com"
            spam_threshold = 0.8

            [spam]
            api_key = "sk-test"
            "#,
        )
        .unwrap();
        let settings = SpamSettings::from_config(&config);
        assert!(settings.global.is_active());
        assert_eq!(settings.threshold_for("a@example.com"), 0.8);
        assert_eq!(settings.threshold_for("other@example.com"), 0.6);
    }
}

//! Core data model shared across the engine
//!
//! Accounts, folders, messages, classification verdicts and the change
//! events the UI subscribes to. The local database is a cache of server
//! state; UIDs are the identity keys for dedup across sync passes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Protocol kind an account speaks. IMAP ships today; the remaining
/// variants exist so configuration can already name them and adapters can
/// be registered per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Imap,
    Pop3,
    Smtp,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Imap => "imap",
            Self::Pop3 => "pop3",
            Self::Smtp => "smtp",
        }
    }
}

/// A configured mail account. Immutable for a session; configuration
/// reload replaces the whole account set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Stable identifier, the email address
    pub id: String,
    /// Display name
    pub name: String,
    /// Email address
    pub address: String,
    /// Protocol this account speaks
    pub protocol: ProtocolKind,
    /// Incoming server hostname
    pub host: String,
    /// Incoming server port
    pub port: u16,
    /// Login username (falls back to the address when absent)
    pub username: Option<String>,
    /// Password or credential reference
    pub password: Option<String>,
    /// Use TLS for the connection
    pub use_ssl: bool,
}

impl Account {
    /// Username to present at login
    pub fn login_user(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.address)
    }
}

/// A folder within an account, with its sync watermark.
///
/// The watermark is the highest remote UID already persisted; it only
/// advances, never regresses, except on an explicit resync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailFolder {
    pub account_id: String,
    pub name: String,
    /// Protocol-level identifier (for IMAP, the mailbox name)
    pub remote_id: String,
    pub watermark: u32,
    pub last_sync: Option<DateTime<Utc>>,
}

/// A mutable per-message flag, settable through the protocol adapter.
/// `Seen` set means the message has been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFlag {
    Seen,
    Flagged,
}

/// A synced message. UID is unique within its folder and is the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub uid: u32,
    pub subject: String,
    pub sender: String,
    pub date: DateTime<Utc>,
    /// Short plain-text preview, whitespace-flattened, at most 200 chars
    pub snippet: String,
    pub is_unread: bool,
    pub is_flagged: bool,
    pub size: Option<u32>,
}

/// Classification outcome for a message. Every persisted message has
/// exactly one verdict, created with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictLabel {
    /// Not yet classified; the only non-terminal state
    Unclassified,
    Spam,
    Ham,
    /// Classification disabled or given up after bounded retries
    NotEvaluated,
}

impl VerdictLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unclassified => "unclassified",
            Self::Spam => "spam",
            Self::Ham => "ham",
            Self::NotEvaluated => "not_evaluated",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "spam" => Self::Spam,
            "ham" => Self::Ham,
            "not_evaluated" => Self::NotEvaluated,
            _ => Self::Unclassified,
        }
    }

    /// Terminal labels never transition back to `Unclassified`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Unclassified)
    }
}

/// Verdict record, one-to-one with a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub label: VerdictLabel,
    /// Spam probability in [0, 1]; absent until a provider responded
    pub confidence: Option<f32>,
    pub provider: Option<String>,
    pub classified_at: Option<DateTime<Utc>>,
}

impl Verdict {
    /// Placeholder created atomically with a new message.
    pub fn unclassified() -> Self {
        Self {
            label: VerdictLabel::Unclassified,
            confidence: None,
            provider: None,
            classified_at: None,
        }
    }
}

/// Event emitted on the change bus. Ordered by emission time within an
/// account; carries enough identity (UID, verdict timestamp) for
/// subscribers to deduplicate at-least-once delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChangeEvent {
    NewMessage {
        account_id: String,
        folder: String,
        uid: u32,
        subject: String,
        sender: String,
    },
    VerdictUpdated {
        account_id: String,
        folder: String,
        uid: u32,
        label: VerdictLabel,
        classified_at: DateTime<Utc>,
    },
    FolderSynced {
        account_id: String,
        folder: String,
        new_messages: u32,
        watermark: u32,
    },
    SyncError {
        account_id: String,
        reason: String,
        /// True when the account moved to `Disabled` and will not retry
        fatal: bool,
    },
    /// Emitted to a subscriber that fell behind and lost events; the UI
    /// should do a full refresh via `read_folder`.
    Gap { account_id: String },
}

impl ChangeEvent {
    pub fn account_id(&self) -> &str {
        match self {
            Self::NewMessage { account_id, .. }
            | Self::VerdictUpdated { account_id, .. }
            | Self::FolderSynced { account_id, .. }
            | Self::SyncError { account_id, .. }
            | Self::Gap { account_id } => account_id,
        }
    }
}

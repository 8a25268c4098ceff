//! Protocol adapter capability interface
//!
//! A uniform contract over a remote mailbox, polymorphic per protocol.
//! IMAP is the shipped variant; POP3/SMTP implement the same traits later
//! and are selected by account configuration. There is no shared state
//! between implementations, only this contract.
//!
//! Connection failures are not retried here; the sync scheduler owns
//! retry and backoff policy. A session may keep a live network connection
//! open and owns its teardown via [`AdapterSession::logout`].

pub mod imap;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Account, MailMessage, MessageFlag, ProtocolKind};

/// Folder descriptor as reported by the remote server
#[derive(Debug, Clone)]
pub struct RemoteFolder {
    /// Local folder name
    pub name: String,
    /// Protocol-level identifier
    pub remote_id: String,
}

/// Result of one incremental fetch
#[derive(Debug, Clone)]
pub struct FetchPage {
    /// New messages in ascending UID order
    pub messages: Vec<MailMessage>,
    /// Watermark after this fetch; equals the input watermark when
    /// nothing new arrived
    pub watermark: u32,
}

/// Factory for protocol sessions
#[async_trait]
pub trait MailAdapter: Send + Sync {
    /// Protocol this adapter implements
    fn protocol(&self) -> ProtocolKind;

    /// Establish an authenticated session.
    ///
    /// Fails with [`crate::error::CoreError::Auth`] on rejected
    /// credentials, `Network`/`Timeout` on transport trouble and
    /// `Protocol` on malformed server behavior.
    async fn connect(&self, account: &Account) -> Result<Box<dyn AdapterSession>>;
}

/// An authenticated session against one remote mailbox
#[async_trait]
pub trait AdapterSession: Send {
    /// Enumerate selectable folders
    async fn list_folders(&mut self) -> Result<Vec<RemoteFolder>>;

    /// Fetch messages newer than `watermark`, ascending by UID, together
    /// with the new watermark. Re-delivery of already-known UIDs is
    /// permitted; the store dedups on UID.
    async fn fetch_new(&mut self, folder: &str, watermark: u32) -> Result<FetchPage>;

    /// Fetch the raw body of one message
    async fn fetch_body(&mut self, folder: &str, uid: u32) -> Result<Vec<u8>>;

    /// Set or clear one flag on a message (read marker, star)
    async fn set_flags(&mut self, folder: &str, uid: u32, flag: MessageFlag, value: bool)
        -> Result<()>;

    /// Whether the server can push changes (IMAP IDLE). When false the
    /// scheduler degrades to periodic polling.
    fn supports_idle(&self) -> bool;

    /// Tear down the session
    async fn logout(&mut self) -> Result<()>;
}

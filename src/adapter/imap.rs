//! IMAP protocol adapter
//!
//! Implements the capability interface with async-imap over a TLS or
//! plain TCP stream. Incremental sync uses `UID FETCH <watermark+1>:*`;
//! servers return the last existing message even when nothing is newer,
//! so results at or below the watermark are filtered out.

use async_native_tls::TlsStream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::io::{AsyncRead, AsyncWrite};
use futures::TryStreamExt;
use mailparse::MailHeaderMap;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

use crate::adapter::{AdapterSession, FetchPage, MailAdapter, RemoteFolder};
use crate::error::{CoreError, Result};
use crate::types::{Account, MailMessage, MessageFlag, ProtocolKind};

fn imap_flag_name(flag: MessageFlag) -> &'static str {
    match flag {
        MessageFlag::Seen => "\\Seen",
        MessageFlag::Flagged => "\\Flagged",
    }
}

const FETCH_ITEMS: &str = "(UID FLAGS RFC822.SIZE INTERNALDATE BODY.PEEK[HEADER] BODY.PEEK[TEXT])";

/// Maximum snippet length, matching what the UI shows as a preview
const SNIPPET_LEN: usize = 200;

/// TLS or plain IMAP stream
enum ImapStream {
    Tls(TlsStream<Compat<TcpStream>>),
    Plain(Compat<TcpStream>),
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            ImapStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            ImapStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => Pin::new(s).poll_flush(cx),
            ImapStream::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => Pin::new(s).poll_close(cx),
            ImapStream::Plain(s) => Pin::new(s).poll_close(cx),
        }
    }
}

impl std::fmt::Debug for ImapStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImapStream::Tls(_) => write!(f, "ImapStream::Tls"),
            ImapStream::Plain(_) => write!(f, "ImapStream::Plain"),
        }
    }
}

impl Unpin for ImapStream {}

/// IMAP variant of the protocol adapter
pub struct ImapAdapter {
    connect_timeout: Duration,
}

impl ImapAdapter {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for ImapAdapter {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl MailAdapter for ImapAdapter {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Imap
    }

    async fn connect(&self, account: &Account) -> Result<Box<dyn AdapterSession>> {
        debug!("Connecting to IMAP {}:{}", account.host, account.port);

        let tcp = timeout(
            self.connect_timeout,
            TcpStream::connect((account.host.as_str(), account.port)),
        )
        .await
        .map_err(|_| CoreError::Timeout(format!("connect to {}", account.host)))?
        .map_err(|e| CoreError::Network(format!("connect to {}: {}", account.host, e)))?;

        let stream = if account.use_ssl {
            let tls = async_native_tls::TlsConnector::new();
            let tls_stream = timeout(self.connect_timeout, tls.connect(&account.host, tcp.compat()))
                .await
                .map_err(|_| CoreError::Timeout(format!("TLS handshake with {}", account.host)))?
                .map_err(|e| CoreError::Network(format!("TLS handshake failed: {}", e)))?;
            ImapStream::Tls(tls_stream)
        } else {
            ImapStream::Plain(tcp.compat())
        };

        let client = async_imap::Client::new(stream);
        let password = account.password.clone().unwrap_or_default();
        let mut session = client
            .login(account.login_user(), &password)
            .await
            .map_err(|(e, _)| CoreError::Auth(e.to_string()))?;

        let supports_idle = match session.capabilities().await {
            Ok(caps) => caps.has_str("IDLE"),
            Err(_) => false,
        };
        info!(
            "IMAP login successful for {} (idle: {})",
            account.login_user(),
            supports_idle
        );

        Ok(Box::new(ImapSession {
            session,
            supports_idle,
        }))
    }
}

struct ImapSession {
    session: async_imap::Session<ImapStream>,
    supports_idle: bool,
}

#[async_trait]
impl AdapterSession for ImapSession {
    async fn list_folders(&mut self) -> Result<Vec<RemoteFolder>> {
        use async_imap::types::NameAttribute;

        let names: Vec<async_imap::types::Name> = self
            .session
            .list(Some(""), Some("*"))
            .await?
            .try_collect()
            .await?;

        let folders = names
            .iter()
            .filter(|name| {
                !name
                    .attributes()
                    .iter()
                    .any(|attr| matches!(attr, NameAttribute::NoSelect))
            })
            .map(|name| RemoteFolder {
                name: name.name().to_string(),
                remote_id: name.name().to_string(),
            })
            .collect();
        Ok(folders)
    }

    async fn fetch_new(&mut self, folder: &str, watermark: u32) -> Result<FetchPage> {
        let mailbox = self.session.examine(folder).await?;
        if mailbox.exists == 0 {
            return Ok(FetchPage {
                messages: Vec::new(),
                watermark,
            });
        }

        let range = format!("{}:*", watermark.saturating_add(1));
        let fetches: Vec<async_imap::types::Fetch> = self
            .session
            .uid_fetch(&range, FETCH_ITEMS)
            .await?
            .try_collect()
            .await?;

        let mut messages: Vec<MailMessage> = Vec::new();
        for fetch in &fetches {
            let uid = match fetch.uid {
                Some(uid) => uid,
                None => continue,
            };
            // The server echoes the newest message when nothing is above
            // the watermark; skip anything already seen.
            if uid <= watermark {
                continue;
            }
            messages.push(envelope_from_fetch(uid, fetch));
        }
        messages.sort_unstable_by_key(|m| m.uid);

        let new_watermark = messages.last().map(|m| m.uid).unwrap_or(watermark);
        debug!(
            "Fetched {} new messages from {} (watermark {} -> {})",
            messages.len(),
            folder,
            watermark,
            new_watermark
        );

        Ok(FetchPage {
            messages,
            watermark: new_watermark,
        })
    }

    async fn fetch_body(&mut self, folder: &str, uid: u32) -> Result<Vec<u8>> {
        self.session.examine(folder).await?;
        let fetches: Vec<async_imap::types::Fetch> = self
            .session
            .uid_fetch(uid.to_string(), "BODY[]")
            .await?
            .try_collect()
            .await?;

        fetches
            .iter()
            .find_map(|fetch| fetch.body().map(|b| b.to_vec()))
            .ok_or_else(|| CoreError::MessageNotFound(format!("{}/{}", folder, uid)))
    }

    async fn set_flags(
        &mut self,
        folder: &str,
        uid: u32,
        flag: MessageFlag,
        value: bool,
    ) -> Result<()> {
        // STORE needs a writable mailbox; EXAMINE is read-only
        self.session.select(folder).await?;
        let query = format!(
            "{}FLAGS.SILENT ({})",
            if value { "+" } else { "-" },
            imap_flag_name(flag)
        );
        let _updates: Vec<async_imap::types::Fetch> = self
            .session
            .uid_store(uid.to_string(), &query)
            .await?
            .try_collect()
            .await?;
        debug!("Stored {} on {}/{}", query, folder, uid);
        Ok(())
    }

    fn supports_idle(&self) -> bool {
        self.supports_idle
    }

    async fn logout(&mut self) -> Result<()> {
        self.session.logout().await?;
        Ok(())
    }
}

/// Build a message record from one FETCH response
fn envelope_from_fetch(uid: u32, fetch: &async_imap::types::Fetch) -> MailMessage {
    use async_imap::types::Flag;

    let (subject, sender, date) = match fetch.header() {
        Some(header) => parse_envelope(header),
        None => (
            "(no subject)".to_string(),
            "unknown sender".to_string(),
            None,
        ),
    };

    let date = date
        .or_else(|| fetch.internal_date().map(|d| d.with_timezone(&Utc)))
        .unwrap_or_else(Utc::now);

    let snippet = fetch
        .header()
        .zip(fetch.text())
        .map(|(header, text)| extract_snippet(header, text))
        .unwrap_or_default();

    let is_unread = !fetch.flags().any(|f| matches!(f, Flag::Seen));
    let is_flagged = fetch.flags().any(|f| matches!(f, Flag::Flagged));

    MailMessage {
        uid,
        subject,
        sender,
        date,
        snippet,
        is_unread,
        is_flagged,
        size: fetch.size,
    }
}

/// Decode subject, sender and date from raw header bytes. RFC 2047
/// encoded words are decoded by mailparse.
fn parse_envelope(header: &[u8]) -> (String, String, Option<DateTime<Utc>>) {
    let headers = match mailparse::parse_headers(header) {
        Ok((headers, _)) => headers,
        Err(_) => return ("(no subject)".into(), "unknown sender".into(), None),
    };

    let subject = headers
        .get_first_value("Subject")
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "(no subject)".to_string());
    let sender = headers
        .get_first_value("From")
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown sender".to_string());
    let date = headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));

    (subject, sender, date)
}

/// Short plain-text preview: the first text part of the body,
/// whitespace-flattened and truncated.
fn extract_snippet(header: &[u8], text: &[u8]) -> String {
    let raw = [header, text].concat();
    let body = match mailparse::parse_mail(&raw) {
        Ok(parsed) => find_text_part(&parsed).unwrap_or_default(),
        Err(_) => String::from_utf8_lossy(text).into_owned(),
    };

    let flattened = body.split_whitespace().collect::<Vec<_>>().join(" ");
    flattened.chars().take(SNIPPET_LEN).collect()
}

fn find_text_part(part: &mailparse::ParsedMail) -> Option<String> {
    if part.ctype.mimetype.starts_with("text/plain") || part.subparts.is_empty() {
        return part.get_body().ok();
    }
    part.subparts.iter().find_map(find_text_part)
}

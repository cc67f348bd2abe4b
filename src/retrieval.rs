//! Retrieval client (spec §4.5): per-call IMAP connections and BFS thread
//! search. `async-imap` is natively non-blocking, so no worker-thread
//! indirection is needed; each call opens and tears down its own session,
//! matching the "no pooling, IMAP selects complicate reuse" resource model
//! (spec §5).

use async_imap::types::Fetch;
use async_native_tls::TlsStream;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::StreamExt;
use std::collections::{HashSet, VecDeque};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::error::AppError;

const DEFAULT_FOLDER: &str = "INBOX";
const SUMMARY_FETCH_ITEMS: &str =
    "(FLAGS RFC822.SIZE BODY.PEEK[HEADER.FIELDS (FROM TO SUBJECT DATE MESSAGE-ID)])";

enum Stream {
    Tls(TlsStream<Compat<TcpStream>>),
    Plain(Compat<TcpStream>),
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut [u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tls(s) => Pin::new(s).poll_flush(cx),
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_close(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tls(s) => Pin::new(s).poll_close(cx),
            Stream::Plain(s) => Pin::new(s).poll_close(cx),
        }
    }
}

unsafe impl Send for Stream {}
impl Unpin for Stream {}

#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub uid: u32,
    pub message_id: Option<String>,
    pub from_addr: String,
    pub to_addr: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub date: Option<String>,
}

impl InboundMessage {
    /// The journal key used by the agent's dedup check (spec §4.4 step 7).
    pub fn dedup_key(&self) -> String {
        self.message_id.clone().unwrap_or_else(|| format!("uid:{}", self.uid))
    }
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn list_folders(&self) -> Result<Vec<String>, AppError>;
    async fn search(&self, query: &str, offset: usize, limit: usize) -> Result<Vec<InboundMessage>, AppError>;
    async fn fetch_unread(&self) -> Result<Vec<InboundMessage>, AppError>;
    async fn fetch_uid(&self, uid: u32) -> Result<InboundMessage, AppError>;
    async fn mark_seen(&self, uid: u32) -> Result<(), AppError>;
    async fn thread(&self, message_id: &str) -> Result<Vec<InboundMessage>, AppError>;
}

pub struct ImapRetrievalClient {
    host: String,
    port: u16,
    username: String,
    password: String,
}

impl ImapRetrievalClient {
    pub fn new(host: String, port: u16, username: String, password: String) -> Self {
        Self { host, port, username, password }
    }

    async fn connect(&self) -> Result<async_imap::Session<Stream>, AppError> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| AppError::Connection(format!("IMAP connect failed: {e}")))?;

        let stream = if self.port == 993 || self.port == 3993 {
            Stream::Tls(
                async_native_tls::TlsConnector::new()
                    .connect(&self.host, tcp.compat())
                    .await
                    .map_err(|e| AppError::Connection(format!("IMAP TLS handshake failed: {e}")))?,
            )
        } else {
            Stream::Plain(tcp.compat())
        };

        let client = async_imap::Client::new(stream);
        let session = client
            .login(&self.username, &self.password)
            .await
            .map_err(|(e, _)| AppError::Auth(format!("IMAP login failed: {e}")))?;
        Ok(session)
    }

    async fn parse_summary(fetch: &Fetch) -> InboundMessage {
        let headers = fetch
            .header()
            .map(|h| String::from_utf8_lossy(h).to_string())
            .unwrap_or_default();
        let mut msg = parse_headers(&headers);
        msg.uid = fetch.uid.unwrap_or(0);
        msg
    }
}

#[async_trait]
impl Retriever for ImapRetrievalClient {
    async fn list_folders(&self) -> Result<Vec<String>, AppError> {
        let mut session = self.connect().await?;
        let names = session
            .list(None, Some("*"))
            .await
            .map_err(|e| AppError::Imap(format!("LIST failed: {e}")))?;
        let mut folders = Vec::new();
        tokio::pin!(names);
        while let Some(item) = names.next().await {
            let item = item.map_err(|e| AppError::Imap(format!("LIST item failed: {e}")))?;
            folders.push(item.name().to_string());
        }
        let _ = session.logout().await;
        Ok(folders)
    }

    async fn search(&self, query: &str, offset: usize, limit: usize) -> Result<Vec<InboundMessage>, AppError> {
        let mut session = self.connect().await?;
        session
            .examine(DEFAULT_FOLDER)
            .await
            .map_err(|e| AppError::Imap(format!("SELECT failed: {e}")))?;

        let effective_query = if query.trim().is_empty() { "ALL" } else { query };
        let mut uids: Vec<u32> = session
            .uid_search(effective_query)
            .await
            .map_err(|e| AppError::Imap(format!("UID SEARCH failed: {e}")))?
            .into_iter()
            .collect();
        uids.sort_unstable_by(|a, b| b.cmp(a)); // newest first

        let page: Vec<u32> = uids.into_iter().skip(offset).take(limit).collect();
        let mut results = Vec::with_capacity(page.len());
        for uid in page {
            if let Ok(msg) = fetch_summary(&mut session, uid).await {
                results.push(msg);
            }
        }
        let _ = session.logout().await;
        Ok(results)
    }

    async fn fetch_unread(&self) -> Result<Vec<InboundMessage>, AppError> {
        let mut session = self.connect().await?;
        session
            .select(DEFAULT_FOLDER)
            .await
            .map_err(|e| AppError::Imap(format!("SELECT failed: {e}")))?;

        let uids = session
            .uid_search("UNSEEN")
            .await
            .map_err(|e| AppError::Imap(format!("UID SEARCH UNSEEN failed: {e}")))?;

        let mut results = Vec::with_capacity(uids.len());
        for uid in uids {
            if let Ok(msg) = fetch_full(&mut session, uid).await {
                results.push(msg);
            }
        }
        let _ = session.logout().await;
        Ok(results)
    }

    async fn fetch_uid(&self, uid: u32) -> Result<InboundMessage, AppError> {
        let mut session = self.connect().await?;
        session
            .examine(DEFAULT_FOLDER)
            .await
            .map_err(|e| AppError::Imap(format!("SELECT failed: {e}")))?;
        let msg = fetch_full(&mut session, uid).await?;
        let _ = session.logout().await;
        Ok(msg)
    }

    async fn mark_seen(&self, uid: u32) -> Result<(), AppError> {
        let mut session = self.connect().await?;
        session
            .select(DEFAULT_FOLDER)
            .await
            .map_err(|e| AppError::Imap(format!("SELECT failed: {e}")))?;

        let store_stream = session
            .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
            .await
            .map_err(|e| AppError::Imap(format!("UID STORE failed: {e}")))?;
        tokio::pin!(store_stream);
        while store_stream.next().await.is_some() {}
        drop(store_stream);

        let _ = session.logout().await;
        Ok(())
    }

    async fn thread(&self, message_id: &str) -> Result<Vec<InboundMessage>, AppError> {
        let mut session = self.connect().await?;
        session
            .examine(DEFAULT_FOLDER)
            .await
            .map_err(|e| AppError::Imap(format!("SELECT failed: {e}")))?;

        let mut seen_uids: HashSet<u32> = HashSet::new();
        let mut to_search: VecDeque<String> = VecDeque::from([message_id.to_string()]);
        let mut searched: HashSet<String> = HashSet::new();

        while let Some(target_id) = to_search.pop_front() {
            if !searched.insert(target_id.clone()) {
                continue;
            }
            for header in ["References", "In-Reply-To", "Message-ID"] {
                let query = format!("HEADER \"{header}\" \"{target_id}\"");
                if let Ok(uids) = session.uid_search(&query).await {
                    seen_uids.extend(uids);
                }
            }
        }

        let mut messages = Vec::new();
        for uid in &seen_uids {
            if let Ok(msg) = fetch_full(&mut session, *uid).await {
                for reference_id in msg
                    .references
                    .iter()
                    .chain(msg.in_reply_to.iter())
                    .flat_map(|r| parse_message_ids(r))
                {
                    if !searched.contains(&reference_id) {
                        to_search.push_back(reference_id);
                    }
                }
                messages.push(msg);
            }
        }

        let _ = session.logout().await;
        messages.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(messages)
    }
}

async fn fetch_summary(session: &mut async_imap::Session<Stream>, uid: u32) -> Result<InboundMessage, AppError> {
    let stream = session
        .uid_fetch(uid.to_string(), SUMMARY_FETCH_ITEMS)
        .await
        .map_err(|e| AppError::Imap(format!("UID FETCH failed: {e}")))?;
    tokio::pin!(stream);
    let mut msg = InboundMessage::default();
    if let Some(item) = stream.next().await {
        let fetch = item.map_err(|e| AppError::Imap(format!("fetch item failed: {e}")))?;
        msg = ImapRetrievalClient::parse_summary(&fetch).await;
        msg.uid = uid;
    }
    Ok(msg)
}

async fn fetch_full(session: &mut async_imap::Session<Stream>, uid: u32) -> Result<InboundMessage, AppError> {
    let stream = session
        .uid_fetch(uid.to_string(), "RFC822")
        .await
        .map_err(|e| AppError::Imap(format!("UID FETCH failed: {e}")))?;
    tokio::pin!(stream);
    let mut raw: Option<Vec<u8>> = None;
    while let Some(item) = stream.next().await {
        let fetch = item.map_err(|e| AppError::Imap(format!("fetch item failed: {e}")))?;
        if let Some(body) = fetch.body() {
            raw = Some(body.to_vec());
            break;
        }
    }
    drop(stream);

    let raw = raw.ok_or_else(|| AppError::Imap(format!("no body for uid {uid}")))?;
    let mut msg = parse_full_message(&raw);
    msg.uid = uid;
    Ok(msg)
}

fn parse_headers(raw_headers: &str) -> InboundMessage {
    let parsed = mailparse::parse_mail(raw_headers.as_bytes()).unwrap_or_else(|_| {
        mailparse::parse_mail(b"").expect("empty message always parses")
    });
    header_fields(&parsed)
}

fn parse_full_message(raw: &[u8]) -> InboundMessage {
    let Ok(parsed) = mailparse::parse_mail(raw) else {
        return InboundMessage::default();
    };
    let mut msg = header_fields(&parsed);
    let (text, html) = extract_bodies(&parsed);
    msg.text_body = text;
    msg.html_body = html;
    msg
}

fn header_fields(parsed: &mailparse::ParsedMail<'_>) -> InboundMessage {
    let get = |name: &str| -> Option<String> {
        parsed
            .headers
            .iter()
            .find(|h| h.get_key().eq_ignore_ascii_case(name))
            .map(|h| h.get_value())
    };

    InboundMessage {
        uid: 0,
        message_id: get("Message-ID"),
        from_addr: get("From").unwrap_or_default(),
        to_addr: get("To").unwrap_or_default(),
        subject: get("Subject").unwrap_or_default(),
        text_body: String::new(),
        html_body: None,
        in_reply_to: get("In-Reply-To"),
        references: get("References"),
        date: get("Date"),
    }
}

fn extract_bodies(parsed: &mailparse::ParsedMail<'_>) -> (String, Option<String>) {
    let mut text_body = String::new();
    let mut html_body = None;

    if parsed.subparts.is_empty() {
        let body = parsed.get_body().unwrap_or_default();
        let content_type = parsed.ctype.mimetype.to_lowercase();
        if content_type == "text/html" {
            html_body = Some(body);
        } else {
            text_body = body;
        }
        return (text_body, html_body);
    }

    for part in &parsed.subparts {
        let disposition = part
            .headers
            .iter()
            .find(|h| h.get_key().eq_ignore_ascii_case("Content-Disposition"))
            .map(|h| h.get_value())
            .unwrap_or_default();
        if disposition.to_lowercase().contains("attachment") {
            continue;
        }
        let content_type = part.ctype.mimetype.to_lowercase();
        if content_type == "text/plain" {
            if let Ok(body) = part.get_body() {
                text_body = body;
            }
        } else if content_type == "text/html" {
            if let Ok(body) = part.get_body() {
                html_body = Some(body);
            }
        }
    }

    (text_body, html_body)
}

/// Extracts `<id@host>`-shaped tokens out of a References/In-Reply-To header.
fn parse_message_ids(header: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut depth = None;
    let mut current = String::new();
    for ch in header.chars() {
        match ch {
            '<' => {
                depth = Some(());
                current.clear();
            }
            '>' => {
                if depth.take().is_some() {
                    ids.push(format!("<{current}>"));
                }
            }
            c if depth.is_some() => current.push(c),
            _ => {}
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_message_ids_from_references_header() {
        let header = "<a@example.com> <b@example.com>\r\n <c@example.com>";
        let ids = parse_message_ids(header);
        assert_eq!(ids, vec!["<a@example.com>", "<b@example.com>", "<c@example.com>"]);
    }

    #[test]
    fn dedup_key_falls_back_to_uid_when_message_id_absent() {
        let msg = InboundMessage { uid: 42, ..Default::default() };
        assert_eq!(msg.dedup_key(), "uid:42");
    }

    #[test]
    fn dedup_key_prefers_message_id() {
        let msg = InboundMessage {
            uid: 42,
            message_id: Some("<abc@example.com>".to_string()),
            ..Default::default()
        };
        assert_eq!(msg.dedup_key(), "<abc@example.com>");
    }
}

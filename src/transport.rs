//! Hand-rolled SMTP submission transport (spec §6: transport selected by
//! port, implicit TLS for 465, opportunistic STARTTLS otherwise) — a single
//! enum switching on TLS vs plain so the rest of the client is
//! transport-agnostic.

use async_native_tls::TlsStream;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::error::AppError;

const SUBMISSION_TIMEOUT: Duration = Duration::from_secs(30);

enum Stream {
    Tls(TlsStream<Compat<TcpStream>>),
    Plain(Compat<TcpStream>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
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

/// A single authenticated SMTP submission connection. Not `Clone`; owned
/// exclusively by one `PooledConnection` at a time.
pub struct SmtpClient {
    stream: Stream,
    host: String,
}

fn classify_io(context: &str, err: std::io::Error) -> AppError {
    AppError::Connection(format!("{context}: {err}"))
}

impl SmtpClient {
    /// Connects, performs the EHLO/STARTTLS dance, and authenticates.
    /// Port 465 uses implicit TLS; any other port negotiates STARTTLS.
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<Self, AppError> {
        let tcp = timeout(SUBMISSION_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| AppError::Connection(format!("timed out connecting to {host}:{port}")))?
            .map_err(|e| classify_io("tcp connect", e))?;

        let mut stream = if port == 465 {
            Stream::Tls(
                async_native_tls::TlsConnector::new()
                    .connect(host, tcp.compat())
                    .await
                    .map_err(|e| AppError::Connection(format!("TLS handshake failed: {e}")))?,
            )
        } else {
            Stream::Plain(tcp.compat())
        };

        read_response(&mut stream).await?;
        send_line(&mut stream, "EHLO mailkeep").await?;
        read_response(&mut stream).await?;

        if port != 465 {
            send_line(&mut stream, "STARTTLS").await?;
            read_response(&mut stream).await?;
            if let Stream::Plain(compat) = stream {
                let tcp = compat.into_inner();
                stream = Stream::Tls(
                    async_native_tls::TlsConnector::new()
                        .connect(host, tcp.compat())
                        .await
                        .map_err(|e| AppError::Connection(format!("TLS handshake failed: {e}")))?,
                );
                send_line(&mut stream, "EHLO mailkeep").await?;
                read_response(&mut stream).await?;
            }
        }

        let mut client = Self {
            stream,
            host: host.to_string(),
        };
        client.authenticate(username, password).await?;
        Ok(client)
    }

    async fn authenticate(&mut self, username: &str, password: &str) -> Result<(), AppError> {
        let mut payload = Vec::new();
        payload.push(0u8);
        payload.extend_from_slice(username.as_bytes());
        payload.push(0u8);
        payload.extend_from_slice(password.as_bytes());
        let encoded = BASE64_STANDARD.encode(payload);

        send_line(&mut self.stream, &format!("AUTH PLAIN {encoded}")).await?;
        let (code, text) = read_response(&mut self.stream).await?;
        if code != 235 {
            return Err(AppError::Auth(format!(
                "authentication rejected by {}: {text}",
                self.host
            )));
        }
        Ok(())
    }

    /// Sends one no-operation keepalive, used by the pool before reuse.
    pub async fn noop(&mut self) -> Result<(), AppError> {
        send_line(&mut self.stream, "NOOP").await?;
        let (code, text) = read_response(&mut self.stream).await?;
        if code >= 400 {
            return Err(AppError::Connection(format!("NOOP failed: {text}")));
        }
        Ok(())
    }

    /// Transmits an envelope and returns a server-assigned message id when
    /// the final response carries one, else `None` (caller falls back to
    /// the MIME `Message-ID`, per spec §6).
    pub async fn send(
        &mut self,
        from_addr: &str,
        to_addr: &str,
        raw_message: &[u8],
    ) -> Result<Option<String>, AppError> {
        send_line(&mut self.stream, &format!("MAIL FROM:<{from_addr}>")).await?;
        let (code, text) = read_response(&mut self.stream).await?;
        classify_reply(code, &text)?;

        send_line(&mut self.stream, &format!("RCPT TO:<{to_addr}>")).await?;
        let (code, text) = read_response(&mut self.stream).await?;
        if code == 550 || code == 551 || code == 553 {
            return Err(AppError::RecipientRejected(text));
        }
        classify_reply(code, &text)?;

        send_line(&mut self.stream, "DATA").await?;
        let (code, text) = read_response(&mut self.stream).await?;
        classify_reply(code, &text)?;

        let dotted = dot_stuff(raw_message);
        self.stream
            .write_all(&dotted)
            .await
            .map_err(|e| classify_io("writing message body", e))?;
        self.stream
            .write_all(b"\r\n.\r\n")
            .await
            .map_err(|e| classify_io("writing message terminator", e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| classify_io("flushing message body", e))?;

        let (code, text) = read_response(&mut self.stream).await?;
        classify_reply(code, &text)?;

        Ok(extract_server_id(&text))
    }

    pub async fn quit(&mut self) {
        let _ = send_line(&mut self.stream, "QUIT").await;
        let _ = read_response(&mut self.stream).await;
    }
}

fn classify_reply(code: u16, text: &str) -> Result<(), AppError> {
    match code {
        200..=399 => Ok(()),
        535 | 534 | 530 => Err(AppError::Auth(text.to_string())),
        _ => Err(AppError::Connection(format!("SMTP error {code}: {text}"))),
    }
}

/// Best-effort extraction of a queue/message id token some servers echo in
/// their final `250` response (e.g. `250 2.0.0 Ok: queued as ABC123`).
fn extract_server_id(text: &str) -> Option<String> {
    text.rsplit_once("queued as ")
        .map(|(_, id)| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

fn dot_stuff(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut at_line_start = true;
    for &byte in raw {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    out
}

async fn send_line(stream: &mut Stream, line: &str) -> Result<(), AppError> {
    stream
        .write_all(line.as_bytes())
        .await
        .map_err(|e| classify_io("writing command", e))?;
    stream
        .write_all(b"\r\n")
        .await
        .map_err(|e| classify_io("writing command terminator", e))?;
    stream
        .flush()
        .await
        .map_err(|e| classify_io("flushing command", e))
}

async fn read_line(stream: &mut Stream) -> Result<String, AppError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| classify_io("reading response", e))?;
        if n == 0 {
            return Err(AppError::Connection("connection closed by peer".to_string()));
        }
        line.push(byte[0]);
        if line.ends_with(b"\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&line).trim_end().to_string())
}

async fn read_response(stream: &mut Stream) -> Result<(u16, String), AppError> {
    let mut lines = Vec::new();
    loop {
        let line = timeout(SUBMISSION_TIMEOUT, read_line(stream))
            .await
            .map_err(|_| AppError::Connection("timed out waiting for SMTP response".to_string()))??;
        let code: u16 = line.get(0..3).and_then(|s| s.parse().ok()).unwrap_or(0);
        let continuing = line.as_bytes().get(3) == Some(&b'-');
        lines.push(line);
        if !continuing {
            return Ok((code, lines.join("\n")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_stuffs_leading_dots() {
        let raw = b"Subject: hi\r\n.leading dot\r\nnormal\r\n";
        let out = dot_stuff(raw);
        assert_eq!(
            String::from_utf8_lossy(&out),
            "Subject: hi\r\n..leading dot\r\nnormal\r\n"
        );
    }

    #[test]
    fn extracts_queued_server_id() {
        assert_eq!(
            extract_server_id("250 2.0.0 Ok: queued as ABC123"),
            Some("ABC123".to_string())
        );
        assert_eq!(extract_server_id("250 2.0.0 Ok"), None);
    }
}

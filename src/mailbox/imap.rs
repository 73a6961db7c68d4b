//! IMAP mailbox over implicit TLS.
//!
//! Minimal IMAP4rev1 client: LOGIN, SELECT, UID SEARCH, UID FETCH, UID STORE,
//! LOGOUT. Every operation opens its own short session on a blocking thread.
//! Messages are fetched with `BODY.PEEK[]` so listing leaves `\Seen` alone.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use super::{Attachment, Mailbox, Message, MessageBody, sender_matches};
use crate::config::MailboxConfig;
use crate::error::MailboxError;

/// Socket read/write timeout.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest literal accepted from the server (one whole message).
const MAX_LITERAL: usize = 64 * 1024 * 1024;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

// ── Mailbox ─────────────────────────────────────────────────────────

/// IMAP-backed mailbox.
#[derive(Debug, Clone)]
pub struct ImapMailbox {
    config: MailboxConfig,
}

impl ImapMailbox {
    /// Connect and authenticate once to validate the configuration.
    ///
    /// An authentication failure here is the one error that should stop
    /// the process.
    pub async fn connect(config: &MailboxConfig) -> Result<Self, MailboxError> {
        let mailbox = Self {
            config: config.clone(),
        };
        mailbox.with_session(|_| Ok(())).await?;
        info!(
            mailbox = %mailbox.config.address,
            host = %mailbox.config.host,
            folder = %mailbox.config.folder,
            "Mailbox connected"
        );
        Ok(mailbox)
    }

    /// The newest `limit` messages in the folder, read or not, headers only.
    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Message>, MailboxError> {
        self.with_session(move |session| {
            let uids = session.uid_search("ALL")?;
            let start = uids.len().saturating_sub(limit);
            let mut messages = Vec::new();
            for &uid in &uids[start..] {
                let Some(fetched) = session.uid_fetch(uid, "(FLAGS BODY.PEEK[HEADER])")? else {
                    continue;
                };
                if let Some(mut message) = parse_message(uid, &fetched.content) {
                    message.is_read = fetched.seen;
                    messages.push(message);
                }
            }
            Ok(messages)
        })
        .await
    }

    /// Open a session, log in, select the folder, run `op`, log out.
    async fn with_session<T, F>(&self, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession<TlsStream>) -> Result<T, MailboxError> + Send + 'static,
    {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = ImapSession::connect_tls(&config)?;
            session.login(&config.username, config.password.expose_secret(), &config.address)?;
            session.select(&config.folder)?;
            let result = op(&mut session);
            session.logout();
            result
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP task failed: {e}")))?
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn list_unread(&self, senders: &[String]) -> Result<Vec<Message>, MailboxError> {
        let criteria = search_criteria(senders);
        let senders = senders.to_vec();
        let messages = self
            .with_session(move |session| {
                let uids = session.uid_search(&criteria)?;
                debug!(count = uids.len(), criteria = %criteria, "Unread messages found");

                let mut messages = Vec::with_capacity(uids.len());
                for uid in uids {
                    let Some(fetched) = session.uid_fetch(uid, "BODY.PEEK[]")? else {
                        warn!(uid, "Message vanished before fetch");
                        continue;
                    };
                    match parse_message(uid, &fetched.content) {
                        Some(message) if sender_matches(&senders, &message.sender) => {
                            messages.push(message);
                        }
                        Some(message) => {
                            debug!(uid, sender = %message.sender, "Sender not in filter");
                        }
                        None => warn!(uid, "Unparseable message skipped"),
                    }
                }
                Ok(messages)
            })
            .await?;
        Ok(messages)
    }

    async fn mark_read(&self, message: &Message) -> Result<(), MailboxError> {
        let uid = message.uid;
        self.with_session(move |session| session.uid_store_seen(uid))
            .await
            .map_err(|e| match e {
                MailboxError::MarkRead { .. } => e,
                other => MailboxError::MarkRead {
                    uid,
                    reason: other.to_string(),
                },
            })?;
        info!(uid, "Message marked as read");
        Ok(())
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// One line of a server response with any literals it carried.
#[derive(Debug, Default)]
struct ResponseLine {
    /// Line text with literal payloads removed (the `{n}` markers stay).
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Completion status of a tagged command.
#[derive(Debug, PartialEq, Eq)]
enum Status {
    Ok,
    No(String),
    Bad(String),
}

#[derive(Debug)]
struct Response {
    untagged: Vec<ResponseLine>,
    status: Status,
}

/// Result of fetching one message.
#[derive(Debug)]
struct Fetched {
    content: Vec<u8>,
    seen: bool,
}

/// A logged-in (or about to be) IMAP connection.
struct ImapSession<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl ImapSession<TlsStream> {
    fn connect_tls(config: &MailboxConfig) -> Result<Self, MailboxError> {
        let connect_err = |reason: String| MailboxError::Connect {
            host: config.host.clone(),
            port: config.port,
            reason,
        };

        let tcp = TcpStream::connect((config.host.as_str(), config.port))
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        tcp.set_write_timeout(Some(SOCKET_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from(config.host.clone())
            .map_err(|e| connect_err(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_err(e.to_string()))?;

        Self::start(rustls::StreamOwned::new(conn, tcp))
    }
}

impl<S: Read + Write> ImapSession<S> {
    /// Wrap a connected stream and consume the server greeting.
    fn start(stream: S) -> Result<Self, MailboxError> {
        let mut session = Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        };
        let greeting = session.read_line()?;
        let greeting = String::from_utf8_lossy(&greeting);
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(MailboxError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.trim_end()
            )));
        }
        Ok(session)
    }

    fn login(&mut self, username: &str, password: &str, mailbox: &str) -> Result<(), MailboxError> {
        let cmd = format!("LOGIN {} {}", quote(username), quote(password));
        match self.command(&cmd)?.status {
            Status::Ok => Ok(()),
            Status::No(_) => Err(MailboxError::AuthenticationFailed {
                mailbox: mailbox.to_string(),
            }),
            Status::Bad(text) => Err(MailboxError::Protocol(format!("LOGIN rejected: {text}"))),
        }
    }

    fn select(&mut self, folder: &str) -> Result<(), MailboxError> {
        let response = self.command(&format!("SELECT {}", quote(folder)))?;
        expect_ok("SELECT", response.status)
    }

    fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>, MailboxError> {
        let response = self.command(&format!("UID SEARCH {criteria}"))?;
        let untagged = response.untagged;
        expect_ok("SEARCH", response.status)?;

        let mut uids = Vec::new();
        for line in &untagged {
            if let Some(rest) = line.text.strip_prefix("* SEARCH") {
                uids.extend(rest.split_whitespace().filter_map(|n| n.parse::<u32>().ok()));
            }
        }
        Ok(uids)
    }

    fn uid_fetch(&mut self, uid: u32, items: &str) -> Result<Option<Fetched>, MailboxError> {
        let response = self.command(&format!("UID FETCH {uid} {items}"))?;
        let untagged = response.untagged;
        expect_ok("FETCH", response.status)?;

        Ok(untagged
            .into_iter()
            .filter(|line| line.text.starts_with("* ") && line.text.contains("FETCH"))
            .find_map(|mut line| {
                let seen = line.text.contains("\\Seen");
                (!line.literals.is_empty()).then(|| Fetched {
                    content: line.literals.swap_remove(0),
                    seen,
                })
            }))
    }

    fn uid_store_seen(&mut self, uid: u32) -> Result<(), MailboxError> {
        let response = self.command(&format!("UID STORE {uid} +FLAGS.SILENT (\\Seen)"))?;
        match response.status {
            Status::Ok => Ok(()),
            Status::No(text) | Status::Bad(text) => Err(MailboxError::MarkRead { uid, reason: text }),
        }
    }

    /// Best effort; the server may already have closed the connection.
    fn logout(&mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(error = %e, "LOGOUT failed");
        }
    }

    /// Send one tagged command and collect its response.
    fn command(&mut self, cmd: &str) -> Result<Response, MailboxError> {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;

        let inner = self.stream.get_mut();
        inner.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        inner.flush()?;

        let tag_prefix = format!("{tag} ");
        let mut untagged = Vec::new();
        loop {
            let line = self.read_response_line()?;
            if let Some(rest) = line.text.strip_prefix(&tag_prefix) {
                let status = parse_status(rest)?;
                return Ok(Response { untagged, status });
            }
            untagged.push(line);
        }
    }

    /// Read one logical response line, pulling in any `{n}` literals.
    fn read_response_line(&mut self) -> Result<ResponseLine, MailboxError> {
        let mut line = ResponseLine::default();
        loop {
            let raw = self.read_line()?;
            let text = String::from_utf8_lossy(&raw);
            let text = text.trim_end_matches(['\r', '\n']);
            line.text.push_str(text);

            match literal_len(text) {
                Some(len) if len > MAX_LITERAL => {
                    return Err(MailboxError::Protocol(format!(
                        "literal of {len} bytes exceeds {MAX_LITERAL}"
                    )));
                }
                Some(len) => {
                    let mut literal = Vec::new();
                    (&mut self.stream).take(len as u64).read_to_end(&mut literal)?;
                    if literal.len() != len {
                        return Err(MailboxError::Protocol(format!(
                            "literal truncated at {} of {len} bytes",
                            literal.len()
                        )));
                    }
                    line.literals.push(literal);
                }
                None => return Ok(line),
            }
        }
    }

    fn read_line(&mut self) -> Result<Vec<u8>, MailboxError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(MailboxError::Protocol("IMAP connection closed".into()));
        }
        Ok(buf)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn expect_ok(command: &str, status: Status) -> Result<(), MailboxError> {
    match status {
        Status::Ok => Ok(()),
        Status::No(text) | Status::Bad(text) => {
            Err(MailboxError::Protocol(format!("{command} failed: {text}")))
        }
    }
}

fn parse_status(rest: &str) -> Result<Status, MailboxError> {
    let (word, text) = rest.split_once(' ').unwrap_or((rest, ""));
    match word.to_ascii_uppercase().as_str() {
        "OK" => Ok(Status::Ok),
        "NO" => Ok(Status::No(text.to_string())),
        "BAD" => Ok(Status::Bad(text.to_string())),
        _ => Err(MailboxError::Protocol(format!("malformed status: {rest}"))),
    }
}

/// Length of a trailing `{n}` literal marker, if any.
fn literal_len(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// `UID SEARCH` criteria for unread messages from any of `senders`.
///
/// IMAP `FROM` is a substring match, so results are re-checked with
/// `sender_matches` after parsing.
fn search_criteria(senders: &[String]) -> String {
    match senders {
        [] => "UNSEEN".to_string(),
        [only] => format!("UNSEEN FROM {}", quote(only)),
        many => {
            let ors = "OR ".repeat(many.len() - 1);
            let keys: Vec<String> = many.iter().map(|s| format!("FROM {}", quote(s))).collect();
            format!("UNSEEN {ors}{}", keys.join(" "))
        }
    }
}

/// Parse a raw RFC 5322 message into a `Message`.
fn parse_message(uid: u32, raw: &[u8]) -> Option<Message> {
    let parsed = MessageParser::default().parse(raw)?;

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());
    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let attachments = parsed
        .attachments()
        .enumerate()
        .map(|(i, part)| Attachment {
            name: part
                .attachment_name()
                .map(|n| n.to_string())
                .unwrap_or_else(|| format!("attachment-{}", i + 1)),
            content: part.contents().to_vec(),
        })
        .collect();

    Some(Message {
        uid,
        sender,
        subject,
        received_at,
        body: extract_body(&parsed),
        is_read: false,
        attachments,
    })
}

fn extract_body(parsed: &mail_parser::Message) -> MessageBody {
    if let Some(part) = parsed.text_part(0)
        && let PartType::Text(text) = &part.body
    {
        return MessageBody::Text(text.to_string());
    }
    if let Some(part) = parsed.html_part(0)
        && let PartType::Html(html) = &part.body
    {
        return MessageBody::Html(html.to_string());
    }
    MessageBody::Text(String::new())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Canned server output; records what the client wrote.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Scripted {
        fn new(server: &[u8]) -> Self {
            Self {
                input: Cursor::new(server.to_vec()),
                output: Vec::new(),
            }
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sent(session: &ImapSession<Scripted>) -> String {
        String::from_utf8(session.stream.get_ref().output.clone()).unwrap()
    }

    const RAW_MESSAGE: &str = "From: Anya <anya@press.ru>\r\n\
To: photos@test.com\r\n\
Subject: =?UTF-8?B?0KTQvtGC0L4=?=\r\n\
Date: Tue, 1 Oct 2024 10:00:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>Hello,</p><p>caption</p>\r\n\
--b1\r\n\
Content-Type: image/png\r\n\
Content-Disposition: attachment; filename=\"photo.png\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
iVBORw0KGgo=\r\n\
--b1--\r\n";

    #[test]
    fn greeting_must_be_ok() {
        assert!(ImapSession::start(Scripted::new(b"* OK ready\r\n")).is_ok());
        assert!(ImapSession::start(Scripted::new(b"* PREAUTH hi\r\n")).is_ok());
        assert!(matches!(
            ImapSession::start(Scripted::new(b"* BYE go away\r\n")),
            Err(MailboxError::Protocol(_))
        ));
        assert!(ImapSession::start(Scripted::new(b"")).is_err());
    }

    #[test]
    fn login_no_is_authentication_failure() {
        let mut session = ImapSession::start(Scripted::new(
            b"* OK ready\r\nA0001 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n",
        ))
        .unwrap();
        let err = session.login("user", "p\"w", "photos@test.com").unwrap_err();
        assert!(matches!(err, MailboxError::AuthenticationFailed { ref mailbox } if mailbox == "photos@test.com"));
        assert_eq!(sent(&session), "A0001 LOGIN \"user\" \"p\\\"w\"\r\n");
    }

    #[test]
    fn search_collects_uids() {
        let mut session = ImapSession::start(Scripted::new(
            b"* OK ready\r\n* SEARCH 3 5 8\r\n* SEARCH 13\r\nA0001 OK SEARCH completed\r\n",
        ))
        .unwrap();
        assert_eq!(session.uid_search("UNSEEN").unwrap(), vec![3, 5, 8, 13]);
        assert_eq!(sent(&session), "A0001 UID SEARCH UNSEEN\r\n");
    }

    #[test]
    fn empty_search_result() {
        let mut session =
            ImapSession::start(Scripted::new(b"* OK ready\r\n* SEARCH\r\nA0001 OK done\r\n"))
                .unwrap();
        assert!(session.uid_search("UNSEEN").unwrap().is_empty());
    }

    #[test]
    fn fetch_reads_literal_exactly() {
        let body = "line one\r\n{5}\r\nA0001 not a tag\r\n";
        let server = format!(
            "* OK ready\r\n* 1 FETCH (UID 42 FLAGS (\\Seen) BODY[] {{{}}}\r\n{})\r\nA0001 OK FETCH done\r\n",
            body.len(),
            body
        );
        let mut session = ImapSession::start(Scripted::new(server.as_bytes())).unwrap();

        let fetched = session.uid_fetch(42, "BODY.PEEK[]").unwrap().unwrap();

        assert_eq!(fetched.content, body.as_bytes());
        assert!(fetched.seen);
        assert_eq!(sent(&session), "A0001 UID FETCH 42 BODY.PEEK[]\r\n");
    }

    #[test]
    fn oversized_literal_is_refused_before_reading() {
        let server = format!(
            "* OK ready\r\n* 1 FETCH (BODY[] {{{}}}\r\nshort)\r\nA0001 OK done\r\n",
            MAX_LITERAL + 1
        );
        let mut session = ImapSession::start(Scripted::new(server.as_bytes())).unwrap();
        assert!(matches!(
            session.uid_fetch(1, "BODY.PEEK[]"),
            Err(MailboxError::Protocol(ref m)) if m.contains("exceeds")
        ));
    }

    #[test]
    fn truncated_literal_is_a_protocol_error() {
        let mut session = ImapSession::start(Scripted::new(
            b"* OK ready\r\n* 1 FETCH (BODY[] {100}\r\nonly a few bytes",
        ))
        .unwrap();
        assert!(matches!(
            session.uid_fetch(1, "BODY.PEEK[]"),
            Err(MailboxError::Protocol(ref m)) if m.contains("truncated")
        ));
    }

    #[test]
    fn fetch_of_missing_message_is_none() {
        let mut session =
            ImapSession::start(Scripted::new(b"* OK ready\r\nA0001 OK FETCH done\r\n")).unwrap();
        assert!(session.uid_fetch(9, "BODY.PEEK[]").unwrap().is_none());
    }

    #[test]
    fn store_failure_is_mark_read_error() {
        let mut session = ImapSession::start(Scripted::new(
            b"* OK ready\r\nA0001 NO read-only mailbox\r\n",
        ))
        .unwrap();
        let err = session.uid_store_seen(4).unwrap_err();
        assert!(matches!(err, MailboxError::MarkRead { uid: 4, .. }));
        assert_eq!(sent(&session), "A0001 UID STORE 4 +FLAGS.SILENT (\\Seen)\r\n");
    }

    #[test]
    fn select_bad_is_protocol_error() {
        let mut session = ImapSession::start(Scripted::new(
            b"* OK ready\r\nA0001 NO no such mailbox\r\n",
        ))
        .unwrap();
        assert!(matches!(
            session.select("Архив"),
            Err(MailboxError::Protocol(_))
        ));
    }

    #[test]
    fn tags_increment_per_command() {
        let mut session = ImapSession::start(Scripted::new(
            b"* OK ready\r\nA0001 OK\r\n* SEARCH\r\nA0002 OK\r\n",
        ))
        .unwrap();
        session.select("INBOX").unwrap();
        session.uid_search("ALL").unwrap();
        assert_eq!(
            sent(&session),
            "A0001 SELECT \"INBOX\"\r\nA0002 UID SEARCH ALL\r\n"
        );
    }

    #[test]
    fn literal_marker_detection() {
        assert_eq!(literal_len("* 1 FETCH (BODY[] {123}"), Some(123));
        assert_eq!(literal_len("{0}"), Some(0));
        assert_eq!(literal_len("* OK done"), None);
        assert_eq!(literal_len("* OK {abc}"), None);
    }

    #[test]
    fn criteria_without_filter() {
        assert_eq!(search_criteria(&[]), "UNSEEN");
    }

    #[test]
    fn criteria_with_one_sender() {
        assert_eq!(
            search_criteria(&["a@x.com".to_string()]),
            "UNSEEN FROM \"a@x.com\""
        );
    }

    #[test]
    fn criteria_with_many_senders() {
        let senders = vec!["a@x.com".to_string(), "b@y.com".to_string(), "c@z.com".to_string()];
        assert_eq!(
            search_criteria(&senders),
            "UNSEEN OR OR FROM \"a@x.com\" FROM \"b@y.com\" FROM \"c@z.com\""
        );
    }

    #[test]
    fn parse_message_extracts_fields() {
        let msg = parse_message(42, RAW_MESSAGE.as_bytes()).unwrap();
        assert_eq!(msg.uid, 42);
        assert_eq!(msg.sender, "anya@press.ru");
        assert_eq!(msg.subject, "Фото");
        assert_eq!(msg.received_at.to_rfc3339(), "2024-10-01T10:00:00+00:00");
        assert!(!msg.is_read);
        assert_eq!(msg.body, MessageBody::Html("<p>Hello,</p><p>caption</p>".into()));
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].name, "photo.png");
        assert_eq!(&msg.attachments[0].content[..4], b"\x89PNG");
    }

    #[test]
    fn parse_plain_text_message() {
        let raw = "From: b@x.com\r\nSubject: hi\r\n\r\nДобрый день,\r\nтекст\r\n";
        let msg = parse_message(1, raw.as_bytes()).unwrap();
        assert!(matches!(msg.body, MessageBody::Text(ref t) if t.contains("текст")));
        assert!(msg.attachments.is_empty());
    }
}

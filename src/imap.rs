//! IMAP Module
//!
//! A [`MessageSource`] backed by a live IMAP mailbox. The session opens with
//! implicit TLS, logs in, selects one mailbox and then answers `SEARCH` and
//! `FETCH (RFC822)` commands. Responses are read line by line; a line ending in
//! `{n}` announces an n-byte literal that follows it verbatim.
//!
//! Any I/O failure or refused login/select is a [`DmarcError::Connection`] and
//! ends the run. A server refusing a single search or fetch is only a
//! [`DmarcError::Message`].
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};

use crate::error::{DmarcError, Result};
use crate::mailbox::{MessageId, MessageSource, RawMessage, SearchCriterion};

/// Maximum response line length.
const MAX_LINE_LENGTH: u64 = 1024 * 1024;

/// Maximum literal size (one whole message).
const MAX_LITERAL_SIZE: usize = 100 * 1024 * 1024;

/// Default implicit-TLS IMAP port.
pub const IMAPS_PORT: u16 = 993;

/// TLS stream used by [`ImapSource::connect`].
pub type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// Where and as whom to log in.
#[derive(Debug, Clone)]
pub struct ImapSettings {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub mailbox: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

/// One response: its text (literals elided) and the literals in order.
#[derive(Debug, Default)]
struct Response {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Untagged responses of one command plus its tagged completion.
#[derive(Debug)]
struct Reply {
    untagged: Vec<Response>,
    status: Status,
    text: String,
}

/// An authenticated IMAP session with a selected mailbox.
pub struct ImapSource<S: Read + Write> {
    reader: BufReader<S>,
    next_tag: u32,
}

impl ImapSource<TlsStream> {
    /// Connects over TLS, logs in and selects `settings.mailbox`.
    pub fn connect(settings: &ImapSettings) -> Result<Self> {
        log::info!("Connecting to {}:{}...", settings.server, settings.port);
        let tcp = TcpStream::connect((settings.server.as_str(), settings.port))
            .map_err(|e| DmarcError::Connection(format!("{}: {}", settings.server, e)))?;
        tcp.set_read_timeout(Some(settings.timeout))?;
        tcp.set_write_timeout(Some(settings.timeout))?;

        let server_name = ServerName::try_from(settings.server.clone())
            .map_err(|e| DmarcError::Connection(format!("{}: {}", settings.server, e)))?;
        let connection = ClientConnection::new(tls_config(), server_name)
            .map_err(|e| DmarcError::Connection(format!("TLS setup failed: {}", e)))?;

        let mut source = ImapSource::from_stream(StreamOwned::new(connection, tcp))?;
        source.login(&settings.username, &settings.password)?;
        log::info!("Connected as {}", settings.username);
        source.select(&settings.mailbox)?;
        Ok(source)
    }
}

fn tls_config() -> Arc<ClientConfig> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

impl<S: Read + Write> ImapSource<S> {
    /// Wraps a connected stream and consumes the server greeting.
    pub fn from_stream(stream: S) -> Result<Self> {
        let mut source = ImapSource {
            reader: BufReader::new(stream),
            next_tag: 0,
        };
        let greeting = source.read_response()?;
        if greeting.text.starts_with("* OK") || greeting.text.starts_with("* PREAUTH") {
            Ok(source)
        } else {
            Err(DmarcError::Connection(format!(
                "unexpected greeting: {}",
                greeting.text
            )))
        }
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let reply = self.command(&format!("LOGIN {} {}", quote(username), quote(password)))?;
        match reply.status {
            Status::Ok => Ok(()),
            _ => Err(DmarcError::Connection(format!("login failed: {}", reply.text))),
        }
    }

    /// Selects a mailbox and returns its message count.
    pub fn select(&mut self, mailbox: &str) -> Result<u32> {
        let reply = self.command(&format!("SELECT {}", quote(mailbox)))?;
        if reply.status != Status::Ok {
            return Err(DmarcError::Connection(format!(
                "cannot select {}: {}",
                mailbox, reply.text
            )));
        }
        let exists = reply
            .untagged
            .iter()
            .find_map(|r| {
                r.text
                    .strip_prefix("* ")
                    .and_then(|rest| rest.strip_suffix(" EXISTS"))
                    .and_then(|n| n.parse().ok())
            })
            .unwrap_or(0);
        log::debug!("Selected {} ({} messages)", mailbox, exists);
        Ok(exists)
    }

    /// Ends the session. Errors are of no consequence at this point.
    pub fn logout(&mut self) {
        if let Err(e) = self.command("LOGOUT") {
            log::debug!("Logout failed: {}", e);
        }
    }

    fn command(&mut self, command: &str) -> Result<Reply> {
        self.next_tag += 1;
        let tag = format!("A{:04}", self.next_tag);
        let verb = command.split(' ').next().unwrap_or_default();
        log::trace!("{} {}", tag, verb);

        let stream = self.reader.get_mut();
        stream
            .write_all(format!("{} {}\r\n", tag, command).as_bytes())
            .and_then(|_| stream.flush())
            .map_err(lost)?;

        let mut untagged = Vec::new();
        loop {
            let response = self.read_response()?;
            if let Some(rest) = response.text.strip_prefix(&tag) {
                let rest = rest.trim_start();
                let (word, text) = rest.split_once(' ').unwrap_or((rest, ""));
                let status = match word.to_ascii_uppercase().as_str() {
                    "OK" => Status::Ok,
                    "NO" => Status::No,
                    "BAD" => Status::Bad,
                    _ => {
                        return Err(DmarcError::Connection(format!(
                            "unexpected completion: {}",
                            response.text
                        )))
                    }
                };
                return Ok(Reply {
                    untagged,
                    status,
                    text: text.to_string(),
                });
            }
            if response.text.starts_with("* BYE") && verb != "LOGOUT" {
                return Err(DmarcError::Connection(format!(
                    "server closed the session: {}",
                    response.text
                )));
            }
            untagged.push(response);
        }
    }

    fn read_response(&mut self) -> Result<Response> {
        let mut response = Response::default();
        loop {
            let line = self.read_line()?;
            response.text.push_str(&line);
            let Some(len) = literal_length(&line) else {
                return Ok(response);
            };
            if len > MAX_LITERAL_SIZE {
                return Err(DmarcError::Connection(format!(
                    "literal too large: {} bytes",
                    len
                )));
            }
            let mut literal = vec![0u8; len];
            self.reader.read_exact(&mut literal).map_err(lost)?;
            response.literals.push(literal);
        }
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        let read = (&mut self.reader)
            .take(MAX_LINE_LENGTH)
            .read_until(b'\n', &mut line)
            .map_err(lost)?;
        if read == 0 {
            return Err(DmarcError::Connection("connection closed by server".into()));
        }
        if !line.ends_with(b"\n") {
            return Err(DmarcError::Connection("response line too long".into()));
        }
        let text = String::from_utf8_lossy(&line);
        Ok(text.trim_end_matches(['\r', '\n']).to_string())
    }
}

impl<S: Read + Write> MessageSource for ImapSource<S> {
    fn search(&mut self, criterion: &SearchCriterion) -> Result<Vec<MessageId>> {
        let reply = self.command(&format!("SEARCH {}", criterion))?;
        if reply.status != Status::Ok {
            return Err(DmarcError::Message(format!(
                "search refused: {}",
                reply.text
            )));
        }
        Ok(reply
            .untagged
            .iter()
            .filter_map(|r| r.text.strip_prefix("* SEARCH"))
            .flat_map(|ids| ids.split_whitespace())
            .filter_map(|n| n.parse().ok())
            .map(MessageId)
            .collect())
    }

    fn fetch(&mut self, id: MessageId) -> Result<RawMessage> {
        let reply = self.command(&format!("FETCH {} (RFC822)", id))?;
        if reply.status != Status::Ok {
            return Err(DmarcError::Message(format!(
                "fetch of {} refused: {}",
                id, reply.text
            )));
        }
        let prefix = format!("* {} FETCH", id);
        let body = reply
            .untagged
            .into_iter()
            .filter(|r| r.text.starts_with(&prefix))
            .find_map(|r| r.literals.into_iter().next())
            .ok_or_else(|| DmarcError::Message(format!("message {} has no body", id)))?;
        RawMessage::parse(&body)
    }
}

fn lost(e: std::io::Error) -> DmarcError {
    DmarcError::Connection(format!("connection lost: {}", e))
}

/// Length announced by a trailing `{n}` or `{n+}`.
fn literal_length(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

/// IMAP quoted string.
pub(crate) fn quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    /// Replays canned server output and records what the client sent.
    struct Script {
        server: Cursor<Vec<u8>>,
        sent: Rc<RefCell<Vec<u8>>>,
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.server.read(buf)
        }
    }

    impl Write for Script {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.sent.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn session(server: &str) -> (Result<ImapSource<Script>>, Rc<RefCell<Vec<u8>>>) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let script = Script {
            server: Cursor::new(server.as_bytes().to_vec()),
            sent: sent.clone(),
        };
        (ImapSource::from_stream(script), sent)
    }

    fn sent_text(sent: &Rc<RefCell<Vec<u8>>>) -> String {
        String::from_utf8(sent.borrow().clone()).unwrap()
    }

    const MESSAGE: &str = "From: dmarc@yahoo.com\r\n\
Subject: Report Domain: example.com\r\n\
\r\n\
body\r\n";

    #[test]
    fn test_login_select_search_fetch() {
        let server = format!(
            "* OK IMAP4rev1 ready\r\n\
             A0001 OK LOGIN completed\r\n\
             * 12 EXISTS\r\n\
             * FLAGS (\\Seen)\r\n\
             A0002 OK [READ-WRITE] SELECT completed\r\n\
             * SEARCH 3 7 12\r\n\
             A0003 OK SEARCH completed\r\n\
             * 7 FETCH (RFC822 {{{}}}\r\n{})\r\n\
             A0004 OK FETCH completed\r\n",
            MESSAGE.len(),
            MESSAGE
        );
        let (source, sent) = session(&server);
        let mut source = source.unwrap();
        source.login("me@example.com", "pa\"ss").unwrap();
        assert_eq!(source.select("INBOX").unwrap(), 12);

        let ids = source
            .search(&SearchCriterion::Subject("Report Domain:".into()))
            .unwrap();
        assert_eq!(ids, vec![MessageId(3), MessageId(7), MessageId(12)]);

        let message = source.fetch(MessageId(7)).unwrap();
        assert_eq!(message.subject, "Report Domain: example.com");
        assert_eq!(message.from, "dmarc@yahoo.com");

        assert_eq!(
            sent_text(&sent),
            "A0001 LOGIN \"me@example.com\" \"pa\\\"ss\"\r\n\
             A0002 SELECT \"INBOX\"\r\n\
             A0003 SEARCH SUBJECT \"Report Domain:\"\r\n\
             A0004 FETCH 7 (RFC822)\r\n"
        );
    }

    #[test]
    fn test_rejected_login_is_a_connection_error() {
        let (source, _) = session(
            "* OK ready\r\n\
             A0001 NO [AUTHENTICATIONFAILED] Invalid credentials\r\n",
        );
        let result = source.unwrap().login("me@example.com", "wrong");
        assert!(matches!(result, Err(DmarcError::Connection(msg)) if msg.contains("Invalid credentials")));
    }

    #[test]
    fn test_bye_greeting_is_a_connection_error() {
        let (source, _) = session("* BYE too many connections\r\n");
        assert!(matches!(source, Err(DmarcError::Connection(_))));
    }

    #[test]
    fn test_refused_search_is_not_fatal() {
        let (source, _) = session(
            "* OK ready\r\n\
             A0001 BAD Could not parse command\r\n",
        );
        let result = source
            .unwrap()
            .search(&SearchCriterion::From("dmarc".into()));
        assert!(matches!(result, Err(DmarcError::Message(_))));
    }

    #[test]
    fn test_dropped_connection_mid_fetch_is_fatal() {
        let (source, _) = session(
            "* OK ready\r\n\
             * 2 FETCH (RFC822 {500}\r\nFrom: trunc",
        );
        let result = source.unwrap().fetch(MessageId(2));
        assert!(matches!(result, Err(DmarcError::Connection(_))));
    }

    #[test]
    fn test_fetch_without_body() {
        let (source, _) = session(
            "* OK ready\r\n\
             * 2 FETCH (FLAGS (\\Seen))\r\n\
             A0001 OK FETCH completed\r\n",
        );
        let result = source.unwrap().fetch(MessageId(2));
        assert!(matches!(result, Err(DmarcError::Message(_))));
    }

    #[test]
    fn test_literal_length() {
        assert_eq!(literal_length("* 1 FETCH (RFC822 {42}"), Some(42));
        assert_eq!(literal_length("A0001 LOGIN {5+}"), Some(5));
        assert_eq!(literal_length("* OK ready"), None);
        assert_eq!(literal_length("* OK {oops}"), None);
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("INBOX"), "\"INBOX\"");
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
    }
}

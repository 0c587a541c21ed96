//! Mailbox Module
//!
//! The message-source capability the analysis consumes, the decoding of raw
//! RFC 5322 messages into subject, sender and attachments, and a source backed
//! by a directory of `.eml` files. The live IMAP source is in [`crate::imap`].
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use mail_parser::{Message, MessageParser, MimeHeaders};

use crate::error::{DmarcError, Result};
use crate::imap::quote;

/// Sequence number of a message inside its source. Higher is newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Case-insensitive substring search on one header, IMAP `SEARCH` style.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCriterion {
    Subject(String),
    From(String),
}

impl SearchCriterion {
    pub fn matches(&self, message: &RawMessage) -> bool {
        let (haystack, needle) = match self {
            SearchCriterion::Subject(s) => (&message.subject, s),
            SearchCriterion::From(s) => (&message.from, s),
        };
        haystack.to_lowercase().contains(&needle.to_lowercase())
    }

    /// Heuristics matching the usual aggregate report conventions.
    pub fn defaults() -> Vec<SearchCriterion> {
        vec![
            SearchCriterion::Subject("Report Domain:".into()),
            SearchCriterion::From("dmarc".into()),
            SearchCriterion::Subject("dmarc".into()),
            SearchCriterion::From("noreply@google.com".into()),
            SearchCriterion::From("yahoo".into()),
            SearchCriterion::From("postmaster".into()),
        ]
    }
}

impl fmt::Display for SearchCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchCriterion::Subject(s) => write!(f, "SUBJECT {}", quote(s)),
            SearchCriterion::From(s) => write!(f, "FROM {}", quote(s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub data: Vec<u8>,
}

/// A fetched message reduced to what the analysis needs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawMessage {
    pub subject: String,
    pub from: String,
    pub attachments: Vec<Attachment>,
}

impl RawMessage {
    /// Decodes an RFC 5322 message, including encoded-word headers and MIME parts.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let message = MessageParser::default()
            .parse(bytes)
            .ok_or_else(|| DmarcError::Message("not an RFC 5322 message".into()))?;

        let mut attachments: Vec<Attachment> = message
            .attachments()
            .filter_map(|part| {
                part.attachment_name().map(|name| Attachment {
                    filename: name.to_string(),
                    data: part.contents().to_vec(),
                })
            })
            .collect();

        // Some reporters send the archive as the whole (single-part) body.
        if attachments.is_empty() {
            let root = message.root_part();
            if let Some(name) = root.attachment_name() {
                attachments.push(Attachment {
                    filename: name.to_string(),
                    data: root.contents().to_vec(),
                });
            }
        }

        Ok(RawMessage {
            subject: message.subject().unwrap_or_default().to_string(),
            from: format_from(&message),
            attachments,
        })
    }
}

fn format_from(message: &Message<'_>) -> String {
    let Some(addr) = message.from().and_then(|a| a.first()) else {
        return String::new();
    };
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) => format!("{} <{}>", name, address),
        (None, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}

/// Search-and-fetch capability over a mailbox.
pub trait MessageSource {
    /// Ids of messages matching `criterion`, in any order.
    fn search(&mut self, criterion: &SearchCriterion) -> Result<Vec<MessageId>>;

    fn fetch(&mut self, id: MessageId) -> Result<RawMessage>;
}

/// A directory of `.eml` files, numbered 1..n in file-name order.
#[derive(Debug)]
pub struct DirectorySource {
    paths: Vec<PathBuf>,
    cache: Vec<Option<RawMessage>>,
}

impl DirectorySource {
    /// Opens the mailbox directory. Failure here is fatal to a run.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir)
            .map_err(|e| DmarcError::Connection(format!("{}: {}", dir.display(), e)))?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| DmarcError::Connection(format!("{}: {}", dir.display(), e)))?
                .path();
            let is_eml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("eml"));
            if path.is_file() && is_eml {
                paths.push(path);
            }
        }
        paths.sort();
        log::debug!("Opened {} with {} messages", dir.display(), paths.len());

        Ok(DirectorySource {
            cache: vec![None; paths.len()],
            paths,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn load(&mut self, id: MessageId) -> Result<&RawMessage> {
        let index = (id.0 as usize)
            .checked_sub(1)
            .filter(|i| *i < self.paths.len())
            .ok_or_else(|| DmarcError::Message(format!("no message with id {}", id)))?;

        if self.cache[index].is_none() {
            let bytes = fs::read(&self.paths[index])?;
            self.cache[index] = Some(RawMessage::parse(&bytes)?);
        }
        self.cache[index]
            .as_ref()
            .ok_or_else(|| DmarcError::Message(format!("message {} unavailable", id)))
    }
}

impl MessageSource for DirectorySource {
    fn search(&mut self, criterion: &SearchCriterion) -> Result<Vec<MessageId>> {
        let mut hits = Vec::new();
        for n in 1..=self.paths.len() as u32 {
            let id = MessageId(n);
            match self.load(id) {
                Ok(message) if criterion.matches(message) => hits.push(id),
                Ok(_) => {}
                Err(e) => log::debug!("Message {} not searchable: {}", id, e),
            }
        }
        Ok(hits)
    }

    fn fetch(&mut self, id: MessageId) -> Result<RawMessage> {
        self.load(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    const REPORT_MAIL: &str = "From: DMARC Aggregate Report <noreply-dmarc-support@google.com>\r\n\
To: postmaster@example.com\r\n\
Subject: =?UTF-8?Q?Report_Domain:_example.com_Submitter:_google.com?=\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain\r\n\
\r\n\
This is an aggregate report.\r\n\
--XYZ\r\n\
Content-Type: application/xml\r\n\
Content-Disposition: attachment; filename=\"google.com!example.com!1!2.xml\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
PGZlZWRiYWNrLz4=\r\n\
--XYZ--\r\n";

    #[test]
    fn test_parse_message_with_attachment() {
        let message = RawMessage::parse(REPORT_MAIL.as_bytes()).unwrap();
        assert_eq!(message.subject, "Report Domain: example.com Submitter: google.com");
        assert_eq!(
            message.from,
            "DMARC Aggregate Report <noreply-dmarc-support@google.com>"
        );
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.attachments[0].filename, "google.com!example.com!1!2.xml");
        assert_eq!(message.attachments[0].data, b"<feedback/>");
    }

    #[test]
    fn test_criterion_matching_and_display() {
        let message = RawMessage {
            subject: "Your DMARC aggregate report".into(),
            from: "reports@yahoo.com".into(),
            attachments: vec![],
        };
        assert!(SearchCriterion::Subject("dmarc".into()).matches(&message));
        assert!(SearchCriterion::From("YAHOO".into()).matches(&message));
        assert!(!SearchCriterion::Subject("Report Domain:".into()).matches(&message));
        assert_eq!(
            SearchCriterion::Subject("Report Domain:".into()).to_string(),
            "SUBJECT \"Report Domain:\""
        );
    }

    #[test]
    fn test_directory_source() {
        let dir = tempdir().unwrap();
        let mut f = fs::File::create(dir.path().join("001.eml")).unwrap();
        f.write_all(REPORT_MAIL.as_bytes()).unwrap();
        let mut f = fs::File::create(dir.path().join("002.eml")).unwrap();
        f.write_all(b"From: friend@example.org\r\nSubject: lunch?\r\n\r\nhi\r\n")
            .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = DirectorySource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 2);
        let hits = source
            .search(&SearchCriterion::Subject("report domain:".into()))
            .unwrap();
        assert_eq!(hits, vec![MessageId(1)]);
        let fetched = source.fetch(MessageId(2)).unwrap();
        assert_eq!(fetched.subject, "lunch?");
        assert!(source.fetch(MessageId(3)).is_err());
    }

    #[test]
    fn test_missing_directory_is_connection_error() {
        let result = DirectorySource::open("/nonexistent/dmarcscan/mailbox");
        assert!(matches!(result, Err(DmarcError::Connection(_))));
    }
}

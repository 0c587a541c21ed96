//! dmarcscan Library
//!
//! This library retrieves DMARC aggregate reports from a mailbox, extracts and
//! decompresses their attachments, parses the report XML, classifies every record
//! against DMARC pass/fail semantics and aggregates the failures for rendering
//! and JSON export.
//!
//! Pipeline: selector -> extractor -> xml_parser -> classifier -> aggregator,
//! followed by the pure renderers in `render` and the `export` document.

pub mod aggregator;
pub mod classifier;
pub mod config;
pub mod error;
pub mod export;
pub mod extractor;
pub mod imap;
pub mod mailbox;
pub mod models;
pub mod render;
pub mod selector;
pub mod webhook;
pub mod xml_parser;

pub use aggregator::{Aggregator, Summary};
pub use config::Config;
pub use export::ExportDocument;
pub use extractor::extract;
pub use imap::{ImapSettings, ImapSource};
pub use mailbox::{DirectorySource, MessageId, MessageSource, RawMessage, SearchCriterion};
pub use selector::{analyze, Analysis};
pub use xml_parser::parse_report;

//! dmarcscan - DMARC aggregate report analyzer
//!
//! Scans an IMAP mailbox (or a directory of `.eml` files) for DMARC aggregate
//! report emails, extracts and parses their attachments, and reports every record that failed DKIM or SPF
//! evaluation. A JSON export of the whole run is always written.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use serde::{Deserialize, Serialize};

use dmarcscan::render::{render_csv, render_table, render_text};
use dmarcscan::selector::DiagnosticKind;
use dmarcscan::webhook::WebhookHandler;
use dmarcscan::imap::IMAPS_PORT;
use dmarcscan::{
    analyze, Analysis, Config, DirectorySource, ExportDocument, ImapSettings, ImapSource,
    SearchCriterion,
};

const WEBHOOK_RETRIES: u32 = 3;

/// CLI arguments for dmarcscan.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "DMARC aggregate report analyzer",
    long_about = "dmarcscan searches a mailbox for DMARC aggregate reports, parses their \
                  XML/GZ/ZIP attachments and lists every DKIM/SPF failure with \
                  recommendations.\n\n\
                  USAGE:\n  dmarcscan --email <ADDR> --password <PASS> [--server <HOST>] [--mailbox <NAME>]\n  \
                  dmarcscan <MAILDIR> [--limit <N>] [--output <FILE>] [--format <text|table|csv>]"
)]
struct Cli {
    /// Directory of .eml messages to scan instead of an IMAP mailbox
    #[arg(value_parser, required_unless_present = "email", conflicts_with = "email")]
    maildir: Option<PathBuf>,

    /// IMAP login (email address)
    #[arg(long)]
    email: Option<String>,

    /// IMAP password or app password
    #[arg(long, env = "DMARC_IMAP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// IMAP server
    #[arg(long, default_value = "imap.gmail.com")]
    server: String,

    /// IMAP port (implicit TLS)
    #[arg(long, default_value_t = IMAPS_PORT)]
    port: u16,

    /// IMAP mailbox to search
    #[arg(long, default_value = "INBOX")]
    mailbox: String,

    /// Maximum number of emails to process (overrides DMARC_MESSAGE_LIMIT)
    #[arg(short, long)]
    limit: Option<usize>,

    /// Output JSON file path
    #[arg(short, long, default_value = "dmarc_failures.json")]
    output: PathBuf,

    /// Console format: text, table, csv
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Disable coloured output
    #[arg(long)]
    no_color: bool,
}

/// Supported console formats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OutputFormat {
    Text,
    Table,
    Csv,
}

impl FromStr for OutputFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "table" => Ok(OutputFormat::Table),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity.
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();
    if cli.no_color {
        colored::control::set_override(false);
    }

    println!(
        "{}\n{}\n",
        "dmarcscan - DMARC Report Parser & Analyzer".bold().cyan(),
        "Email authentication failure detection".dimmed()
    );

    let mut config = Config::new().context("Failed to load configuration")?;
    if let Some(limit) = cli.limit {
        config.message_limit = limit;
    }

    let analysis = run_analysis(&cli, &config)?;

    for diagnostic in analysis.diagnostics_of(DiagnosticKind::RecordSkipped) {
        log::debug!("{}", diagnostic);
    }
    let aggregator = &analysis.aggregator;

    match cli.format {
        OutputFormat::Text => println!("{}", render_text(aggregator)),
        OutputFormat::Table => {
            println!("{}", render_table(aggregator));
            let summary = aggregator.summary();
            println!(
                "{} reports, {} failure records, {} failed messages",
                summary.total_reports,
                summary.total_failure_records,
                summary.total_failed_message_count
            );
        }
        OutputFormat::Csv => print!("{}", render_csv(aggregator)?),
    }

    let document = ExportDocument::new(aggregator, chrono::Utc::now());
    document
        .write_to(&cli.output)
        .with_context(|| format!("Failed to write {}", cli.output.display()))?;
    println!(
        "\n{} {}",
        "Full report exported to:".green(),
        cli.output.display()
    );

    if let Some(url) = &config.webhook_url {
        log::info!("Sending results to webhook: {}", url);
        let handler = WebhookHandler::new(
            url,
            Duration::from_secs(config.webhook_timeout),
            WEBHOOK_RETRIES,
        )?;
        if let Err(e) = handler.send(&document).await {
            log::error!("{:#}", e);
        }
    }

    log::info!("{}", "Analysis complete!".bold().cyan());
    Ok(())
}

/// Analyzes the directory mailbox if one was given, otherwise the IMAP mailbox.
fn run_analysis(cli: &Cli, config: &Config) -> Result<Analysis> {
    let criteria = SearchCriterion::defaults();
    if let Some(dir) = &cli.maildir {
        log::info!("Opening mailbox {}", dir.display());
        let mut source = DirectorySource::open(dir).context("Failed to open mailbox")?;
        return analyze(&mut source, &criteria, config).context("Mailbox connection lost");
    }

    let settings = imap_settings(cli, config)?;
    let mut source = ImapSource::connect(&settings)
        .with_context(|| format!("Failed to connect to {}", settings.server))?;
    let analysis = analyze(&mut source, &criteria, config);
    source.logout();
    analysis.context("Mailbox connection lost")
}

fn imap_settings(cli: &Cli, config: &Config) -> Result<ImapSettings> {
    let username = cli
        .email
        .clone()
        .context("--email is required without a MAILDIR")?;
    let password = cli
        .password
        .clone()
        .context("--password (or DMARC_IMAP_PASSWORD) is required with --email")?;
    Ok(ImapSettings {
        server: cli.server.clone(),
        port: cli.port,
        username,
        password,
        mailbox: cli.mailbox.clone(),
        timeout: Duration::from_secs(config.imap_timeout),
    })
}

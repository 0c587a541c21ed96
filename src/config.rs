//! Configuration Module
//!
//! This module reads configuration values from environment variables, provides
//! sensible defaults, and validates key security parameters such as maximum
//! attachment sizes and decompression limits.

use anyhow::Result;
use std::env;
use std::str::FromStr;

/// Hard ceiling for `DMARC_MAX_FILE_SIZE`.
const MAX_FILE_SIZE_CEILING: usize = 500_000_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub webhook_url: Option<String>,
    pub webhook_timeout: u64,
    pub max_file_size: usize,
    pub max_decompressed_size: usize,
    pub max_files_in_zip: usize,
    pub max_compression_ratio: f64,
    pub max_filename_length: usize,
    pub message_limit: usize,
    /// Socket read/write timeout of the IMAP session, in seconds.
    pub imap_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            webhook_url: None,
            webhook_timeout: 30,
            max_file_size: 10 * 1024 * 1024,
            max_decompressed_size: 100 * 1024 * 1024,
            max_files_in_zip: 1000,
            max_compression_ratio: 1000.0,
            max_filename_length: 256,
            message_limit: 50,
            imap_timeout: 60,
        }
    }
}

impl Config {
    /// Creates a new configuration by reading environment variables.
    /// If a variable is missing, empty or unparseable, a default value is used.
    pub fn new() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let max_file_size: usize = parse_var(&lookup, "DMARC_MAX_FILE_SIZE").unwrap_or(defaults.max_file_size);
        if max_file_size > MAX_FILE_SIZE_CEILING {
            return Err(anyhow::anyhow!("Max file size too large (500MB limit)"));
        }

        // For webhook_timeout, try DMARC_WEBHOOK_TIMEOUT_SECS then DMARC_WEBHOOK_TIMEOUT.
        let webhook_timeout = parse_var(&lookup, "DMARC_WEBHOOK_TIMEOUT_SECS")
            .or_else(|| parse_var(&lookup, "DMARC_WEBHOOK_TIMEOUT"))
            .unwrap_or(defaults.webhook_timeout);

        let webhook_url = lookup("DMARC_WEBHOOK_URL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Config {
            webhook_url,
            webhook_timeout,
            max_file_size,
            max_decompressed_size: parse_var(&lookup, "DMARC_MAX_DECOMPRESSED_SIZE")
                .unwrap_or(defaults.max_decompressed_size),
            max_files_in_zip: parse_var(&lookup, "DMARC_MAX_FILES_IN_ZIP").unwrap_or(defaults.max_files_in_zip),
            max_compression_ratio: parse_var(&lookup, "DMARC_MAX_COMPRESSION_RATIO")
                .unwrap_or(defaults.max_compression_ratio),
            max_filename_length: parse_var(&lookup, "DMARC_MAX_FILENAME_LENGTH")
                .unwrap_or(defaults.max_filename_length),
            message_limit: parse_var(&lookup, "DMARC_MESSAGE_LIMIT").unwrap_or(defaults.message_limit),
            imap_timeout: parse_var(&lookup, "DMARC_IMAP_TIMEOUT_SECS").unwrap_or(defaults.imap_timeout),
        })
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|s| s.trim().parse().ok())
}

use crate::error::{Result, SentinelError};
use crate::types::Commitment;
use solana_sdk::pubkey::Pubkey;
use std::path::Path;
use url::Url;

/// Validate a base58 account or program address
pub fn validate_address(address: &str) -> Result<Pubkey> {
    address.trim().parse::<Pubkey>().map_err(|e| {
        SentinelError::Config(format!("Invalid address '{}': {}", address, e))
    })
}

/// Validate a list of addresses
pub fn validate_addresses(addresses: &[String]) -> Result<Vec<Pubkey>> {
    addresses
        .iter()
        .map(|address| validate_address(address))
        .collect()
}

/// Split a comma-separated address list, dropping blanks
pub fn parse_address_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn validate_url_scheme(kind: &str, url: &str, schemes: &[&str]) -> Result<Url> {
    if url.is_empty() {
        return Err(SentinelError::Config(format!("{} URL cannot be empty", kind)));
    }

    let parsed = Url::parse(url)
        .map_err(|e| SentinelError::Config(format!("Invalid {} URL '{}': {}", kind, url, e)))?;

    if !schemes.contains(&parsed.scheme()) {
        return Err(SentinelError::Config(format!(
            "Invalid {} URL '{}': scheme must be one of {:?}",
            kind, url, schemes
        )));
    }

    Ok(parsed)
}

/// Validate an RPC URL
pub fn validate_rpc_url(url: &str) -> Result<()> {
    validate_url_scheme("RPC", url, &["http", "https"]).map(|_| ())
}

/// Validate a WebSocket URL
pub fn validate_ws_url(url: &str) -> Result<()> {
    validate_url_scheme("WebSocket", url, &["ws", "wss"]).map(|_| ())
}

pub fn validate_redis_url(url: &str) -> Result<()> {
    validate_url_scheme("Redis", url, &["redis", "rediss"]).map(|_| ())
}

/// Validate a database URL
pub fn validate_db_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(SentinelError::Config(
            "Database URL cannot be empty".to_string(),
        ));
    }

    if let Some(path) = url.strip_prefix("sqlite:") {
        if path.contains(":memory:") {
            return Ok(());
        }
        let path = path.trim_start_matches("//");

        // For SQLite, check that the parent directory exists
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(SentinelError::Config(format!(
                    "SQLite database directory does not exist: {}",
                    parent.display()
                )));
            }
        }
        return Ok(());
    }

    // PostgreSQL URLs are validated at connection time
    validate_url_scheme("Database", url, &["postgres", "postgresql"]).map(|_| ())
}

/// Validate commitment level string
pub fn validate_commitment(commitment: &str) -> Result<Commitment> {
    commitment.parse::<Commitment>().map_err(SentinelError::Config)
}

/// Settings checked before the live pipeline starts
pub struct LiveConfig {
    pub ws_url: String,
    pub rpc_url: Option<String>,
    pub redis_url: String,
    pub db_url: Option<String>,
    pub commitment: String,
    pub programs: Vec<String>,
    pub accounts: Vec<String>,
}

impl LiveConfig {
    /// Validate all configuration fields
    pub fn validate(&self) -> Result<()> {
        validate_ws_url(&self.ws_url)?;
        if let Some(rpc_url) = &self.rpc_url {
            validate_rpc_url(rpc_url)?;
        }
        validate_redis_url(&self.redis_url)?;
        if let Some(db_url) = &self.db_url {
            validate_db_url(db_url)?;
        }
        validate_commitment(&self.commitment)?;
        validate_addresses(&self.programs)?;
        validate_addresses(&self.accounts)?;
        Ok(())
    }
}

/// Settings checked before a backfill run
pub struct BackfillConfig {
    pub rpc_url: String,
    pub addresses: Vec<String>,
    pub db_url: String,
    pub limit: usize,
    pub concurrency: usize,
}

impl BackfillConfig {
    /// Validate all configuration fields
    pub fn validate(&self) -> Result<()> {
        validate_rpc_url(&self.rpc_url)?;

        if self.addresses.is_empty() {
            return Err(SentinelError::Config(
                "At least one address must be specified".to_string(),
            ));
        }
        validate_addresses(&self.addresses)?;

        validate_db_url(&self.db_url)?;

        if self.limit == 0 || self.limit > 1000 {
            return Err(SentinelError::Config(
                "Limit must be between 1 and 1000".to_string(),
            ));
        }

        if self.concurrency == 0 {
            return Err(SentinelError::Config(
                "Concurrency must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

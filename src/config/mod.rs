use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::smtp::is_accepted_domain;

/// Process-wide settings, loaded once at startup and shared read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Name the server announces in greetings and `Received:` lines
    pub hostname: String,

    /// The address to bind the SMTP server to
    pub bind_address: String,

    /// The port to bind the SMTP server to
    pub port: u16,

    /// Recipient domains mail is accepted for (exact match)
    pub valid_domains: Vec<String>,

    /// Root of the `<domain>/<user>/` mailbox tree
    pub mailbox_dir: PathBuf,

    /// External process each accepted message is piped to, if any
    pub forward_command: Option<String>,

    /// Seconds a connection may sit idle before it is dropped
    pub idle_timeout_secs: u64,

    /// Messages the dispatch channel holds before sessions block
    pub dispatch_capacity: usize,
}

impl Settings {
    /// Load settings from environment variables (and a `.env` file if present).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();

        let valid_domains = match env::var("TELESMTP_VALID_DOMAINS") {
            Ok(val) => parse_domain_list(&val),
            Err(e) => {
                let err_msg = "TELESMTP_VALID_DOMAINS environment variable must be set";
                log::error!("{}: {}", err_msg, e);
                return Err(anyhow!(e).context(err_msg));
            }
        };
        if valid_domains.is_empty() {
            let err_msg = "TELESMTP_VALID_DOMAINS must name at least one domain";
            log::error!("{}", err_msg);
            return Err(anyhow!(err_msg));
        }
        log::info!("Config: Using valid_domains: {:?}", valid_domains);

        let hostname = string_or("TELESMTP_HOSTNAME", "localhost");
        let bind_address = string_or("TELESMTP_BIND_ADDRESS", "0.0.0.0");
        let port: u16 = parse_or("TELESMTP_PORT", 2525)?;
        let mailbox_dir = PathBuf::from(string_or("TELESMTP_MAILBOX_DIR", "mailboxes"));

        let forward_command = env::var("TELESMTP_FORWARD_COMMAND")
            .ok()
            .filter(|val| !val.trim().is_empty());
        match &forward_command {
            Some(cmd) => log::info!("Config: Using forward_command: {}", cmd),
            None => log::info!("Config: No forward_command set, forwarding disabled"),
        }

        let idle_timeout_secs: u64 = parse_or("TELESMTP_IDLE_TIMEOUT_SECS", 300)?;
        if idle_timeout_secs == 0 {
            return Err(anyhow!("TELESMTP_IDLE_TIMEOUT_SECS must be greater than zero"));
        }

        let dispatch_capacity: usize = parse_or("TELESMTP_DISPATCH_CAPACITY", 1)?;
        if dispatch_capacity == 0 {
            return Err(anyhow!("TELESMTP_DISPATCH_CAPACITY must be greater than zero"));
        }

        Ok(Settings {
            hostname,
            bind_address,
            port,
            valid_domains,
            mailbox_dir,
            forward_command,
            idle_timeout_secs,
            dispatch_capacity,
        })
    }

    /// Replaces the announced hostname (the optional command-line argument).
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        log::info!("Config: hostname overridden to {}", self.hostname);
        self
    }

    pub fn accepts_domain(&self, host: &str) -> bool {
        is_accepted_domain(host, &self.valid_domains)
    }
}

fn parse_domain_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|domain| !domain.is_empty())
        .map(str::to_string)
        .collect()
}

fn string_or(var: &str, default: &str) -> String {
    env::var(var)
        .map(|val| {
            log::info!("Config: Using {} from env: {}", var, val);
            val
        })
        .unwrap_or_else(|_| {
            log::info!("Config: Using default {}: {}", var, default);
            default.to_string()
        })
}

fn parse_or<T>(var: &str, default: T) -> Result<T>
where
    T: FromStr + std::fmt::Display,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Ok(raw) = env::var(var) else {
        log::info!("Config: Using default {}: {}", var, default);
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(val) => {
            log::info!("Config: Using {} from env: {}", var, val);
            Ok(val)
        }
        Err(e) => {
            let err_msg = format!("{} ('{}') must be a valid number", var, raw);
            log::error!("{}: {}", err_msg, e);
            Err(anyhow!(e).context(err_msg))
        }
    }
}

#[cfg(test)]
mod tests;

//! Consumer side of the dispatch channel: stores each accepted message in
//! the mailbox tree and hands it to the optional forwarding process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::smtp::{Address, DispatchReceiver, Headers, NormalizedMessage};

/// Environment variable naming the stored `.eml` file for the forwarder.
pub const MAIL_FILE_ENV: &str = "TELESMTP_MAIL_FILE";

/// JSON document written to the forwarder's stdin.
#[derive(Debug, Serialize)]
pub struct ForwardPayload<'a> {
    pub from: &'a str,
    pub to: &'a [String],
    pub delivered_to: &'a str,
    pub subject: &'a str,
    pub headers: &'a Headers,
    pub body: &'a str,
}

impl<'a> From<&'a NormalizedMessage> for ForwardPayload<'a> {
    fn from(message: &'a NormalizedMessage) -> Self {
        ForwardPayload {
            from: &message.from,
            to: &message.to,
            delivered_to: &message.delivered_to,
            subject: &message.subject,
            headers: &message.headers,
            body: &message.body,
        }
    }
}

/// Writes raw messages below `<root>/<host>/<user>/`.
pub struct MailboxWriter {
    root: PathBuf,
}

impl MailboxWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        MailboxWriter { root: root.into() }
    }

    /// Stores `raw` for `recipient` and returns the path of the new file.
    pub async fn write(&self, recipient: &Address, raw: &[u8]) -> Result<PathBuf> {
        let dir = mailbox_dir(&self.root, recipient)?;
        create_private_dir(&dir).await?;

        let mut nanos = unix_nanos();
        loop {
            let path = dir.join(format!("{}.eml", nanos));
            match open_private_file(&path).await {
                Ok(mut file) => {
                    file.write_all(raw)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    file.flush().await?;
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => nanos += 1,
                Err(e) => {
                    return Err(anyhow!(e).context(format!("Failed to create {}", path.display())))
                }
            }
        }
    }
}

/// Directory holding `recipient`'s messages. Path separators and dot
/// segments are refused so a local part cannot escape the mailbox root.
pub fn mailbox_dir(root: &Path, recipient: &Address) -> Result<PathBuf> {
    for part in [&recipient.host, &recipient.user] {
        if part.is_empty() || part == "." || part == ".." || part.contains(['/', '\\', '\0']) {
            bail!("Refusing unsafe mailbox path component {:?} for {}", part, recipient);
        }
    }
    Ok(root.join(&recipient.host).join(&recipient.user))
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

async fn create_private_dir(dir: &Path) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder
        .create(dir)
        .await
        .with_context(|| format!("Failed to create mailbox directory {}", dir.display()))
}

async fn open_private_file(path: &Path) -> std::io::Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

/// Runs the configured forwarding command once per message.
pub struct Forwarder {
    program: String,
    args: Vec<String>,
}

impl Forwarder {
    /// Splits `command` on whitespace into a program and its arguments.
    pub fn new(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Forwarder { program, args: parts.collect() })
    }

    /// Spawns the forwarder, feeds it `payload` on stdin and waits for it.
    /// Returns the combined stdout/stderr text.
    pub async fn forward(&self, mail_file: &Path, payload: Vec<u8>) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(MAIL_FILE_ENV, mail_file)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn forwarder {}", self.program))?;

        // Feed stdin while the output pipes drain, then close it.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        if let Err(e) = fed {
            warn!("Forwarder {} did not take the full payload: {}", self.program, e);
        }
        let output =
            output.with_context(|| format!("Failed to wait for forwarder {}", self.program))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            bail!("Forwarder {} exited with {}: {}", self.program, output.status, combined.trim_end());
        }
        Ok(combined)
    }
}

/// Drains the dispatch channel in arrival order until every session and
/// the listener have dropped their senders, then waits for forwarders
/// still running.
pub async fn run_delivery(mut rx: DispatchReceiver, settings: Arc<Settings>) {
    let forwarding = TaskTracker::new();
    let writer = MailboxWriter::new(&settings.mailbox_dir);
    let forwarder = settings.forward_command.as_deref().and_then(Forwarder::new).map(Arc::new);
    let mut stored: u64 = 0;
    let mut failed: u64 = 0;

    while let Some(message) = rx.recv().await {
        let path = match writer.write(&message.envelope_to, &message.raw).await {
            Ok(path) => path,
            Err(e) => {
                failed += 1;
                error!("Could not store message for {}: {:#}", message.envelope_to, e);
                continue;
            }
        };
        stored += 1;
        info!("Stored message for {} in {}", message.envelope_to, path.display());

        let Some(forwarder) = forwarder.as_ref().map(Arc::clone) else {
            continue;
        };
        let payload = match serde_json::to_vec(&ForwardPayload::from(&message)) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Could not encode forward payload for {}: {}", path.display(), e);
                continue;
            }
        };
        forwarding.spawn(async move {
            match forwarder.forward(&path, payload).await {
                Ok(output) => info!("{}: {}", forwarder.program, output.trim_end()),
                Err(e) => error!("Forwarding {} failed: {:#}", path.display(), e),
            }
        });
    }

    forwarding.close();
    if !forwarding.is_empty() {
        info!("Waiting for {} forwarder(s) to finish", forwarding.len());
    }
    forwarding.wait().await;
    info!("Delivery stopped: {} stored, {} failed", stored, failed);
}

//! Plain-text inbox/outbox files.
//!
//! The inbox is a single UTF-8 file the user (or a bridge) overwrites; each
//! save is one message. The fast tick probes the file's mtime, and on change
//! hands the trimmed content off as an episode plus an event, then truncates
//! the file. The outbox is an append-only log of outgoing messages.

use std::path::PathBuf;
use std::time::SystemTime;

use chrono::Utc;
use tokio::io::AsyncWriteExt;

/// Inbox/outbox pair for one agent.
pub struct Mailbox {
    inbox_path: PathBuf,
    outbox_path: PathBuf,
    agent_name: String,
    last_mtime: parking_lot::Mutex<Option<SystemTime>>,
}

impl Mailbox {
    pub fn new(inbox_path: PathBuf, outbox_path: PathBuf, agent_name: impl Into<String>) -> Self {
        Self {
            inbox_path,
            outbox_path,
            agent_name: agent_name.into(),
            last_mtime: parking_lot::Mutex::new(None),
        }
    }

    /// Probe the inbox. Returns the message when the file changed since the
    /// last probe and holds non-whitespace content; the file is truncated
    /// after a successful read so the next save is a fresh message.
    pub async fn poll_inbox(&self) -> std::io::Result<Option<String>> {
        let metadata = match tokio::fs::metadata(&self.inbox_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mtime = metadata.modified()?;
        {
            let mut last = self.last_mtime.lock();
            if *last == Some(mtime) {
                return Ok(None);
            }
            *last = Some(mtime);
        }

        let content = tokio::fs::read_to_string(&self.inbox_path).await?;
        let message = content.trim();
        if message.is_empty() {
            return Ok(None);
        }
        let message = message.to_string();

        // Truncate after the read so a save during processing is a new mtime.
        tokio::fs::write(&self.inbox_path, b"").await?;
        if let Ok(meta) = tokio::fs::metadata(&self.inbox_path).await {
            if let Ok(mtime) = meta.modified() {
                *self.last_mtime.lock() = Some(mtime);
            }
        }
        tracing::info!(bytes = message.len(), "inbox message received");
        Ok(Some(message))
    }

    /// Append one outgoing message:
    ///
    /// ```text
    /// --- [YYYY-MM-DD HH:MM:SS] <AgentName> ---
    /// <body>
    /// <blank line>
    /// ```
    pub async fn write_outbox(&self, body: &str) -> std::io::Result<()> {
        if let Some(parent) = self.outbox_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
        let entry = format!("--- [{stamp}] {} ---\n{body}\n\n", self.agent_name);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.outbox_path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

//! Busy-token locking for the merge ledger
//!
//! The lock is a single token file per run, created with create-new
//! semantics. Holders are independent processes, so there is no lock
//! service: contenders observe the token, wait a bounded time, and may
//! reclaim it once it is older than the staleness threshold.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SubmitError};

const INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

pub(crate) fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// How long to wait for the token, and when a held token counts as abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub wait: Duration,
    pub stale_after: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(5),
            stale_after: Duration::from_secs(600),
        }
    }
}

/// Marker written into the token file by the current holder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusyToken {
    pub pid: u32,
    pub hostname: String,
    /// Worker slot of a merge process; `None` for the driver
    pub slot: Option<u32>,
    pub acquired_at: DateTime<Utc>,
    pub nonce: String,
}

impl BusyToken {
    pub fn new(slot: Option<u32>) -> Self {
        Self {
            pid: std::process::id(),
            hostname: hostname(),
            slot,
            acquired_at: Utc::now(),
            nonce: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Tokens stamped in the future (clock skew) are never stale
    pub fn is_stale(&self, threshold: Duration) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.acquired_at);
        elapsed.to_std().map(|d| d > threshold).unwrap_or(false)
    }

    fn owner(&self) -> String {
        match self.slot {
            Some(slot) => format!("{}:{} (cpu {})", self.hostname, self.pid, slot),
            None => format!("{}:{} (driver)", self.hostname, self.pid),
        }
    }
}

/// What a contender finds in an existing token file
#[derive(Debug, Clone, PartialEq)]
enum Holder {
    Token(BusyToken),
    /// Created but not (fully) written yet, or corrupt; aged by mtime
    Unreadable { modified: SystemTime },
}

impl Holder {
    fn is_stale(&self, threshold: Duration) -> bool {
        match self {
            Holder::Token(token) => token.is_stale(threshold),
            Holder::Unreadable { modified } => modified
                .elapsed()
                .map(|d| d > threshold)
                .unwrap_or(false),
        }
    }

    /// Same token that was judged stale; a half-written file is only
    /// the same one if it was not touched since
    fn same_as(&self, other: &Holder) -> bool {
        match (self, other) {
            (Holder::Token(a), Holder::Token(b)) => a.nonce == b.nonce,
            (Holder::Unreadable { modified: a }, Holder::Unreadable { modified: b }) => a == b,
            _ => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            Holder::Token(token) => token.owner(),
            Holder::Unreadable { .. } => "unknown holder".to_string(),
        }
    }
}

/// Exclusive hold on a run's ledger; the token is removed on drop
#[derive(Debug)]
pub struct MergeLock {
    path: PathBuf,
    token: BusyToken,
}

impl MergeLock {
    /// Acquire the token at `path`, waiting at most `policy.wait`
    pub async fn acquire(path: &Path, slot: Option<u32>, policy: &LockPolicy) -> Result<MergeLock> {
        let token = BusyToken::new(slot);
        let started = tokio::time::Instant::now();
        let deadline = started + policy.wait;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match write_token(path, &token).await {
                Ok(()) => {
                    debug!(path = ?path, slot = ?slot, "Busy token acquired");
                    return Ok(MergeLock {
                        path: path.to_path_buf(),
                        token,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            match read_holder(path).await? {
                Some(holder) if holder.is_stale(policy.stale_after) => {
                    if reclaim(path, &holder).await? {
                        // retry immediately, the slot is free
                        continue;
                    }
                }
                Some(holder) => {
                    debug!(path = ?path, holder = %holder.describe(), "Busy token held");
                }
                // released between our create and read
                None => continue,
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(SubmitError::LockTimeout {
                    path: path.to_path_buf(),
                    waited: now - started,
                });
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    pub fn token(&self) -> &BusyToken {
        &self.token
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MergeLock {
    fn drop(&mut self) {
        // only remove the token if it is still ours; it may have been
        // reclaimed if this holder outlived the staleness threshold
        let ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|c| serde_json::from_str::<BusyToken>(&c).ok())
            .is_some_and(|t| t.nonce == self.token.nonce);

        if ours {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = ?self.path, "Failed to release busy token: {}", e);
            } else {
                debug!(path = ?self.path, "Busy token released");
            }
        } else {
            warn!(path = ?self.path, "Busy token was reclaimed by another process before release");
        }
    }
}

async fn write_token(path: &Path, token: &BusyToken) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    let payload = serde_json::to_string(token)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
    file.write_all(payload.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.sync_all().await?;
    Ok(())
}

async fn read_holder(path: &Path) -> Result<Option<Holder>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if let Ok(token) = serde_json::from_str::<BusyToken>(&content) {
        return Ok(Some(Holder::Token(token)));
    }

    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(Holder::Unreadable {
            modified: meta.modified()?,
        })),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Move a stale token aside. Returns false if another contender got there
/// first or the token turned out to be fresh.
async fn reclaim(path: &Path, stale: &Holder) -> Result<bool> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "MERGE.BUSY".to_string());
    let aside = path.with_file_name(format!(
        "{}.STALE-{}",
        file_name,
        &Uuid::new_v4().simple().to_string()[..8]
    ));

    match fs::rename(path, &aside).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    let moved = read_holder(&aside).await?;
    if moved.as_ref().is_some_and(|m| m.same_as(stale)) {
        warn!(path = ?path, holder = %stale.describe(), "Reclaimed stale busy token");
        fs::remove_file(&aside).await.ok();
        return Ok(true);
    }

    // we captured a token written after our staleness check; put it back
    // without clobbering anything created in the meantime
    if let Err(e) = fs::hard_link(&aside, path).await {
        warn!(path = ?path, "Could not restore live busy token: {}", e);
    }
    fs::remove_file(&aside).await.ok();
    Ok(false)
}

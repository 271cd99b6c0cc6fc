//! Traffic ledger.
//!
//! Routing decisions are handed to a background writer through a bounded
//! queue. The decision path never waits on the ledger, and append failures
//! are logged and dropped.

use crate::router::Tier;
use crate::score::Recommendation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One routed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub domain: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub fingerprint: Option<String>,
    pub tier: Tier,
    pub backend: String,
    pub score: u8,
    pub is_bot: bool,
    pub recommendation: Recommendation,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Durable append-only store of traffic records.
#[async_trait]
pub trait TrafficLedger: Send + Sync {
    async fn append(&self, record: TrafficRecord) -> anyhow::Result<()>;
}

/// Ledger kept in memory.
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<Vec<TrafficRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything appended so far.
    pub fn records(&self) -> Vec<TrafficRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TrafficLedger for MemoryLedger {
    async fn append(&self, record: TrafficRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("memory ledger lock poisoned"))?
            .push(record);
        Ok(())
    }
}

/// Ledger writing one JSON object per line to a file.
pub struct JsonLinesLedger {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonLinesLedger {
    /// Open (or create) the file for appending.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TrafficLedger for JsonLinesLedger {
    async fn append(&self, record: TrafficRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Cheap, cloneable sender side of the ledger queue.
#[derive(Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<TrafficRecord>,
}

impl LedgerHandle {
    /// Queue a record without waiting. Drops the record if the queue is full or closed.
    pub fn record(&self, record: TrafficRecord) {
        if let Err(e) = self.tx.try_send(record) {
            let (reason, record) = match e {
                mpsc::error::TrySendError::Full(r) => ("queue_full", r),
                mpsc::error::TrySendError::Closed(r) => ("writer_closed", r),
            };
            warn!(
                domain = %record.domain,
                tier = record.tier.as_str(),
                reason,
                "Traffic record dropped"
            );
        }
    }
}

/// Background task draining the ledger queue.
pub struct LedgerWriter {
    task: JoinHandle<()>,
}

impl LedgerWriter {
    /// Spawn the writer on the current tokio runtime.
    pub fn spawn(ledger: Arc<dyn TrafficLedger>, capacity: usize) -> (LedgerHandle, Self) {
        let (tx, mut rx) = mpsc::channel::<TrafficRecord>(capacity.max(1));

        let task = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let domain = record.domain.clone();
                if let Err(e) = ledger.append(record).await {
                    warn!(domain = %domain, error = %e, "Traffic ledger append failed");
                }
            }
            debug!("Traffic ledger writer stopped");
        });

        (LedgerHandle { tx }, Self { task })
    }

    /// Wait until every handle is dropped and the queue is drained.
    pub async fn finish(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "Traffic ledger writer panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(domain: &str) -> TrafficRecord {
        TrafficRecord {
            domain: domain.to_string(),
            client_ip: Some("81.2.69.160".to_string()),
            user_agent: None,
            method: Some("GET".to_string()),
            path: Some("/".to_string()),
            fingerprint: None,
            tier: Tier::A,
            backend: "https://a.example.net".to_string(),
            score: 12,
            is_bot: false,
            recommendation: Recommendation::Allow,
            reason: "traffic split".to_string(),
            timestamp: Utc::now(),
        }
    }

    struct BrokenLedger;

    #[async_trait]
    impl TrafficLedger for BrokenLedger {
        async fn append(&self, _record: TrafficRecord) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    #[tokio::test]
    async fn test_writer_drains_queue() {
        let ledger = Arc::new(MemoryLedger::new());
        let (handle, writer) = LedgerWriter::spawn(ledger.clone(), 16);
        handle.record(record("a.com"));
        handle.record(record("b.com"));
        drop(handle);
        writer.finish().await;

        let domains: Vec<String> = ledger.records().into_iter().map(|r| r.domain).collect();
        assert_eq!(domains, vec!["a.com", "b.com"]);
    }

    #[tokio::test]
    async fn test_failing_ledger_is_swallowed() {
        let (handle, writer) = LedgerWriter::spawn(Arc::new(BrokenLedger), 4);
        handle.record(record("a.com"));
        drop(handle);
        writer.finish().await;
    }

    #[tokio::test]
    async fn test_closed_writer_does_not_panic() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = LedgerHandle { tx };
        handle.record(record("a.com"));
    }

    #[tokio::test]
    async fn test_json_lines_ledger() {
        let path = std::env::temp_dir().join(format!("tiergate-ledger-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let ledger = JsonLinesLedger::open(&path).await.unwrap();
        ledger.append(record("a.com")).await.unwrap();
        ledger.append(record("b.com")).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<TrafficRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].domain, "b.com");
        let _ = std::fs::remove_file(&path);
    }
}

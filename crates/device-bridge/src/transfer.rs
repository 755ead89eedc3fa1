//! Batch file transfer
//!
//! A batch keeps going after a per-file failure and reports one line per
//! file plus an aggregate status. Files already transferred are left in
//! place when a later one fails.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::status::Status;
use crate::transport::{DeviceHandle, SyncProgressMonitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Push,
    Pull,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Push => f.write_str("push"),
            TransferDirection::Pull => f.write_str("pull"),
        }
    }
}

/// Outcome of one file in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferResult {
    pub source: String,
    pub destination: String,
    pub outcome: Result<(), String>,
}

impl FileTransferResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Diagnostic line shown to the user
    pub fn line(&self) -> String {
        match &self.outcome {
            Ok(()) => format!("{} -> {}: OK", self.source, self.destination),
            Err(e) => format!("{} -> {}: FAILED ({})", self.source, self.destination, e),
        }
    }
}

/// Aggregate result of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub status: Status,
    pub results: Vec<FileTransferResult>,
}

impl TransferReport {
    fn from_results(results: Vec<FileTransferResult>) -> Self {
        let failures: Vec<String> = results
            .iter()
            .filter(|r| !r.is_ok())
            .map(FileTransferResult::line)
            .collect();

        let status = if failures.is_empty() {
            Status::ok()
        } else {
            Status::error(failures.join("\n"))
        };
        Self { status, results }
    }

    fn cancelled(results: Vec<FileTransferResult>) -> Self {
        Self {
            status: Status::cancel(),
            results,
        }
    }

    /// Every file failed for the same reason
    fn failed_all(pairs: Vec<(String, String)>, reason: String) -> Self {
        let results = pairs
            .into_iter()
            .map(|(source, destination)| FileTransferResult {
                source,
                destination,
                outcome: Err(reason.clone()),
            })
            .collect();
        Self::from_results(results)
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            status: Status::error(reason),
            results: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn lines(&self) -> Vec<String> {
        self.results.iter().map(FileTransferResult::line).collect()
    }
}

/// Progress of a single file, cancellable through the batch token
pub struct TransferMonitor {
    total: AtomicU64,
    done: AtomicU64,
    cancel: CancellationToken,
}

impl TransferMonitor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            total: AtomicU64::new(0),
            done: AtomicU64::new(0),
            cancel,
        }
    }

    /// (done, total) work units
    pub fn progress(&self) -> (u64, u64) {
        (self.done.load(Ordering::Relaxed), self.total.load(Ordering::Relaxed))
    }
}

impl SyncProgressMonitor for TransferMonitor {
    fn start(&self, total_work: u64) {
        self.total.store(total_work, Ordering::Relaxed);
    }

    fn advance(&self, work: u64) {
        self.done.fetch_add(work, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Transfer `pairs` of (source, destination) in order
pub async fn run_batch(
    device: &Arc<dyn DeviceHandle>,
    direction: TransferDirection,
    pairs: Vec<(String, String)>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> TransferReport {
    let serial = device.serial_number().to_string();

    if cancel.is_cancelled() {
        return TransferReport::cancelled(Vec::new());
    }

    if !device.is_online().await {
        warn!("[{}] {} of {} files refused: device offline", serial, direction, pairs.len());
        return TransferReport::failed_all(pairs, format!("Device {} is not online", serial));
    }

    let sync = match device.sync_service().await {
        Ok(sync) => sync,
        Err(e) => {
            warn!("[{}] unable to open sync service: {}", serial, e);
            return TransferReport::failed_all(pairs, format!("Unable to open sync service: {}", e));
        }
    };

    let deadline = Instant::now() + timeout;
    let mut results = Vec::with_capacity(pairs.len());

    for (source, destination) in pairs {
        if cancel.is_cancelled() {
            info!("[{}] {} cancelled after {} files", serial, direction, results.len());
            return TransferReport::cancelled(results);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = if remaining.is_zero() {
            Err(format!("timed out after {:?}", timeout))
        } else {
            let monitor = TransferMonitor::new(cancel.clone());
            let transfer = async {
                match direction {
                    TransferDirection::Push => {
                        sync.push_file(Path::new(&source), &destination, &monitor).await
                    }
                    TransferDirection::Pull => {
                        sync.pull_file(&source, Path::new(&destination), &monitor).await
                    }
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[{}] {} cancelled during {}", serial, direction, source);
                    return TransferReport::cancelled(results);
                }
                finished = tokio::time::timeout(remaining, transfer) => match finished {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {:?}", timeout)),
                },
            }
        };

        match &outcome {
            Ok(()) => debug!("[{}] {} {} -> {}", serial, direction, source, destination),
            Err(e) => warn!("[{}] {} {} -> {} failed: {}", serial, direction, source, destination, e),
        }

        results.push(FileTransferResult {
            source,
            destination,
            outcome,
        });
    }

    TransferReport::from_results(results)
}

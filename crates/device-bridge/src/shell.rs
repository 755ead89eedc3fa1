//! Shell commands with a completion latch
//!
//! A command's output is collected by a receiver that opens a latch when
//! the transport flushes it. The caller waits on the latch, the command's
//! own completion, a timeout and a cancellation token, whichever comes first.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::{DeviceHandle, ShellOutputReceiver, TransportError};

/// Failure of a shell command or readiness probe
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    /// The bridge refused the command outright
    #[error("command rejected by {serial}: {reason}")]
    Rejected { serial: String, reason: String },
    #[error("timeout running `{command}` on {serial}")]
    Timeout { serial: String, command: String },
    #[error("command cancelled")]
    Cancelled,
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("transport failure on {serial}: {reason}")]
    Transport { serial: String, reason: String },
}

impl ProcessError {
    /// Only a timeout is worth retrying as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessError::Timeout { .. })
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, ProcessError::Rejected { .. })
    }

    fn from_transport(serial: &str, command: &str, e: TransportError) -> Self {
        match e {
            TransportError::Rejected(reason) => ProcessError::Rejected {
                serial: serial.to_string(),
                reason,
            },
            TransportError::Timeout => ProcessError::Timeout {
                serial: serial.to_string(),
                command: command.to_string(),
            },
            TransportError::DeviceNotFound(s) => ProcessError::DeviceNotFound(s),
            other => ProcessError::Transport {
                serial: serial.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Collects output into a buffer and opens a latch on flush
pub struct CollectingReceiver {
    output: Mutex<Vec<u8>>,
    done: Notify,
    cancel: CancellationToken,
}

impl CollectingReceiver {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            output: Mutex::new(Vec::new()),
            done: Notify::new(),
            cancel,
        }
    }

    /// Wait until the transport has flushed this receiver
    pub async fn wait(&self) {
        self.done.notified().await
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output.lock()).into_owned()
    }
}

impl ShellOutputReceiver for CollectingReceiver {
    fn add_output(&self, data: &[u8]) {
        self.output.lock().extend_from_slice(data);
    }

    fn flush(&self) {
        // notify_one stores a permit, so a flush before wait() is not lost
        self.done.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Run `command` on `device` and return its captured output
pub async fn run_shell(
    device: &Arc<dyn DeviceHandle>,
    command: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String, ProcessError> {
    let serial = device.serial_number().to_string();

    if cancel.is_cancelled() {
        return Err(ProcessError::Cancelled);
    }

    let receiver = Arc::new(CollectingReceiver::new(cancel.child_token()));
    let mut exec = {
        let device = Arc::clone(device);
        let command = command.to_string();
        let sink: Arc<dyn ShellOutputReceiver> = receiver.clone();
        tokio::spawn(async move { device.execute_shell_command(&command, sink, timeout).await })
    };

    debug!("[{}] shell: {}", serial, command);

    let outcome = tokio::time::timeout(timeout, async {
        tokio::select! {
            _ = cancel.cancelled() => Err(ProcessError::Cancelled),
            _ = receiver.wait() => Ok(()),
            joined = &mut exec => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(ProcessError::from_transport(&serial, command, e)),
                Err(e) => Err(ProcessError::Transport {
                    serial: serial.clone(),
                    reason: e.to_string(),
                }),
            },
        }
    })
    .await;

    match outcome {
        Ok(Ok(())) => Ok(receiver.output()),
        Ok(Err(e)) => {
            exec.abort();
            warn!("[{}] shell `{}` failed: {}", serial, command, e);
            Err(e)
        }
        Err(_) => {
            exec.abort();
            warn!("[{}] shell `{}` timed out after {:?}", serial, command, timeout);
            Err(ProcessError::Timeout {
                serial,
                command: command.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        let timeout = ProcessError::Timeout {
            serial: "s".into(),
            command: "ls".into(),
        };
        let rejected = ProcessError::Rejected {
            serial: "s".into(),
            reason: "device offline".into(),
        };
        assert!(timeout.is_retryable());
        assert!(!rejected.is_retryable());
        assert!(rejected.is_rejection());
    }

    #[test]
    fn test_transport_mapping() {
        let err = ProcessError::from_transport("s", "ls", TransportError::Rejected("offline".into()));
        assert!(err.is_rejection());
        let err = ProcessError::from_transport("s", "ls", TransportError::Timeout);
        assert!(err.is_retryable());
        let err = ProcessError::from_transport("s", "ls", TransportError::Io("eof".into()));
        assert!(matches!(err, ProcessError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_flush_before_wait_opens_latch() {
        let receiver = CollectingReceiver::new(CancellationToken::new());
        receiver.add_output(b"1\n");
        receiver.flush();
        tokio::time::timeout(Duration::from_millis(100), receiver.wait())
            .await
            .expect("latch should already be open");
        assert_eq!(receiver.output(), "1\n");
    }
}

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DrainError {
    /// I/O errors from the accounting file or thread spawning
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The kernel queue could not be opened or bound
    #[error("failed to open netfilter queue {queue_num}: {source}")]
    QueueOpen { queue_num: u16, source: io::Error },

    /// Another live session in this process already owns the queue number
    #[error("netfilter queue {0} is already claimed by another drain session")]
    QueueInUse(u16),

    /// An iptables invocation failed
    #[error("`{command}` failed: {reason}")]
    Firewall { command: String, reason: String },

    #[error("incorrect IP: {0}")]
    InvalidAddress(String),

    /// A line of the accounting file did not hold nine unsigned integers
    #[error("malformed queue record on line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    /// The background control task is gone, no handshake is possible
    #[error("drain controller is no longer running")]
    ControllerGone,
}

pub type Result<T> = std::result::Result<T, DrainError>;

impl DrainError {
    pub fn malformed(line: usize, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            line,
            reason: reason.into(),
        }
    }
}

use std::fmt::Write as _;
use std::io;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use log::{debug, info, warn};

use crate::accounting::{QueueAccounting, QueueStats};
use crate::error::{DrainError, Result};

/// What changed for our queue since the previous look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub stats: QueueStats,
    pub queue_dropped: u64,
    pub user_dropped: u64,
}

// ==========================================
// 周期性看一眼内核的队列统计
// ==========================================
pub struct QueueMonitor {
    path: PathBuf,
    queue_num: u16,
    accounting: Option<QueueAccounting>,
    last: Option<QueueStats>,
}

impl QueueMonitor {
    pub fn new(path: impl Into<PathBuf>, queue_num: u16) -> Self {
        Self {
            path: path.into(),
            queue_num,
            accounting: None,
            last: None,
        }
    }

    /// Refreshes the snapshot. `Ok(None)` means our queue is not bound right now.
    pub fn poll(&mut self) -> Result<Option<Report>> {
        match &self.accounting {
            Some(acc) => acc.refresh()?,
            None => self.accounting = Some(QueueAccounting::open(&self.path)?),
        }

        let queue_num = self.queue_num;
        let Some(stats) = self.accounting.as_ref().and_then(|acc| acc.get(queue_num)) else {
            self.last = None;
            return Ok(None);
        };

        // 计数器在队列重新 bind 之后会归零
        let (queue_dropped, user_dropped) = match self.last {
            Some(prev) => (
                stats.queue_dropped.saturating_sub(prev.queue_dropped),
                stats.user_dropped.saturating_sub(prev.user_dropped),
            ),
            None => (0, 0),
        };
        self.last = Some(stats);

        Ok(Some(Report {
            stats,
            queue_dropped,
            user_dropped,
        }))
    }

    pub fn check(&mut self) {
        match self.poll() {
            Ok(Some(report)) => {
                if report.queue_dropped > 0 || report.user_dropped > 0 {
                    warn!(
                        "Queue {} dropped {} packets (kernel) and {} packets (userspace)",
                        self.queue_num, report.queue_dropped, report.user_dropped
                    );
                }
                if report.stats.waiting > 0 {
                    info!(
                        "Queue {} holds {} packets",
                        self.queue_num, report.stats.waiting
                    );
                }
            }
            Ok(None) => debug!("Queue {} is not bound", self.queue_num),
            Err(DrainError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No active netfilter queues");
            }
            Err(e) => warn!("Couldn't read {}: {}", self.path.display(), e),
        }
    }

    pub fn spawn(mut self, interval: Duration) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("nfq-drain-stats-{}", self.queue_num))
            .spawn(move || {
                loop {
                    self.check();
                    thread::sleep(interval);
                }
            })
    }
}

pub fn render_table(queues: &[QueueStats]) -> String {
    let mut out = String::new();
    let now_str = Local::now().format("%H:%M:%S").to_string();

    let _ = writeln!(out, "[{}] netfilter queues", now_str);
    let _ = writeln!(
        out,
        "{:<6} | {:<10} | {:<8} | {:<10} | {:<10} | {:<10}",
        "Queue", "PortID", "Waiting", "QDropped", "UDropped", "LastSeq"
    );
    for q in queues {
        let _ = writeln!(
            out,
            "{:<6} | {:<10} | {:<8} | {:<10} | {:<10} | {:<10}",
            q.id, q.port_id, q.waiting, q.queue_dropped, q.user_dropped, q.last_seq
        );
    }
    out
}

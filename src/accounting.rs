use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use crate::error::{DrainError, Result};

pub const PROC_NETFILTER_QUEUE: &str = "/proc/net/netfilter/nfnetlink_queue";

// ==========================================
// 内核每个队列的一行统计
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub id: u16,
    pub port_id: u64,
    pub waiting: u64,
    pub copy_mode: u64,
    pub copy_range: u64,
    pub queue_dropped: u64,
    pub user_dropped: u64,
    pub last_seq: u64,
    pub flag: u64,
}

impl FromStr for QueueStats {
    type Err = String;

    /// `id portID waiting copyMode copyRange queueDropped userDropped lastSeq flag`
    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 9 {
            return Err(format!("expected 9 fields, found {}", fields.len()));
        }
        let num = |i: usize| {
            fields[i]
                .parse::<u64>()
                .map_err(|e| format!("field {} ({:?}): {}", i + 1, fields[i], e))
        };
        let id = fields[0]
            .parse::<u16>()
            .map_err(|e| format!("queue id ({:?}): {}", fields[0], e))?;

        Ok(QueueStats {
            id,
            port_id: num(1)?,
            waiting: num(2)?,
            copy_mode: num(3)?,
            copy_range: num(4)?,
            queue_dropped: num(5)?,
            user_dropped: num(6)?,
            last_seq: num(7)?,
            flag: num(8)?,
        })
    }
}

// ==========================================
// 快照：一个写者 (refresh)，多个读者 (get)
// ==========================================
pub struct QueueAccounting {
    path: PathBuf,
    queues: RwLock<HashMap<u16, QueueStats>>,
}

impl QueueAccounting {
    /// Reads the accounting file once and returns a ready snapshot.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let accounting = Self {
            path: path.as_ref().to_path_buf(),
            queues: RwLock::new(HashMap::new()),
        };
        accounting.refresh()?;
        Ok(accounting)
    }

    /// Fails with an I/O error when the file is absent, which on most hosts just
    /// means no queue is bound right now.
    pub fn refresh(&self) -> Result<()> {
        let file = File::open(&self.path)?;
        self.refresh_from(BufReader::new(file))
    }

    /// Replaces the snapshot with the records in `reader`. Ids not present are
    /// evicted. On a malformed line the previous snapshot is kept as is.
    pub fn refresh_from<R: BufRead>(&self, reader: R) -> Result<()> {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);

        let mut fresh = HashMap::with_capacity(queues.len());
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let stats: QueueStats = line
                .parse()
                .map_err(|reason: String| DrainError::malformed(idx + 1, reason))?;
            fresh.insert(stats.id, stats);
        }

        *queues = fresh;
        Ok(())
    }

    pub fn get(&self, id: u16) -> Option<QueueStats> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        queues.get(&id).copied()
    }

    /// All live queues, ordered by id.
    pub fn snapshot(&self) -> Vec<QueueStats> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<QueueStats> = queues.values().copied().collect();
        all.sort_unstable_by_key(|q| q.id);
        all
    }
}

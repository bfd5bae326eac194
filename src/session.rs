use std::collections::HashSet;
use std::io;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::{debug, error, info, warn};

use crate::config::DrainConfig;
use crate::error::{DrainError, Result};
use crate::firewall::{Iptables, RuleRunner, RuleSet};
use crate::interceptor::{Gate, Interceptor, PacketQueue};
use crate::nfq_queue::NfQueue;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

lazy_static! {
    // 同一进程内，一个队列号只能属于一个会话
    static ref CLAIMED_QUEUES: Mutex<HashSet<u16>> = Mutex::new(HashSet::new());
}

/// Retains new connections while the proxy behind them is reloaded.
pub trait Drain {
    /// Starts redirecting new connections and returns once they are being held.
    fn capture(&self) -> Result<()>;
    /// Lets held connections through and stops redirecting. Does not wait.
    fn release(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Draining,
}

// 收包线程不会退出，队列号一旦被占用就一直占到进程结束
fn claim_queue(queue_num: u16) -> Result<()> {
    let mut claimed = CLAIMED_QUEUES.lock().unwrap_or_else(PoisonError::into_inner);
    if !claimed.insert(queue_num) {
        return Err(DrainError::QueueInUse(queue_num));
    }
    Ok(())
}

struct Shared {
    state: SessionState,
    release_pending: bool,
    /// capture 请求从发出到规则拆完之前都算在内
    pending: usize,
}

struct Status {
    shared: Mutex<Shared>,
    changed: Condvar,
}

impl Status {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut Shared)) {
        let mut shared = self.lock();
        f(&mut shared);
        self.changed.notify_all();
    }
}

// ==========================================
// 单槽交接：capture -> capturing -> release，三个容量为 1 的通道
// ==========================================
struct Handoff {
    capture_tx: SyncSender<()>,
    // 持有这把锁的 capture 才能发请求，后来者排队
    capturing_rx: Mutex<Receiver<()>>,
    release_tx: SyncSender<()>,
    status: Arc<Status>,
    interceptor: Interceptor,
}

/// The queue number stays claimed for the rest of the process after the
/// session is dropped, since the verdict thread keeps the kernel queue bound.
pub struct DrainSession {
    queue_num: u16,
    handoff: Option<Handoff>,
}

impl DrainSession {
    /// Binds the kernel queue and starts the background tasks. With no
    /// addresses nothing is started and the session stays a no-op.
    pub fn new(config: &DrainConfig) -> Result<Self> {
        let queue_num = config.queue_num;
        let max_len = config.max_queue_len;
        Self::with_backends(config, Box::new(Iptables::new(&config.iptables)), move || {
            NfQueue::open(queue_num, max_len)
        })
    }

    pub fn with_backends<Q, F>(
        config: &DrainConfig,
        runner: Box<dyn RuleRunner>,
        open_queue: F,
    ) -> Result<Self>
    where
        Q: PacketQueue + 'static,
        F: FnOnce() -> io::Result<Q> + Send + 'static,
    {
        let mut session = Self {
            queue_num: config.queue_num,
            handoff: None,
        };
        if config.addresses.is_empty() {
            info!("No addresses configured, connections won't be held during reloads");
            return Ok(session);
        }

        claim_queue(config.queue_num)?;
        let interceptor = Interceptor::spawn(config.queue_num, open_queue)?;
        let rules = RuleSet::new(&config.addresses, config.queue_num, runner);

        let (capture_tx, capture_rx) = sync_channel(1);
        let (capturing_tx, capturing_rx) = sync_channel(1);
        let (release_tx, release_rx) = sync_channel(1);
        let status = Arc::new(Status {
            shared: Mutex::new(Shared {
                state: SessionState::Idle,
                release_pending: false,
                pending: 0,
            }),
            changed: Condvar::new(),
        });

        let task = ControlTask {
            rules,
            gate: interceptor.gate(),
            retries: config.rule_retries,
            status: Arc::clone(&status),
        };
        thread::Builder::new()
            .name(format!("nfq-drain-ctl-{}", config.queue_num))
            .spawn(move || task.run(capture_rx, capturing_tx, release_rx))?;

        session.handoff = Some(Handoff {
            capture_tx,
            capturing_rx: Mutex::new(capturing_rx),
            release_tx,
            status,
            interceptor,
        });
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        match &self.handoff {
            Some(h) => h.status.lock().state,
            None => SessionState::Idle,
        }
    }

    /// Whether the verdict loop is currently letting packets through.
    pub fn is_accepting(&self) -> bool {
        self.handoff
            .as_ref()
            .is_none_or(|h| h.interceptor.gate().is_accepting())
    }

    /// Waits until no capture is in flight and every rule is gone. False on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let Some(h) = &self.handoff else {
            return true;
        };
        let shared = h.status.lock();
        let (shared, _) = h
            .status
            .changed
            .wait_timeout_while(shared, timeout, |s| s.pending > 0)
            .unwrap_or_else(PoisonError::into_inner);
        shared.pending == 0
    }

    /// Releases every drain in flight, including one still installing rules or
    /// queued behind another, and waits until the rules are removed.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let Some(h) = &self.handoff else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        let mut shared = h.status.lock();
        while shared.pending > 0 {
            if shared.state == SessionState::Draining && !shared.release_pending {
                shared.release_pending = true;
                if h.release_tx.send(()).is_err() {
                    warn!("Couldn't release drain on shutdown: {}", DrainError::ControllerGone);
                    return false;
                }
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            shared = h
                .status
                .changed
                .wait_timeout(shared, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl Drain for DrainSession {
    fn capture(&self) -> Result<()> {
        let Some(h) = &self.handoff else {
            return Ok(());
        };
        let capturing = h.capturing_rx.lock().unwrap_or_else(PoisonError::into_inner);
        h.status.update(|s| s.pending += 1);
        if h.capture_tx.send(()).is_err() {
            h.status.update(|s| s.pending -= 1);
            return Err(DrainError::ControllerGone);
        }
        capturing.recv().map_err(|_| DrainError::ControllerGone)
    }

    fn release(&self) -> Result<()> {
        let Some(h) = &self.handoff else {
            return Ok(());
        };
        let mut shared = h.status.lock();
        if shared.state != SessionState::Draining || shared.release_pending {
            warn!("Release without a pending capture on queue {}, ignoring", self.queue_num);
            return Ok(());
        }
        shared.release_pending = true;
        h.release_tx.send(()).map_err(|_| DrainError::ControllerGone)
    }
}

// ==========================================
// 控制线程：装规则 -> 关闸 -> 确认 -> 等 release -> 拆规则 -> 开闸
// ==========================================
struct ControlTask {
    rules: RuleSet,
    gate: Arc<Gate>,
    retries: u32,
    status: Arc<Status>,
}

impl ControlTask {
    fn run(mut self, capture: Receiver<()>, capturing: SyncSender<()>, release: Receiver<()>) {
        for () in capture.iter() {
            let installed = self.rules.install();
            if let Err(e) = retry(self.retries, installed, || self.rules.install()) {
                self.fatal(e);
            }

            let removed = {
                let guard = self.rules.guard();
                self.gate.close();
                self.status.update(|s| {
                    s.state = SessionState::Draining;
                    s.release_pending = false;
                });
                info!("Holding new connections");
                let _ = capturing.send(());

                if release.recv().is_err() {
                    debug!("Drain session dropped while draining");
                }
                guard.release()
            };
            if let Err(e) = retry(self.retries, removed, || self.rules.remove()) {
                self.fatal(e);
            }

            self.gate.open();
            self.status.update(|s| {
                s.state = SessionState::Idle;
                s.release_pending = false;
                s.pending = s.pending.saturating_sub(1);
            });
            info!("Released held connections");
        }
    }

    /// Removes whatever got installed, reopens the gate and exits the process.
    fn fatal(&mut self, err: DrainError) -> ! {
        error!("iptables failed: {}", err);
        if let Err(e) = self.rules.remove() {
            error!("Couldn't clean up redirect rules: {}", e);
        }
        self.gate.open();
        std::process::exit(1);
    }
}

fn retry(retries: u32, mut outcome: Result<()>, mut op: impl FnMut() -> Result<()>) -> Result<()> {
    for attempt in 1..=retries {
        match outcome {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("{} (retry {}/{})", e, attempt, retries);
                thread::sleep(RETRY_BACKOFF);
                outcome = op();
            }
        }
    }
    outcome
}

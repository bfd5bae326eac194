use std::io;
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{DrainError, Result};
use crate::five_tuple::FiveTuple;

/// How long one receive waits before the loop ticks.
pub const PACKET_TIMEOUT: Duration = Duration::from_millis(100);

/// Kernel side of the interception: hands out queued packets and takes verdicts.
pub trait PacketQueue {
    type Packet: AsRef<[u8]>;

    /// Next queued packet, or `None` once `timeout` passes without one.
    fn recv_timeout(&mut self, timeout: Duration) -> io::Result<Option<Self::Packet>>;

    fn accept(&mut self, packet: Self::Packet) -> io::Result<()>;
}

// ==========================================
// accept/hold 闸门：控制线程和收包线程唯一共享的状态
// ==========================================
pub struct Gate {
    accepting: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self {
            accepting: Mutex::new(true),
            opened: Condvar::new(),
        }
    }

    pub fn is_accepting(&self) -> bool {
        *self.accepting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn close(&self) {
        *self.accepting.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Opens the gate and wakes every waiter.
    pub fn open(&self) {
        let mut accepting = self.accepting.lock().unwrap_or_else(PoisonError::into_inner);
        *accepting = true;
        self.opened.notify_all();
    }

    /// Blocks while the gate is closed. Returns whether it had to wait.
    pub fn wait_open(&self) -> bool {
        let accepting = self.accepting.lock().unwrap_or_else(PoisonError::into_inner);
        if *accepting {
            return false;
        }
        let _accepting = self
            .opened
            .wait_while(accepting, |accepting| !*accepting)
            .unwrap_or_else(PoisonError::into_inner);
        true
    }
}

/// Background verdict loop for one queue number. There is no way to stop it;
/// it lives until the process exits.
pub struct Interceptor {
    gate: Arc<Gate>,
    _handle: JoinHandle<()>,
}

impl Interceptor {
    /// Opens the queue on the verdict thread and waits for the result, so the
    /// queue handle never crosses threads.
    pub fn spawn<Q, F>(queue_num: u16, open: F) -> Result<Self>
    where
        Q: PacketQueue + 'static,
        F: FnOnce() -> io::Result<Q> + Send + 'static,
    {
        let gate = Arc::new(Gate::new());
        let (ready_tx, ready_rx) = sync_channel(1);

        let loop_gate = Arc::clone(&gate);
        let handle = thread::Builder::new()
            .name(format!("nfq-drain-{}", queue_num))
            .spawn(move || {
                let queue = match open() {
                    Ok(q) => {
                        let _ = ready_tx.send(Ok(()));
                        q
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                verdict_loop(queue, &loop_gate);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(source)) => return Err(DrainError::QueueOpen { queue_num, source }),
            Err(_) => {
                return Err(DrainError::QueueOpen {
                    queue_num,
                    source: io::Error::other("verdict thread exited before opening the queue"),
                });
            }
        }
        info!("Listening on netfilter queue {}", queue_num);

        Ok(Self {
            gate,
            _handle: handle,
        })
    }

    pub fn gate(&self) -> Arc<Gate> {
        Arc::clone(&self.gate)
    }
}

fn verdict_loop<Q: PacketQueue>(mut queue: Q, gate: &Gate) {
    let mut delayed = 0usize;
    let mut last_tick = Instant::now();

    loop {
        match queue.recv_timeout(PACKET_TIMEOUT) {
            Ok(Some(packet)) => {
                let flow = FiveTuple::from(packet.as_ref());
                if !flow.is_syn() {
                    debug!("Queued packet is not a new connection: {}", flow);
                }
                if !gate.is_accepting() {
                    debug!("Holding {}", flow);
                }
                if gate.wait_open() {
                    delayed += 1;
                }
                if let Err(e) = queue.accept(packet) {
                    warn!("Couldn't set verdict: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Couldn't receive from queue: {}", e);
                thread::sleep(PACKET_TIMEOUT);
            }
        }

        if last_tick.elapsed() >= PACKET_TIMEOUT {
            if delayed > 0 {
                info!("Delayed {} packets during reloads", delayed);
                delayed = 0;
            }
            last_tick = Instant::now();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::channel_queue;
    use super::*;
    use crate::five_tuple::syn_packet;

    #[test]
    fn gate_starts_open() {
        let gate = Gate::new();
        assert!(gate.is_accepting());
        assert!(!gate.wait_open());
    }

    #[test]
    fn open_wakes_all_waiters() {
        let gate = Arc::new(Gate::new());
        gate.close();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.wait_open())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        gate.open();

        for w in waiters {
            assert!(w.join().unwrap());
        }
    }

    #[test]
    fn accepts_immediately_while_open() {
        let (queue, handle) = channel_queue();
        let _icpt = Interceptor::spawn(1, move || Ok(queue)).unwrap();

        handle.tx.send(syn_packet([1, 2, 3, 4], [10, 0, 0, 1], 1000, 80)).unwrap();
        assert!(handle.wait_accepted(1, Duration::from_secs(2)));
    }

    #[test]
    fn held_packet_waits_for_open_gate() {
        let (queue, handle) = channel_queue();
        let icpt = Interceptor::spawn(2, move || Ok(queue)).unwrap();
        let gate = icpt.gate();

        gate.close();
        handle.tx.send(syn_packet([1, 2, 3, 4], [10, 0, 0, 1], 1000, 80)).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.accepted_count(), 0);

        let opened_at = Instant::now();
        gate.open();
        assert!(handle.wait_accepted(1, Duration::from_secs(2)));
        assert!(handle.accepted.lock().unwrap()[0].1 >= opened_at);
    }

    #[test]
    fn open_failure_is_reported() {
        let res = Interceptor::spawn::<super::testing::ChannelQueue, _>(3, || {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        });
        assert!(matches!(res, Err(DrainError::QueueOpen { queue_num: 3, .. })));
    }
}

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use log::warn;
use nfq::{Message, Queue, Verdict};

use crate::interceptor::PacketQueue;

/// 只需要 IP + TCP 头
const COPY_RANGE: u16 = 128;
const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct NfqMessage(Message);

impl AsRef<[u8]> for NfqMessage {
    fn as_ref(&self) -> &[u8] {
        self.0.get_payload()
    }
}

impl From<Message> for NfqMessage {
    fn from(value: Message) -> Self {
        Self(value)
    }
}

impl From<NfqMessage> for Message {
    fn from(value: NfqMessage) -> Self {
        value.0
    }
}

/// Kernel queue bound to one queue number, polled non-blocking.
pub struct NfQueue {
    inner: Queue,
}

impl NfQueue {
    pub fn open(queue_num: u16, max_len: u32) -> io::Result<Self> {
        let mut q = Queue::open()?;
        q.bind(queue_num)?;
        q.set_copy_range(queue_num, COPY_RANGE)?;
        q.set_queue_max_len(queue_num, max_len)?;
        q.set_nonblocking(true);
        Ok(Self { inner: q })
    }
}

impl PacketQueue for NfQueue {
    type Packet = NfqMessage;

    fn recv_timeout(&mut self, timeout: Duration) -> io::Result<Option<NfqMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.recv() {
                Ok(msg) => return Ok(Some(NfqMessage::from(msg))),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    warn!("Kernel queue overflowed, some packets were lost");
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn accept(&mut self, packet: NfqMessage) -> io::Result<()> {
        let mut msg: Message = packet.into();
        msg.set_verdict(Verdict::Accept);
        self.inner.verdict(msg)
    }
}

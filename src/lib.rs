//! Holds new TCP connections in a netfilter queue while a reverse proxy reloads.
//!
//! `DrainSession::capture` redirects SYNs for the configured addresses into an
//! NFQUEUE and stops issuing verdicts; `release` removes the redirect and lets
//! every held packet through.

pub mod accounting;
pub mod config;
pub mod error;
pub mod firewall;
pub mod five_tuple;
pub mod interceptor;
pub mod monitor;
pub mod nfq_queue;
pub mod session;

pub use accounting::{PROC_NETFILTER_QUEUE, QueueAccounting, QueueStats};
pub use config::{DrainConfig, parse_addresses};
pub use error::{DrainError, Result};
pub use session::{Drain, DrainSession, SessionState};

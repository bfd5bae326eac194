use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use nfq_drain::config::MAX_PACKETS_IN_QUEUE;
use nfq_drain::monitor::{QueueMonitor, render_table};
use nfq_drain::{
    Drain, DrainConfig, DrainSession, PROC_NETFILTER_QUEUE, QueueAccounting, parse_addresses,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(version, about = "Holds new connections while a reverse proxy reloads")]
struct Args {
    /// Comma separated destination addresses whose new connections are held
    #[arg(long, default_value = "")]
    ips: String,

    /// Netfilter queue number, unique per host
    #[arg(long, default_value_t = 0)]
    queue_num: u16,

    /// Packets the kernel keeps queued before its overflow behaviour applies
    #[arg(long, default_value_t = MAX_PACKETS_IN_QUEUE)]
    max_queue_len: u32,

    #[arg(long, default_value = "iptables")]
    iptables: PathBuf,

    /// Retries for a failed iptables call before giving up
    #[arg(long, default_value_t = 0)]
    rule_retries: u32,

    #[arg(long, default_value = PROC_NETFILTER_QUEUE)]
    stats_path: PathBuf,

    /// Seconds between queue statistics checks, 0 disables them
    #[arg(long, default_value_t = 5)]
    stats_interval: u64,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logger(level: &str) {
    env_logger::Builder::new()
        .parse_filters(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {} - {}: {}",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

fn print_stats(path: &Path) {
    match QueueAccounting::open(path) {
        Ok(acc) => print!("{}", render_table(&acc.snapshot())),
        Err(e) => println!("no queue statistics: {}", e),
    }
}

fn main() {
    let args = Args::parse();
    init_logger(&args.log_level);

    // iptables 和 NFQUEUE 都需要 root
    if unsafe { libc::geteuid() } != 0 {
        warn!("Not running as root, iptables and netfilter queue binding will likely fail");
    }

    let addresses = match parse_addresses(&args.ips) {
        Ok(ips) => ips,
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };

    let mut config = DrainConfig::new(addresses, args.queue_num);
    config.max_queue_len = args.max_queue_len;
    config.iptables = args.iptables.clone();
    config.rule_retries = args.rule_retries;

    let session = match DrainSession::new(&config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Couldn't start drain session: {}", e);
            process::exit(1);
        }
    };

    {
        let session = Arc::clone(&session);
        let handler = ctrlc::set_handler(move || {
            info!("Signal received, releasing held connections");
            if !session.shutdown(SHUTDOWN_TIMEOUT) {
                error!("Redirect rules may still be installed");
            }
            process::exit(0);
        });
        if let Err(e) = handler {
            warn!("Couldn't install signal handler: {}", e);
        }
    }

    if args.stats_interval > 0 && !config.addresses.is_empty() {
        let monitor = QueueMonitor::new(&args.stats_path, args.queue_num);
        if let Err(e) = monitor.spawn(Duration::from_secs(args.stats_interval)) {
            warn!("Couldn't start queue monitor: {}", e);
        }
    }

    info!(
        "Ready on queue {} for {:?}; commands: capture, release, state, stats, quit",
        args.queue_num, config.addresses
    );

    // 一行一个命令，给外部 orchestrator 用
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                error!("Couldn't read command: {}", e);
                break;
            }
        };
        let result = match line.trim() {
            "" => continue,
            "capture" => session.capture(),
            "release" => session.release(),
            "state" => {
                println!("{:?}", session.state());
                Ok(())
            }
            "stats" => {
                print_stats(&args.stats_path);
                Ok(())
            }
            "quit" => break,
            other => {
                warn!("Unknown command {:?}", other);
                Ok(())
            }
        };
        match result {
            Ok(()) => println!("ok"),
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        }
        let _ = io::stdout().flush();
    }

    if !session.shutdown(SHUTDOWN_TIMEOUT) {
        error!("Redirect rules may still be installed");
        process::exit(1);
    }
}

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::Command;

use log::{info, warn};

use crate::error::{DrainError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Add,
    Delete,
}

impl RuleAction {
    fn flag(self) -> &'static str {
        match self {
            RuleAction::Add => "-A",
            RuleAction::Delete => "-D",
        }
    }
}

/// iptables 参数：INPUT 链上把发往 `dst` 的 SYN 重定向进 NFQUEUE
pub fn rule_args(action: RuleAction, dst: Ipv4Addr, queue_num: u16) -> Vec<String> {
    let mut args: Vec<String> = [
        action.flag(),
        "INPUT",
        "-j",
        "NFQUEUE",
        "-w",
        "-p",
        "tcp",
        "--syn",
        "--destination",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(dst.to_string());
    args.push("--queue-num".to_string());
    args.push(queue_num.to_string());
    args
}

pub trait RuleRunner: Send {
    fn run(&self, args: &[String]) -> Result<()>;
}

pub struct Iptables {
    binary: PathBuf,
}

impl Iptables {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl RuleRunner for Iptables {
    fn run(&self, args: &[String]) -> Result<()> {
        let command = format!("{} {}", self.binary.display(), args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| DrainError::Firewall {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(DrainError::Firewall {
                command,
                reason: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

// ==========================================
// 规则集：记住哪些地址已经装上，重试和删除都是幂等的
// ==========================================
pub struct RuleSet {
    targets: Vec<Ipv4Addr>,
    queue_num: u16,
    installed: Vec<Ipv4Addr>,
    runner: Box<dyn RuleRunner>,
}

impl RuleSet {
    pub fn new(addresses: &[IpAddr], queue_num: u16, runner: Box<dyn RuleRunner>) -> Self {
        let mut targets = Vec::with_capacity(addresses.len());
        for addr in addresses {
            match addr {
                IpAddr::V4(v4) if !targets.contains(v4) => targets.push(*v4),
                IpAddr::V4(_) => {}
                IpAddr::V6(v6) => {
                    warn!("Only IPv4 addresses supported, skipping {}", v6);
                }
            }
        }
        Self {
            targets,
            queue_num,
            installed: Vec::new(),
            runner,
        }
    }

    pub fn installed(&self) -> &[Ipv4Addr] {
        &self.installed
    }

    /// Adds a rule for every target that does not have one yet. Not
    /// transactional: on failure the addresses before the failing one stay
    /// redirected and are tracked in `installed`.
    pub fn install(&mut self) -> Result<()> {
        let mut added = 0;
        for &dst in &self.targets {
            if self.installed.contains(&dst) {
                continue;
            }
            self.runner
                .run(&rule_args(RuleAction::Add, dst, self.queue_num))?;
            self.installed.push(dst);
            added += 1;
        }
        if added > 0 {
            info!(
                "Redirecting SYNs for {:?} to queue {}",
                self.installed, self.queue_num
            );
        }
        Ok(())
    }

    /// Deletes every installed rule. A failed delete stays tracked so a retry
    /// only touches what is left.
    pub fn remove(&mut self) -> Result<()> {
        if self.installed.is_empty() {
            return Ok(());
        }
        while let Some(&dst) = self.installed.first() {
            self.runner
                .run(&rule_args(RuleAction::Delete, dst, self.queue_num))?;
            self.installed.remove(0);
        }
        info!("Removed SYN redirect rules for queue {}", self.queue_num);
        Ok(())
    }

    /// Guard over the installed rules; they are removed when it drops.
    pub fn guard(&mut self) -> RuleGuard<'_> {
        RuleGuard { rules: Some(self) }
    }
}

pub struct RuleGuard<'a> {
    rules: Option<&'a mut RuleSet>,
}

impl RuleGuard<'_> {
    /// Removes the rules now so the caller sees the error. Whatever failed to
    /// go stays in the rule set for a retry.
    pub fn release(mut self) -> Result<()> {
        match self.rules.take() {
            Some(rules) => rules.remove(),
            None => Ok(()),
        }
    }
}

impl Drop for RuleGuard<'_> {
    fn drop(&mut self) {
        if let Some(rules) = self.rules.take() {
            if let Err(e) = rules.remove() {
                log::error!("Couldn't remove redirect rules: {}", e);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingRunner;
    use super::*;

    fn addrs(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn rule_args_match_iptables_syntax() {
        let args = rule_args(RuleAction::Add, Ipv4Addr::new(10, 0, 0, 1), 100);
        assert_eq!(
            args.join(" "),
            "-A INPUT -j NFQUEUE -w -p tcp --syn --destination 10.0.0.1 --queue-num 100"
        );
        assert_eq!(
            rule_args(RuleAction::Delete, Ipv4Addr::new(10, 0, 0, 1), 100)[0],
            "-D"
        );
    }

    #[test]
    fn install_and_remove_one_rule_per_address() {
        let runner = RecordingRunner::default();
        let mut rules = RuleSet::new(
            &addrs(&["10.0.0.1", "10.0.0.2"]),
            100,
            Box::new(runner.clone()),
        );

        rules.install().unwrap();
        rules.remove().unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], rule_args(RuleAction::Add, Ipv4Addr::new(10, 0, 0, 1), 100));
        assert_eq!(calls[1], rule_args(RuleAction::Add, Ipv4Addr::new(10, 0, 0, 2), 100));
        assert_eq!(calls[2], rule_args(RuleAction::Delete, Ipv4Addr::new(10, 0, 0, 1), 100));
        assert_eq!(calls[3], rule_args(RuleAction::Delete, Ipv4Addr::new(10, 0, 0, 2), 100));
        assert!(rules.installed().is_empty());
    }

    #[test]
    fn ipv6_is_skipped() {
        let runner = RecordingRunner::default();
        let mut rules = RuleSet::new(&addrs(&["::1", "10.0.0.3"]), 5, Box::new(runner.clone()));

        rules.install().unwrap();
        assert_eq!(runner.calls().len(), 1);
        assert_eq!(rules.installed(), &[Ipv4Addr::new(10, 0, 0, 3)]);
    }

    #[test]
    fn retry_after_partial_install_skips_installed() {
        let runner = RecordingRunner::default();
        runner.fail_on.lock().unwrap().push(1);
        let mut rules = RuleSet::new(
            &addrs(&["10.0.0.1", "10.0.0.2"]),
            100,
            Box::new(runner.clone()),
        );

        assert!(rules.install().is_err());
        assert_eq!(rules.installed(), &[Ipv4Addr::new(10, 0, 0, 1)]);

        rules.install().unwrap();
        let adds: Vec<String> = runner.calls().iter().map(|c| c[9].clone()).collect();
        assert_eq!(adds, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn failed_remove_keeps_remaining_rules() {
        let runner = RecordingRunner::default();
        runner.fail_on.lock().unwrap().push(3);
        let mut rules = RuleSet::new(
            &addrs(&["10.0.0.1", "10.0.0.2"]),
            100,
            Box::new(runner.clone()),
        );
        rules.install().unwrap();

        assert!(rules.remove().is_err());
        assert_eq!(rules.installed(), &[Ipv4Addr::new(10, 0, 0, 2)]);
        rules.remove().unwrap();
        assert!(rules.installed().is_empty());
        assert_eq!(runner.calls().len(), 4);
    }

    #[test]
    fn guard_removes_on_drop() {
        let runner = RecordingRunner::default();
        let mut rules = RuleSet::new(&addrs(&["10.0.0.1"]), 9, Box::new(runner.clone()));
        rules.install().unwrap();
        {
            let _guard = rules.guard();
        }
        assert!(rules.installed().is_empty());
        assert_eq!(runner.calls()[1][0], "-D");
    }
}

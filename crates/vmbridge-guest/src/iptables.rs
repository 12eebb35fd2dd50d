//! iptables DNAT rule scanner.
//!
//! Container runtimes that publish ports through the CNI portmap plugin do
//! not open listening sockets; they install DNAT rules in the `nat` table.
//! This scanner shells out to `iptables -t nat -S`, keeps the portmap rules
//! (`CNI-DN-*` chains jumping to `DNAT`), and reports them as listening
//! endpoints. TCP rules are verified with a short connect probe so that
//! stale rules do not resurface as phantom ports; UDP cannot be probed and
//! passes through.
//!
//! Shelling out on every tick is wasteful when nothing changed, so the
//! scanner is auditing-aware: when the audit watcher (see [`crate::audit`])
//! is running, a scan only happens after a netfilter configuration change
//! was observed, and the gate closes again after an idle window.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::process::Command;

use vmbridge_common::constants::IPTABLES_IDLE_TICKS;
use vmbridge_common::types::{IpPort, Protocol};

/// Connect-probe budget per TCP rule.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// One parsed portmap DNAT rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnatRule {
    /// Destination IP of the rule, unspecified when the rule has no `-d`.
    pub ip: IpAddr,
    /// Destination port.
    pub port: u16,
    /// Rule protocol.
    pub protocol: Protocol,
}

impl DnatRule {
    /// Endpoint form of the rule.
    #[must_use]
    pub const fn endpoint(self) -> IpPort {
        IpPort::new(self.ip, self.port, self.protocol)
    }
}

/// Parses `iptables -t nat -S` output, keeping only CNI portmap DNAT
/// rules.
#[must_use]
pub fn parse_dnat_rules(output: &str) -> Vec<DnatRule> {
    let mut rules = Vec::new();
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(add_pos) = tokens.iter().position(|t| *t == "-A") else {
            continue;
        };
        let Some(chain) = tokens.get(add_pos + 1) else { continue };
        if !chain.starts_with("CNI-DN-") {
            continue;
        }

        let mut ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let mut port = None;
        let mut protocol = None;
        let mut is_dnat = false;

        let mut iter = tokens.iter();
        while let Some(token) = iter.next() {
            match *token {
                "-d" => {
                    if let Some(value) = iter.next() {
                        let bare = value.split('/').next().unwrap_or(value);
                        if let Ok(parsed) = bare.parse() {
                            ip = parsed;
                        }
                    }
                }
                "-p" => {
                    if let Some(value) = iter.next() {
                        protocol = value.parse::<Protocol>().ok();
                    }
                }
                "--dport" => {
                    if let Some(value) = iter.next() {
                        port = value.parse::<u16>().ok();
                    }
                }
                "-j" => {
                    is_dnat = iter.next().is_some_and(|v| *v == "DNAT");
                }
                _ => {}
            }
        }

        if let (true, Some(port), Some(protocol)) = (is_dnat, port, protocol) {
            rules.push(DnatRule { ip, port, protocol });
        }
    }
    rules
}

#[derive(Debug)]
struct Gate {
    worth_checking: bool,
    last_change: Instant,
}

/// Auditing-aware iptables scanner with a cached last result.
#[derive(Debug)]
pub struct IptablesScanner {
    iptables: Option<PathBuf>,
    gate: RwLock<Gate>,
    latest: RwLock<Vec<IpPort>>,
    audit_active: RwLock<bool>,
    idle_window: Duration,
}

impl IptablesScanner {
    /// Creates a scanner for the given tick interval. The idle window is
    /// [`IPTABLES_IDLE_TICKS`] ticks.
    #[must_use]
    pub fn new(tick: Duration) -> Self {
        let iptables = which::which("iptables").ok();
        if iptables.is_none() {
            tracing::info!("iptables not found; DNAT scanning disabled");
        }
        Self {
            iptables,
            gate: RwLock::new(Gate { worth_checking: true, last_change: Instant::now() }),
            latest: RwLock::new(Vec::new()),
            audit_active: RwLock::new(false),
            idle_window: tick * IPTABLES_IDLE_TICKS,
        }
    }

    /// A scanner that never shells out, for guests without iptables and
    /// for tests.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            iptables: None,
            gate: RwLock::new(Gate { worth_checking: false, last_change: Instant::now() }),
            latest: RwLock::new(Vec::new()),
            audit_active: RwLock::new(false),
            idle_window: Duration::from_secs(60),
        }
    }

    /// Marks that the audit watcher is feeding this scanner; from now on
    /// scans are gated on netfilter changes.
    pub fn set_audit_active(&self) {
        if let Ok(mut active) = self.audit_active.write() {
            *active = true;
        }
    }

    /// Records a netfilter configuration change seen by the audit watcher.
    pub fn note_netfilter_change(&self) {
        if let Ok(mut gate) = self.gate.write() {
            gate.worth_checking = true;
            gate.last_change = Instant::now();
        }
    }

    fn should_scan(&self) -> bool {
        let audit_active = self.audit_active.read().map(|a| *a).unwrap_or(false);
        if !audit_active {
            return true;
        }
        let Ok(mut gate) = self.gate.write() else { return true };
        if gate.worth_checking && gate.last_change.elapsed() > self.idle_window {
            gate.worth_checking = false;
        }
        gate.worth_checking
    }

    /// Returns the current DNAT-published endpoints, either freshly
    /// scanned or the cached result when the gate is closed.
    pub async fn scan(&self) -> Vec<IpPort> {
        let Some(iptables) = self.iptables.clone() else {
            return Vec::new();
        };
        if !self.should_scan() {
            return self.latest.read().map(|l| l.clone()).unwrap_or_default();
        }

        let output = match Command::new(&iptables)
            .args(["-t", "nat", "-S"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
        {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).into_owned(),
            Ok(out) => {
                tracing::warn!(status = ?out.status, "iptables -t nat -S failed");
                return self.latest.read().map(|l| l.clone()).unwrap_or_default();
            }
            Err(e) => {
                tracing::warn!(error = %e, "spawning iptables failed");
                return self.latest.read().map(|l| l.clone()).unwrap_or_default();
            }
        };

        let endpoints = probe_rules(parse_dnat_rules(&output)).await;
        if let Ok(mut latest) = self.latest.write() {
            latest.clone_from(&endpoints);
        }
        endpoints
    }
}

/// Keeps UDP rules as-is and TCP rules that answer a connect probe within
/// one second.
async fn probe_rules(rules: Vec<DnatRule>) -> Vec<IpPort> {
    let probes = rules.into_iter().map(|rule| async move {
        match rule.protocol {
            Protocol::Udp => Some(rule.endpoint()),
            Protocol::Tcp => {
                let probe_ip = if rule.ip.is_unspecified() {
                    IpAddr::V4(Ipv4Addr::LOCALHOST)
                } else {
                    rule.ip
                };
                let attempt =
                    tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((probe_ip, rule.port)))
                        .await;
                match attempt {
                    Ok(Ok(_)) => Some(rule.endpoint()),
                    _ => {
                        tracing::debug!(rule = %rule.endpoint(), "DNAT rule did not answer probe");
                        None
                    }
                }
            }
        }
    });
    futures::future::join_all(probes)
        .await
        .into_iter()
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const SAMPLE: &str = "\
-P PREROUTING ACCEPT
-N CNI-DN-1a2b3c4d5e6f
-N CNI-HOSTPORT-DNAT
-A PREROUTING -m addrtype --dst-type LOCAL -j CNI-HOSTPORT-DNAT
-A CNI-DN-1a2b3c4d5e6f -d 10.4.0.5/32 -p tcp -m tcp --dport 8080 -j DNAT --to-destination 10.4.0.2:80
-A CNI-DN-1a2b3c4d5e6f -p udp -m udp --dport 5353 -j DNAT --to-destination 10.4.0.2:5353
-A CNI-DN-1a2b3c4d5e6f -p tcp -m tcp --dport 9090 -j MARK --set-xmark 0x2000/0x2000
-A POSTROUTING -s 10.4.0.0/16 -j MASQUERADE
";

    #[test]
    fn only_cni_dnat_rules_are_kept() {
        let rules = parse_dnat_rules(SAMPLE);
        assert_eq!(rules.len(), 2);

        assert_eq!(rules[0].ip, "10.4.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(rules[0].port, 8080);
        assert_eq!(rules[0].protocol, Protocol::Tcp);

        assert!(rules[1].ip.is_unspecified());
        assert_eq!(rules[1].port, 5353);
        assert_eq!(rules[1].protocol, Protocol::Udp);
    }

    #[test]
    fn rules_without_dport_or_dnat_are_dropped() {
        let output = "-A CNI-DN-feedface -p tcp -j DNAT\n-A CNI-DN-feedface -p tcp --dport 80 -j ACCEPT\n";
        assert!(parse_dnat_rules(output).is_empty());
    }

    #[tokio::test]
    async fn udp_rules_pass_probe_unfiltered() {
        let rules = vec![DnatRule {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 5353,
            protocol: Protocol::Udp,
        }];
        let endpoints = probe_rules(rules).await;
        assert_eq!(endpoints.len(), 1);
    }

    #[tokio::test]
    async fn dead_tcp_rules_are_filtered_by_probe() {
        // Port 1 on loopback is almost certainly closed; the probe fails
        // fast with ECONNREFUSED.
        let rules = vec![DnatRule {
            ip: "127.0.0.1".parse().unwrap(),
            port: 1,
            protocol: Protocol::Tcp,
        }];
        let endpoints = probe_rules(rules).await;
        assert!(endpoints.is_empty());
    }

    #[tokio::test]
    async fn live_tcp_rules_survive_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let rules = vec![DnatRule {
            ip: "127.0.0.1".parse().unwrap(),
            port,
            protocol: Protocol::Tcp,
        }];
        let endpoints = probe_rules(rules).await;
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].port, port);
    }

    #[test]
    fn gate_closes_after_idle_window() {
        let scanner = IptablesScanner::new(Duration::from_millis(1));
        scanner.set_audit_active();
        scanner.note_netfilter_change();
        assert!(scanner.should_scan());

        std::thread::sleep(Duration::from_millis(50));
        // Idle window of 20 ticks at 1 ms has passed.
        assert!(!scanner.should_scan());

        scanner.note_netfilter_change();
        assert!(scanner.should_scan());
    }

    #[test]
    fn without_audit_every_tick_scans() {
        let scanner = IptablesScanner::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(scanner.should_scan());
    }
}

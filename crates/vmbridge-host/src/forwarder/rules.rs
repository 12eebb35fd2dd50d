//! Rule matching for observed guest endpoints.
//!
//! Rules are ordered and the first match wins. Guest port 22 and any
//! forward that would land on the instance's own SSH port are blocked
//! unconditionally; SSH reachability is provided by a static forward,
//! never by events.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use vmbridge_common::instance::{PortRange, PortRule};
use vmbridge_common::types::{IpPort, Protocol};

/// What the ruleset says about one added endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatch {
    /// No forward: an ignore rule matched, the port is blocked, or no
    /// rule matched at all.
    Ignore,
    /// Install a forward.
    Forward(ForwardPlan),
}

/// A planned forward for one guest endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardPlan {
    /// The guest endpoint being forwarded.
    pub guest: IpPort,
    /// Host IP to bind.
    pub host_ip: IpAddr,
    /// Host port to bind.
    pub host_port: u16,
    /// Forward direction is guest-listen, host-dial.
    pub reverse: bool,
}

impl ForwardPlan {
    /// `ip:port` form of the host side.
    #[must_use]
    pub fn local_addr(&self) -> String {
        match self.host_ip {
            IpAddr::V4(ip) => format!("{ip}:{}", self.host_port),
            IpAddr::V6(ip) => format!("[{ip}]:{}", self.host_port),
        }
    }
}

/// Computes the host address a rule maps a guest endpoint to:
/// `host.port = guest.port + host_range.lo − guest_range.lo`.
#[must_use]
pub fn host_address(rule: &PortRule, guest: &IpPort) -> (IpAddr, u16) {
    let offset = i32::from(guest.port) - i32::from(rule.guest_range.lo);
    let port = i32::from(rule.host_range.lo) + offset;
    (rule.host_ip, u16::try_from(port).unwrap_or(guest.port))
}

fn ip_matches(rule: &PortRule, guest_ip: IpAddr) -> bool {
    if rule.must_be_zero {
        // Only an exactly-unspecified bind qualifies.
        return guest_ip.is_unspecified();
    }
    match rule.guest_ip {
        Some(rule_ip) => {
            guest_ip == rule_ip
                || guest_ip.is_unspecified()
                // An IPv6 loopback listener answers IPv4 loopback rules.
                || (guest_ip == IpAddr::V6(Ipv6Addr::LOCALHOST)
                    && rule_ip == IpAddr::V4(Ipv4Addr::LOCALHOST))
        }
        None => true,
    }
}

fn rule_matches(rule: &PortRule, guest: &IpPort) -> bool {
    rule.guest_socket.is_none()
        && rule.proto == guest.protocol
        && rule.guest_range.contains(guest.port)
        && ip_matches(rule, guest.ip)
}

/// Finds the first matching rule and plans the forward.
///
/// `ssh_local_port` is the instance's own SSH port on the host; forwards
/// may never collide with it.
#[must_use]
pub fn match_rules(rules: &[PortRule], guest: &IpPort, ssh_local_port: u16) -> RuleMatch {
    if guest.port == 22 {
        return RuleMatch::Ignore;
    }

    for rule in rules {
        if !rule_matches(rule, guest) {
            continue;
        }
        if rule.ignore {
            tracing::debug!(endpoint = %guest, "endpoint ignored by rule");
            return RuleMatch::Ignore;
        }
        let (host_ip, host_port) = host_address(rule, guest);
        if host_port == ssh_local_port {
            tracing::debug!(endpoint = %guest, "forward would shadow the ssh port");
            return RuleMatch::Ignore;
        }
        return RuleMatch::Forward(ForwardPlan {
            guest: *guest,
            host_ip,
            host_port,
            reverse: rule.reverse,
        });
    }
    RuleMatch::Ignore
}

/// Appends the sentinel rules that make loopback-only forwarding the
/// default: without any user rule, a guest listener on a loopback or
/// unspecified address forwards to the same port on the host loopback,
/// and nothing else matches.
#[must_use]
pub fn with_default_rules(mut rules: Vec<PortRule>) -> Vec<PortRule> {
    for proto in [Protocol::Tcp, Protocol::Udp] {
        rules.push(PortRule {
            guest_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            guest_range: PortRange::all(),
            guest_socket: None,
            host_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            host_range: PortRange::all(),
            host_socket: None,
            proto,
            reverse: false,
            ignore: false,
            static_: false,
            must_be_zero: false,
        });
    }
    rules
}

/// True when a rule disables all event-driven forwarding for its
/// protocol: an ignore rule covering the whole port space.
#[must_use]
pub fn disables_protocol(rule: &PortRule) -> bool {
    rule.ignore && rule.guest_range == PortRange::all()
}

//! Runtime rule mutators: UPnP port mappings, the DNS egress allowlist and
//! time-scheduled rule overlays. All of them funnel through the rule-set
//! manager; none touches the base configuration.

use serde::{Deserialize, Serialize};

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::compile::{DNS_ALLOWED_V4, DNS_ALLOWED_V6};
use crate::config::{NatKind, NatRule, ScheduledRule};
use crate::error::ApplyOutcome;
use crate::ipset::IpSetManager;
use crate::manager::RuleSetManager;
use crate::Error;

/// A validated UPnP port-mapping request (SOAP/SSDP parsing happens
/// upstream; only the sanitized result reaches the core).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    pub external_port: u16,
    pub internal_ip: Ipv4Addr,
    pub internal_port: u16,
    /// `tcp` or `udp`.
    pub protocol: String,
    pub description: Option<String>,
}

impl PortMapping {
    fn to_nat_rule(&self, wan_interface: &str) -> NatRule {
        NatRule {
            kind: NatKind::Dnat,
            in_interface: Some(wan_interface.to_string()),
            protocol: Some(self.protocol.clone()),
            dest_port: Some(self.external_port.to_string()),
            to_ip: Some(self.internal_ip.to_string()),
            to_port: Some(self.internal_port),
            ..Default::default()
        }
    }
}

/// Install a UPnP mapping as a dynamic DNAT rule.
pub async fn add_port_mapping(
    manager: &RuleSetManager,
    wan_interface: &str,
    mapping: &PortMapping,
) -> Result<ApplyOutcome, Error> {
    manager.add_dynamic_nat(mapping.to_nat_rule(wan_interface)).await
}

/// Retract a previously installed UPnP mapping.
pub async fn remove_port_mapping(
    manager: &RuleSetManager,
    wan_interface: &str,
    mapping: &PortMapping,
) -> Result<ApplyOutcome, Error> {
    let wanted = mapping.to_nat_rule(wan_interface);
    manager.remove_dynamic_nat(|rule| *rule == wanted).await
}

/// Authorize a resolved address for DNS-egress-controlled forwarding. The
/// element carries a kernel-side timeout, so expiry needs no bookkeeping.
pub async fn authorize_ip(ipsets: &IpSetManager, address: IpAddr, ttl: Duration) -> Result<(), Error> {
    let set = match address {
        IpAddr::V4(_) => DNS_ALLOWED_V4,
        IpAddr::V6(_) => DNS_ALLOWED_V6,
    };
    ipsets
        .add_elements_with_timeout(set, &[address.to_string()], ttl)
        .await
        .map_err(|e| Error::Apply {
            detail: format!("dns allowlist update failed: {e}"),
        })
}

/// Activation window for a scheduled overlay, local to the router clock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// `HH:MM`.
    pub start: String,
    pub end: String,
    /// Empty means every day.
    pub days: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ScheduledEntry {
    pub rule: ScheduledRule,
    pub schedule: Schedule,
}

impl From<&crate::config::ScheduledPolicy> for ScheduledEntry {
    fn from(configured: &crate::config::ScheduledPolicy) -> Self {
        ScheduledEntry {
            rule: ScheduledRule {
                name: configured.name.clone(),
                policy: configured.policy.clone(),
            },
            schedule: Schedule {
                start: configured.start.clone(),
                end: configured.end.clone(),
                days: configured.days.clone(),
            },
        }
    }
}

/// Evaluates schedules and toggles the overlays through the manager.
pub struct Scheduler {
    manager: Arc<RuleSetManager>,
    entries: Vec<ScheduledEntry>,
    check_interval: Duration,
}

impl Scheduler {
    pub fn new(manager: Arc<RuleSetManager>, entries: Vec<ScheduledEntry>) -> Self {
        Scheduler {
            manager,
            entries,
            check_interval: Duration::from_secs(30),
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            // None until first evaluation so the initial state gets applied
            let mut active: Vec<Option<bool>> = vec![None; self.entries.len()];
            let mut ticker = tokio::time::interval(self.check_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = now_epoch();
                        for (entry, state) in self.entries.iter().zip(active.iter_mut()) {
                            let wanted = window_active(&entry.schedule, now);
                            if *state == Some(wanted) {
                                continue;
                            }
                            match self.manager.apply_scheduled(entry.rule.clone(), wanted).await {
                                Ok(_) => {
                                    tracing::info!(rule = %entry.rule.name, enabled = wanted, "scheduled rule toggled");
                                    *state = Some(wanted);
                                }
                                Err(error) => {
                                    tracing::warn!(rule = %entry.rule.name, error = %error, "scheduled toggle failed");
                                }
                            }
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        })
    }
}

const DAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// Pure window check against an epoch timestamp (UTC). Overnight windows
/// (`22:00`-`06:00`) wrap across midnight.
pub fn window_active(schedule: &Schedule, epoch_secs: u64) -> bool {
    let Some(start) = parse_minutes(&schedule.start) else {
        return false;
    };
    let Some(end) = parse_minutes(&schedule.end) else {
        return false;
    };

    let minutes_of_day = (epoch_secs % 86400) / 60;
    let in_window = if start <= end {
        minutes_of_day >= start && minutes_of_day < end
    } else {
        minutes_of_day >= start || minutes_of_day < end
    };
    if !in_window {
        return false;
    }

    if schedule.days.is_empty() {
        return true;
    }
    // 1970-01-01 was a Thursday
    let day_index = ((epoch_secs / 86400 + 3) % 7) as usize;
    schedule.days.iter().any(|d| d == DAY_NAMES[day_index])
}

fn parse_minutes(time: &str) -> Option<u64> {
    let (h, m) = time.split_once(':')?;
    let h: u64 = h.parse().ok()?;
    let m: u64 = m.parse().ok()?;
    if h < 24 && m < 60 {
        Some(h * 60 + m)
    } else {
        None
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(start: &str, end: &str, days: &[&str]) -> Schedule {
        Schedule {
            start: start.to_string(),
            end: end.to_string(),
            days: days.iter().map(|d| d.to_string()).collect(),
        }
    }

    // 2021-04-05 was a Monday; 00:00 UTC epoch
    const MONDAY: u64 = 1617580800;

    #[test]
    fn plain_window() {
        let s = schedule("09:00", "17:00", &[]);
        assert!(!window_active(&s, MONDAY + 8 * 3600));
        assert!(window_active(&s, MONDAY + 9 * 3600));
        assert!(window_active(&s, MONDAY + 16 * 3600 + 59 * 60));
        assert!(!window_active(&s, MONDAY + 17 * 3600));
    }

    #[test]
    fn overnight_window_wraps() {
        let s = schedule("22:00", "06:00", &[]);
        assert!(window_active(&s, MONDAY + 23 * 3600));
        assert!(window_active(&s, MONDAY + 5 * 3600));
        assert!(!window_active(&s, MONDAY + 12 * 3600));
    }

    #[test]
    fn day_filter() {
        let s = schedule("00:00", "23:59", &["mon", "wed"]);
        assert!(window_active(&s, MONDAY + 3600));
        assert!(!window_active(&s, MONDAY + 86400 + 3600)); // tuesday
        assert!(window_active(&s, MONDAY + 2 * 86400 + 3600)); // wednesday
    }

    #[test]
    fn port_mapping_to_nat_rule() {
        let mapping = PortMapping {
            external_port: 25565,
            internal_ip: Ipv4Addr::new(192, 168, 1, 50),
            internal_port: 25565,
            protocol: "tcp".to_string(),
            description: Some("game server".to_string()),
        };
        let rule = mapping.to_nat_rule("eth0");
        assert_eq!(rule.kind, NatKind::Dnat);
        assert_eq!(rule.in_interface.as_deref(), Some("eth0"));
        assert_eq!(rule.to_ip.as_deref(), Some("192.168.1.50"));
        assert_eq!(rule.to_port, Some(25565));
    }
}

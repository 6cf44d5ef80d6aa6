//! Policy-rule expression compilation.
//!
//! The clause order is fixed: protocol, source address/set, destination
//! address/set, connection state, GeoIP, time window, days, port, log
//! clauses, counter, action, comment. Reordering would change compiled
//! output byte-for-byte, which the determinism contract forbids.

use crate::config::{PolicyRule, RuleAction};
use crate::script::quoted;
use crate::Error;

use super::compile_error;

const CT_STATES: &[&str] = &["new", "established", "related", "invalid"];
const DAYS: &[&str] = &["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// Compile one policy rule into an nft expression, without the comment.
/// `log_prefix` names the policy for the rate-limited drop/reject log.
pub fn policy_rule_expr(rule: &PolicyRule, log_prefix: &str) -> Result<String, Error> {
    let mut parts: Vec<String> = Vec::new();

    let proto = effective_protocol(rule)?;
    if let (Some(proto), true) = (&proto, rule.protocol.as_deref().is_some_and(|p| p != "any")) {
        parts.push(format!("meta l4proto {proto}"));
    }

    if let Some(ip) = &rule.source_ip {
        parts.push(format!("{} saddr {}", addr_family(ip), ip));
    }
    if let Some(set) = &rule.src_ipset {
        parts.push(format!("ip saddr @{set}"));
    }
    if let Some(ip) = &rule.dest_ip {
        parts.push(format!("{} daddr {}", addr_family(ip), ip));
    }
    if let Some(set) = &rule.dest_ipset {
        parts.push(format!("ip daddr @{set}"));
    }

    if !rule.conn_state.is_empty() {
        for state in &rule.conn_state {
            if !CT_STATES.contains(&state.as_str()) {
                return Err(compile_error("policy-rule", format!("unknown ct state `{state}`")));
            }
        }
        parts.push(format!("ct state {}", rule.conn_state.join(",")));
    }

    if let Some(cc) = &rule.geoip_src {
        parts.push(format!("ip saddr @geoip_country_{cc}"));
    }
    if let Some(cc) = &rule.geoip_dest {
        parts.push(format!("ip daddr @geoip_country_{cc}"));
    }

    match (&rule.time_start, &rule.time_end) {
        (Some(start), Some(end)) => {
            parts.push(format!("meta hour >= {} meta hour < {}", to_seconds(start)?, to_seconds(end)?));
        }
        (None, None) => {}
        _ => {
            return Err(compile_error("policy-rule", "time window needs both time_start and time_end"));
        }
    }

    if !rule.days.is_empty() {
        for day in &rule.days {
            if !DAYS.contains(&day.as_str()) {
                return Err(compile_error("policy-rule", format!("unknown day `{day}`")));
            }
        }
        parts.push(format!("meta day {{ {} }}", rule.days.join(", ")));
    }

    if let Some(port) = &rule.dest_port {
        let proto = proto.as_deref().unwrap_or("tcp");
        if proto == "icmp" || proto == "icmpv6" {
            return Err(compile_error("policy-rule", "port match on an ICMP rule"));
        }
        parts.push(format!("{proto} dport {port}"));
    }

    parts.push(action_expr(rule.action, rule.counter.as_deref(), log_prefix));

    Ok(parts.join(" "))
}

/// Protocol of the rule; a port with no protocol defaults to tcp.
fn effective_protocol(rule: &PolicyRule) -> Result<Option<String>, Error> {
    match rule.protocol.as_deref() {
        None | Some("any") => {
            if rule.dest_port.is_some() {
                Ok(Some("tcp".to_string()))
            } else {
                Ok(None)
            }
        }
        Some(proto @ ("tcp" | "udp" | "icmp" | "icmpv6")) => Ok(Some(proto.to_string())),
        Some(other) => Err(compile_error("policy-rule", format!("unknown protocol `{other}`"))),
    }
}

fn addr_family(addr: &str) -> &'static str {
    if addr.contains(':') { "ip6" } else { "ip" }
}

/// Counter plus verdict; drop and reject carry a rate-limited log. Packets
/// beyond the limit fall through to the chain's terminal rule or policy.
pub fn action_expr(action: RuleAction, counter: Option<&str>, log_prefix: &str) -> String {
    let counter = match counter {
        Some(name) => format!("counter name {name}"),
        None => "counter".to_string(),
    };
    match action {
        RuleAction::Accept => format!("{counter} accept"),
        RuleAction::Drop => format!(
            "limit rate 10/second burst 50 packets log prefix {} group {} {} drop",
            quoted(&format!("{log_prefix}: ")),
            super::LOG_GROUP_DROP,
            counter
        ),
        RuleAction::Reject => format!(
            "limit rate 10/second burst 50 packets log prefix {} group {} {} reject",
            quoted(&format!("{log_prefix}: ")),
            super::LOG_GROUP_DROP,
            counter
        ),
    }
}

/// Lower `HH:MM` to `HH:MM:SS`; pass `HH:MM:SS` through.
fn to_seconds(time: &str) -> Result<String, Error> {
    let fields: Vec<&str> = time.split(':').collect();
    let ok = |h: &str, m: &str, s: &str| {
        h.parse::<u8>().map(|h| h < 24).unwrap_or(false)
            && m.parse::<u8>().map(|m| m < 60).unwrap_or(false)
            && s.parse::<u8>().map(|s| s < 60).unwrap_or(false)
    };
    match fields.as_slice() {
        [h, m] if ok(h, m, "0") => Ok(format!("{h}:{m}:00")),
        [h, m, s] if ok(h, m, s) => Ok(time.to_string()),
        _ => Err(compile_error("policy-rule", format!("invalid time `{time}`"))),
    }
}

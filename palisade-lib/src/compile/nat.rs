//! NAT compilation: `ip nat` table, plus an `ip6 nat6` table when any
//! policy qualifies for IPv6 masquerading.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::config::{Config, NatKind, NatRule, Policy};
use crate::script::{quoted, ChainSpec, Family, Script, ScriptBuilder};
use crate::zones;
use crate::Error;

use super::{compile_error, NAT6_TABLE, NAT_TABLE};

const CHAIN_PREROUTING: &str = "prerouting";
const CHAIN_POSTROUTING: &str = "postrouting";

type ZoneMap = std::collections::BTreeMap<String, Vec<String>>;

pub fn compile(config: &Config, zone_map: &ZoneMap) -> Result<(Script, Option<Script>), Error> {
    let mut b = ScriptBuilder::new(Family::Ip, NAT_TABLE);
    b.table(None);
    b.chain(
        CHAIN_PREROUTING,
        &ChainSpec {
            chain_type: "nat",
            hook: "prerouting",
            priority: -100,
            policy: "accept",
        },
    );
    b.chain(
        CHAIN_POSTROUTING,
        &ChainSpec {
            chain_type: "nat",
            hook: "postrouting",
            priority: 100,
            policy: "accept",
        },
    );

    // one masquerade per out-interface, however many rules or policies ask
    let mut masqueraded: BTreeSet<String> = BTreeSet::new();

    for rule in &config.nat {
        match rule.kind {
            NatKind::Dnat => dnat(&mut b, config, zone_map, rule)?,
            NatKind::Masquerade => {
                for iface in expand(zone_map, rule.out_interface.as_deref()) {
                    masqueraded.insert(iface);
                }
            }
            NatKind::Snat => snat(&mut b, zone_map, rule)?,
        }
    }

    // policy-derived auto-masquerade
    let candidates = masquerade_candidates(config, zone_map);
    for policy in &candidates {
        for to_zone in zones::expand_glob(&policy.to, zone_map) {
            for iface in zone_map.get(&to_zone).map(Vec::as_slice).unwrap_or(&[]) {
                masqueraded.insert(iface.clone());
            }
        }
    }

    for iface in &masqueraded {
        b.rule(CHAIN_POSTROUTING, &format!("oifname {} masquerade", quoted(iface)));
    }

    let nat6 = if candidates.is_empty() {
        None
    } else {
        let mut b6 = ScriptBuilder::new(Family::Ip6, NAT6_TABLE);
        b6.table(None);
        b6.chain(
            CHAIN_POSTROUTING,
            &ChainSpec {
                chain_type: "nat",
                hook: "postrouting",
                priority: 100,
                policy: "accept",
            },
        );
        for iface in &masqueraded {
            b6.rule(CHAIN_POSTROUTING, &format!("oifname {} masquerade", quoted(iface)));
        }
        Some(b6.build())
    };

    Ok((b.build(), nat6))
}

/// Interface list for a NAT endpoint that may name a zone. Unknown names
/// pass through untouched so externally-managed links still work.
fn expand(zone_map: &ZoneMap, name: Option<&str>) -> Vec<String> {
    match name {
        None => Vec::new(),
        Some(name) => zone_map
            .get(name)
            .cloned()
            .unwrap_or_else(|| vec![name.to_string()]),
    }
}

/// Protocol+port clause; a port match implies the protocol, so a separate
/// `meta l4proto` is suppressed.
fn proto_clause(rule: &NatRule) -> Option<String> {
    match (&rule.protocol, &rule.dest_port) {
        (proto, Some(port)) => {
            let proto = proto.as_deref().unwrap_or("tcp");
            Some(format!("{proto} dport {port}"))
        }
        (Some(proto), None) => Some(format!("meta l4proto {proto}")),
        (None, None) => None,
    }
}

fn dnat_target(rule: &NatRule) -> Result<String, Error> {
    let to_ip = rule
        .to_ip
        .as_deref()
        .ok_or_else(|| compile_error("nat", "dnat without translation target"))?;
    Ok(match rule.to_port {
        Some(port) => format!("dnat to {to_ip}:{port}"),
        None => format!("dnat to {to_ip}"),
    })
}

fn dnat(b: &mut ScriptBuilder, config: &Config, zone_map: &ZoneMap, rule: &NatRule) -> Result<(), Error> {
    let target = dnat_target(rule)?;
    for iface in expand(zone_map, rule.in_interface.as_deref()) {
        let mut parts = vec![format!("iifname {}", quoted(&iface))];
        if let Some(ip) = &rule.source_ip {
            parts.push(format!("ip saddr {ip}"));
        }
        if let Some(ip) = &rule.dest_ip {
            parts.push(format!("ip daddr {ip}"));
        }
        if let Some(mark) = rule.mark {
            parts.push(format!("meta mark {mark:#x}"));
        }
        if let Some(clause) = proto_clause(rule) {
            parts.push(clause);
        }
        parts.push(target.clone());
        b.rule(CHAIN_PREROUTING, &parts.join(" "));
    }

    if rule.hairpin {
        hairpin(b, config, zone_map, rule)?;
    }
    Ok(())
}

/// Reflective DNAT: internal clients reach an internal server through its
/// external address, with a masquerade so replies return through the router.
fn hairpin(b: &mut ScriptBuilder, config: &Config, zone_map: &ZoneMap, rule: &NatRule) -> Result<(), Error> {
    let target = dnat_target(rule)?;
    let to_ip = rule.to_ip.as_deref().unwrap_or_default();

    let wan_ip = match &rule.dest_ip {
        Some(ip) => ip.clone(),
        None => {
            let in_ifaces = expand(zone_map, rule.in_interface.as_deref());
            in_ifaces
                .iter()
                .filter_map(|name| config.interface(name))
                .flat_map(|iface| iface.ipv4.iter())
                .map(|addr| addr.split('/').next().unwrap_or(addr).to_string())
                .next()
                .ok_or_else(|| compile_error("nat", "hairpin dnat needs a dst ip or an addressed in-interface"))?
        }
    };

    let wan_side: BTreeSet<String> = expand(zone_map, rule.in_interface.as_deref()).into_iter().collect();
    for iface in config.interfaces.iter().filter(|i| !wan_side.contains(&i.name)) {
        let mut parts = vec![format!("iifname {}", quoted(&iface.name)), format!("ip daddr {wan_ip}")];
        if let Some(clause) = proto_clause(rule) {
            parts.push(clause);
        }
        parts.push(target.clone());
        b.rule(CHAIN_PREROUTING, &parts.join(" "));
    }

    let mut masq = vec![format!("ip daddr {to_ip}")];
    let inside_port = rule.to_port.map(|p| p.to_string()).or_else(|| rule.dest_port.clone());
    if let Some(port) = inside_port {
        let proto = rule.protocol.as_deref().unwrap_or("tcp");
        masq.push(format!("{proto} dport {port}"));
    }
    masq.push("masquerade".to_string());
    b.rule(CHAIN_POSTROUTING, &masq.join(" "));
    Ok(())
}

fn snat(b: &mut ScriptBuilder, zone_map: &ZoneMap, rule: &NatRule) -> Result<(), Error> {
    let to_ip = rule
        .to_ip
        .as_deref()
        .or(rule.source_ip.as_deref())
        .ok_or_else(|| compile_error("nat", "snat without rewrite source"))?;

    let out = expand(zone_map, rule.out_interface.as_deref());
    let outs: Vec<Option<String>> = if out.is_empty() {
        vec![None]
    } else {
        out.into_iter().map(Some).collect()
    };
    for iface in outs {
        let mut parts = Vec::new();
        if let Some(iface) = iface {
            parts.push(format!("oifname {}", quoted(&iface)));
        }
        if let Some(ip) = &rule.source_ip {
            parts.push(format!("ip saddr {ip}"));
        }
        if let Some(clause) = proto_clause(rule) {
            parts.push(clause);
        }
        parts.push(format!("snat to {to_ip}"));
        b.rule(CHAIN_POSTROUTING, &parts.join(" "));
    }
    Ok(())
}

/// Policies that imply masquerading: explicit `masquerade = true`, or an
/// internal-to-external direction inferred from RFC1918 membership plus a
/// dhcp/zone-name hint on the destination.
fn masquerade_candidates<'a>(config: &'a Config, zone_map: &ZoneMap) -> Vec<&'a Policy> {
    config
        .policies
        .iter()
        .filter(|p| p.enabled && p.to != "firewall" && p.to != "self")
        .filter(|p| {
            p.masquerade
                || (zone_looks_internal(config, zone_map, &p.from) && zone_looks_external(config, zone_map, &p.to))
        })
        .collect()
}

fn zone_looks_internal(config: &Config, zone_map: &ZoneMap, pattern: &str) -> bool {
    for zone_name in zones::expand_glob(pattern, zone_map) {
        if let Some(zone) = config.zone(&zone_name) {
            if zone.external {
                continue;
            }
            if zone.networks.iter().any(|n| is_rfc1918(n)) {
                return true;
            }
        }
        let members = zone_map.get(&zone_name).map(Vec::as_slice).unwrap_or(&[]);
        for iface in members.iter().filter_map(|name| config.interface(name)) {
            if iface.ipv4.iter().any(|a| is_rfc1918(a)) {
                return true;
            }
        }
    }
    false
}

fn zone_looks_external(config: &Config, zone_map: &ZoneMap, pattern: &str) -> bool {
    for zone_name in zones::expand_glob(pattern, zone_map) {
        if config.zone(&zone_name).map(|z| z.external).unwrap_or(false) {
            return true;
        }
        if zone_name.to_ascii_lowercase().contains("wan") {
            return true;
        }
        let members = zone_map.get(&zone_name).map(Vec::as_slice).unwrap_or(&[]);
        if members.iter().filter_map(|name| config.interface(name)).any(|i| i.dhcp) {
            return true;
        }
    }
    false
}

fn is_rfc1918(addr: &str) -> bool {
    let ip = addr.split('/').next().unwrap_or(addr);
    let Ok(ip) = ip.parse::<Ipv4Addr>() else {
        return false;
    };
    let octets = ip.octets();
    octets[0] == 10
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || (octets[0] == 192 && octets[1] == 168)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Interface;

    #[test]
    fn rfc1918_membership() {
        assert!(is_rfc1918("192.168.1.1/24"));
        assert!(is_rfc1918("10.1.2.3"));
        assert!(is_rfc1918("172.31.0.1"));
        assert!(!is_rfc1918("172.32.0.1"));
        assert!(!is_rfc1918("203.0.113.9"));
    }

    #[test]
    fn zone_expansion_falls_back_to_interface_name() {
        let config = Config {
            interfaces: vec![Interface {
                name: "eth0".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let zone_map = zones::resolve(&config.zones, &config.interfaces);
        assert_eq!(expand(&zone_map, Some("eth0")), vec!["eth0"]);
        assert_eq!(expand(&zone_map, Some("ppp9")), vec!["ppp9"]);
    }
}

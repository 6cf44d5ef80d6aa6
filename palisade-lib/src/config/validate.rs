//! Identifier and value validation run before any compilation.
//!
//! Violations abort the apply with `ConfigInvalid` before a single kernel
//! call. The applier's check phase is the second line of defense against
//! expression-level injection.

use std::net::IpAddr;

use crate::Error;

use super::model::{Config, IpSetType, NatKind};

/// Identifiers accepted unquoted in scripts: `[A-Za-z0-9_.-]+`.
pub fn is_valid_ident(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

/// Set names are tighter: `[A-Za-z0-9_-]+`.
pub fn is_valid_set_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Policy endpoints may be zone globs: `*`, a trailing-`*` prefix form, or a
/// plain identifier. `firewall` and `self` are accepted literals.
fn is_valid_zone_ref(s: &str) -> bool {
    if s == "*" || s == "firewall" || s == "self" {
        return true;
    }
    match s.strip_suffix('*') {
        Some(stem) => !stem.is_empty() && is_valid_ident(stem),
        None => is_valid_ident(s),
    }
}

fn is_ip_or_cidr(s: &str) -> bool {
    // IpInet accepts both network form (10.0.0.0/8) and host-with-prefix
    // form (192.168.1.1/24), which interface addresses use
    s.parse::<IpAddr>().is_ok() || s.parse::<cidr::IpInet>().is_ok()
}

fn is_port_or_range(s: &str) -> bool {
    match s.split_once('-') {
        Some((lo, hi)) => match (lo.parse::<u16>(), hi.parse::<u16>()) {
            (Ok(lo), Ok(hi)) => lo <= hi,
            _ => false,
        },
        None => s.parse::<u16>().is_ok(),
    }
}

fn is_country_code(s: &str) -> bool {
    s.len() == 2 && s.chars().all(|c| c.is_ascii_uppercase())
}

fn ident(field: &str, value: &str) -> Result<(), Error> {
    if is_valid_ident(value) {
        Ok(())
    } else {
        Err(Error::config(field, format!("`{value}` contains characters outside [A-Za-z0-9_.-]")))
    }
}

fn ip_or_cidr(field: &str, value: &str) -> Result<(), Error> {
    if is_ip_or_cidr(value) {
        Ok(())
    } else {
        Err(Error::config(field, format!("`{value}` is not an IP address or CIDR")))
    }
}

pub fn validate(config: &Config) -> Result<(), Error> {
    for zone in &config.zones {
        ident("zone.name", &zone.name)?;
        for iface in &zone.interfaces {
            ident("zone.interfaces", iface)?;
        }
        for net in &zone.networks {
            ip_or_cidr("zone.networks", net)?;
        }
    }

    for iface in &config.interfaces {
        ident("interface.name", &iface.name)?;
        for addr in iface.ipv4.iter().chain(iface.ipv6.iter()) {
            ip_or_cidr("interface.address", addr)?;
        }
        if let Some(zone) = &iface.zone {
            ident("interface.zone", zone)?;
        }
    }

    for policy in config
        .policies
        .iter()
        .chain(config.scheduled.iter().map(|s| &s.policy))
    {
        if !is_valid_zone_ref(&policy.from) {
            return Err(Error::config("policy.from", format!("`{}` is not a valid zone reference", policy.from)));
        }
        if !is_valid_zone_ref(&policy.to) {
            return Err(Error::config("policy.to", format!("`{}` is not a valid zone reference", policy.to)));
        }
        for rule in &policy.rules {
            if let Some(ip) = &rule.source_ip {
                ip_or_cidr("rule.source_ip", ip)?;
            }
            if let Some(ip) = &rule.dest_ip {
                ip_or_cidr("rule.dest_ip", ip)?;
            }
            for (field, set) in [("rule.src_ipset", &rule.src_ipset), ("rule.dest_ipset", &rule.dest_ipset)] {
                if let Some(name) = set {
                    if !is_valid_set_name(name) {
                        return Err(Error::config(field, format!("`{name}` contains characters outside [A-Za-z0-9_-]")));
                    }
                    if !config.ipsets.iter().any(|s| &s.name == name) {
                        return Err(Error::config(field, format!("unknown IP set `{name}`")));
                    }
                }
            }
            if let Some(port) = &rule.dest_port {
                if !is_port_or_range(port) {
                    return Err(Error::config("rule.dest_port", format!("`{port}` is not a port or port range")));
                }
            }
            for (field, cc) in [("rule.geoip_src", &rule.geoip_src), ("rule.geoip_dest", &rule.geoip_dest)] {
                if let Some(cc) = cc {
                    if !is_country_code(cc) {
                        return Err(Error::config(field, format!("`{cc}` is not an ISO-3166-1 alpha-2 code")));
                    }
                }
            }
        }
    }

    for nat in &config.nat {
        for (field, iface) in [("nat.in_interface", &nat.in_interface), ("nat.out_interface", &nat.out_interface)] {
            if let Some(name) = iface {
                ident(field, name)?;
            }
        }
        for (field, ip) in [
            ("nat.source_ip", &nat.source_ip),
            ("nat.dest_ip", &nat.dest_ip),
            ("nat.to_ip", &nat.to_ip),
        ] {
            if let Some(ip) = ip {
                ip_or_cidr(field, ip)?;
            }
        }
        if let Some(port) = &nat.dest_port {
            if !is_port_or_range(port) {
                return Err(Error::config("nat.dest_port", format!("`{port}` is not a port or port range")));
            }
        }
        if nat.kind == NatKind::Dnat && nat.to_ip.is_none() {
            return Err(Error::config("nat.to_ip", "dnat requires a translation target"));
        }
        if nat.kind == NatKind::Snat && nat.source_ip.is_none() && nat.to_ip.is_none() {
            return Err(Error::config("nat.to_ip", "snat requires a rewrite source"));
        }
    }

    for set in &config.ipsets {
        if !is_valid_set_name(&set.name) {
            return Err(Error::config("ipset.name", format!("`{}` contains characters outside [A-Za-z0-9_-]", set.name)));
        }
        match set.set_type {
            IpSetType::InetService => {
                for entry in &set.entries {
                    if !is_port_or_range(entry) {
                        return Err(Error::config("ipset.entries", format!("`{entry}` is not a port or port range")));
                    }
                }
            }
            _ => {
                for entry in &set.entries {
                    ip_or_cidr("ipset.entries", entry)?;
                }
            }
        }
    }

    for prot in &config.protections {
        if prot.interface != "*" {
            ident("protection.interface", &prot.interface)?;
        }
    }

    for vpn in &config.vpn {
        ident("vpn.interface", &vpn.interface)?;
    }

    for route in &config.uid_routes {
        if !config.uplinks.iter().any(|u| u.name == route.uplink) {
            return Err(Error::config("uid_route.uplink", format!("unknown uplink `{}`", route.uplink)));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{Interface, IpSet, Policy, PolicyRule, Zone};
    use rstest::rstest;

    #[test]
    fn accepts_empty_config() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[rstest]
    #[case("lan", true)]
    #[case("eth0.100", true)]
    #[case("zone-1_a", true)]
    #[case("", false)]
    #[case("bad name", false)]
    #[case("semi;colon", false)]
    #[case("star*", false)]
    #[case("quote\"", false)]
    fn identifier_charset(#[case] input: &str, #[case] valid: bool) {
        assert_eq!(is_valid_ident(input), valid);
    }

    #[rstest]
    #[case("443", true)]
    #[case("80-90", true)]
    #[case("90-80", false)]
    #[case("65536", false)]
    #[case("http", false)]
    fn port_forms(#[case] input: &str, #[case] valid: bool) {
        assert_eq!(is_port_or_range(input), valid);
    }

    #[test]
    fn rejects_injection_in_zone_name() {
        let config = Config {
            zones: vec![Zone {
                name: "lan; flush ruleset".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let err = validate(&config).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { field, .. } if field == "zone.name"));
    }

    #[test]
    fn rejects_missing_ipset_reference() {
        let config = Config {
            policies: vec![Policy {
                from: "lan".to_string(),
                to: "wan".to_string(),
                rules: vec![PolicyRule {
                    src_ipset: Some("nosuch".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        let err = validate(&config).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { field, .. } if field == "rule.src_ipset"));
    }

    #[test]
    fn accepts_zone_globs_and_firewall_literal() {
        let config = Config {
            ipsets: vec![IpSet {
                name: "badguys".to_string(),
                ..Default::default()
            }],
            interfaces: vec![Interface {
                name: "eth0".to_string(),
                ..Default::default()
            }],
            policies: vec![
                Policy {
                    from: "*".to_string(),
                    to: "firewall".to_string(),
                    ..Default::default()
                },
                Policy {
                    from: "dmz*".to_string(),
                    to: "wan".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert!(validate(&config).is_ok());
    }
}

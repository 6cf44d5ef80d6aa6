//! Zone resolution: zone name to interface list.
//!
//! Zones declare interfaces directly, through match patterns, or inherit
//! them from interface-level `zone` assignments. Every interface name is
//! additionally exposed as a singleton zone so policies can target a single
//! port without declaring a zone for it.

use std::collections::BTreeMap;

use crate::config::{Interface, Zone};

/// Pattern semantics shared by zone matching and policy globs: `*` matches
/// everything, a trailing `*` is a prefix match, anything else is exact.
pub fn glob_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

/// Resolve the stable zone-to-interfaces mapping. BTreeMap plus sorted
/// member lists keep the result deterministic for a given config.
pub fn resolve(zones: &[Zone], interfaces: &[Interface]) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for zone in zones {
        let members = map.entry(zone.name.clone()).or_default();
        for iface in &zone.interfaces {
            members.push(iface.clone());
        }
        for pattern in &zone.match_interfaces {
            for iface in interfaces {
                if glob_matches(pattern, &iface.name) {
                    members.push(iface.name.clone());
                }
            }
        }
    }

    for iface in interfaces {
        if let Some(zone) = &iface.zone {
            map.entry(zone.clone()).or_default().push(iface.name.clone());
        }
        // Implicit singleton zone named after the interface.
        map.entry(iface.name.clone()).or_default().push(iface.name.clone());
    }

    for members in map.values_mut() {
        members.sort();
        members.dedup();
    }
    map
}

/// Expand a policy endpoint glob over the resolved zone names.
pub fn expand_glob(pattern: &str, zones: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    zones.keys().filter(|name| glob_matches(pattern, name)).cloned().collect()
}

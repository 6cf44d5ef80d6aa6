//! Mangle compilation: packet marks for split routing, user mark rules and
//! UID-based uplink selection in the `ip mangle` table.

use std::collections::BTreeSet;

use crate::config::{Config, MarkRule};
use crate::script::{quoted, ChainSpec, Family, Script, ScriptBuilder};
use crate::Error;

use super::{compile_error, CHAIN_MARK_PREROUTING, MANGLE_TABLE};

const CHAIN_OUTPUT: &str = "output";

pub fn compile(config: &Config) -> Result<Script, Error> {
    let mut b = ScriptBuilder::new(Family::Ip, MANGLE_TABLE);
    b.table(None);
    b.chain(
        CHAIN_MARK_PREROUTING,
        &ChainSpec {
            chain_type: "filter",
            hook: "prerouting",
            priority: -150,
            policy: "accept",
        },
    );
    // route type so a changed mark re-routes locally generated traffic
    b.chain(
        CHAIN_OUTPUT,
        &ChainSpec {
            chain_type: "route",
            hook: "output",
            priority: -150,
            policy: "accept",
        },
    );

    let mut marks_in_use: BTreeSet<u32> = BTreeSet::new();

    // split routing: reply traffic follows the conntrack mark back out
    for iface in config
        .interfaces
        .iter()
        .filter(|i| i.routing_table > 0 && i.routing_table != 254)
    {
        b.rule(
            CHAIN_MARK_PREROUTING,
            &format!(
                "iifname {} ct mark set {:#x}",
                quoted(&iface.name),
                iface.routing_table
            ),
        );
        marks_in_use.insert(iface.routing_table);
    }
    for mark in &marks_in_use {
        b.rule(CHAIN_OUTPUT, &format!("ct mark {mark:#x} meta mark set {mark:#x}"));
    }

    for rule in &config.marks {
        let chain = if rule.out_interface.is_some() {
            CHAIN_OUTPUT
        } else {
            CHAIN_MARK_PREROUTING
        };
        b.rule(chain, &mark_expr(rule));
    }

    // uplink selection by owner uid
    for route in &config.uid_routes {
        let uplink = config
            .uplinks
            .iter()
            .find(|u| u.name == route.uplink)
            .ok_or_else(|| compile_error("mangle", format!("unknown uplink `{}`", route.uplink)))?;
        b.rule(
            CHAIN_OUTPUT,
            &format!(
                "meta skuid {} meta mark set {:#x} ct mark set meta mark",
                route.uid,
                uplink.mark()
            ),
        );
    }

    Ok(b.build())
}

fn mark_expr(rule: &MarkRule) -> String {
    let mut parts = Vec::new();
    if let Some(iface) = &rule.in_interface {
        parts.push(format!("iifname {}", quoted(iface)));
    }
    if let Some(iface) = &rule.out_interface {
        parts.push(format!("oifname {}", quoted(iface)));
    }
    match (&rule.protocol, &rule.dest_port) {
        (proto, Some(port)) => {
            let proto = proto.as_deref().unwrap_or("tcp");
            parts.push(format!("{proto} dport {port}"));
        }
        (Some(proto), None) => parts.push(format!("meta l4proto {proto}")),
        (None, None) => {}
    }
    parts.push(format!("meta mark set {:#x}", rule.mark));
    if rule.save_mark {
        parts.push(format!("ct mark set {:#x}", rule.mark));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Interface, UidRoute, Uplink, UplinkKind};

    #[test]
    fn split_routing_marks_and_restores() {
        let config = Config {
            interfaces: vec![
                Interface {
                    name: "wg0".to_string(),
                    routing_table: 0x51,
                    ..Default::default()
                },
                Interface {
                    name: "eth0".to_string(),
                    routing_table: 254,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let script = compile(&config).unwrap();
        let text = script.text();
        assert!(text.contains("iifname \"wg0\" ct mark set 0x51"));
        assert!(text.contains("ct mark 0x51 meta mark set 0x51"));
        // table 254 is the main table, no split routing
        assert!(!text.contains("eth0"));
    }

    #[test]
    fn uid_route_uses_uplink_registry_mark() {
        let config = Config {
            uplinks: vec![Uplink {
                name: "tunnel".to_string(),
                kind: UplinkKind::Wireguard,
                index: 2,
                custom_base: None,
            }],
            uid_routes: vec![UidRoute {
                uid: 987,
                uplink: "tunnel".to_string(),
            }],
            ..Default::default()
        };
        let script = compile(&config).unwrap();
        assert!(script
            .text()
            .contains("meta skuid 987 meta mark set 0x202 ct mark set meta mark"));
    }

    #[test]
    fn user_mark_rule_picks_chain_by_direction() {
        let config = Config {
            marks: vec![
                MarkRule {
                    in_interface: Some("lan0".to_string()),
                    dest_port: Some("443".to_string()),
                    mark: 0x7,
                    save_mark: true,
                    ..Default::default()
                },
                MarkRule {
                    out_interface: Some("eth0".to_string()),
                    mark: 0x8,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let script = compile(&config).unwrap();
        let lines: Vec<&str> = script.lines().iter().map(String::as_str).collect();
        assert!(lines
            .iter()
            .any(|l| l.contains("mark_prerouting iifname \"lan0\" tcp dport 443 meta mark set 0x7 ct mark set 0x7")));
        assert!(lines.iter().any(|l| l.contains("output oifname \"eth0\" meta mark set 0x8")));
    }
}

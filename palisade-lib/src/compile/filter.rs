//! Filter-table compilation for the managed `inet` table.
//!
//! Emission order is load-bearing: table, flowtable, protection chain,
//! GeoIP sets, user sets, DNS egress sets, base chains, baseline rules,
//! DNS wall, services dispatch, IP-set blocklists, policy chains with
//! verdict-map dispatch, final drops. Set declarations always precede the
//! rules that reference them.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{ApplyTo, Config, IpSetType, Management, RuleAction, Services};
use crate::metadata::GenerationTag;
use crate::script::{quoted, ChainSpec, Family, Script, ScriptBuilder, SetFlag};
use crate::Error;

use super::expr::{action_expr, policy_rule_expr};
use super::{
    CHAIN_FORWARD, CHAIN_INPUT, CHAIN_OUTPUT, CHAIN_PROTECTION, FLOWTABLE, LOG_GROUP_DISCOVERY,
    MAP_FORWARD_VMAP, MAP_INPUT_VMAP, TABLE,
};
use crate::zones;

const RFC1918: &str = "10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16";

const BOGONS_V4: &str = "0.0.0.0/8, 100.64.0.0/10, 127.0.0.0/8, 169.254.0.0/16, \
                         192.0.0.0/24, 192.0.2.0/24, 198.18.0.0/15, 198.51.100.0/24, \
                         203.0.113.0/24, 224.0.0.0/4, 240.0.0.0/4";

pub const DNS_ALLOWED_V4: &str = "dns_allowed_v4";
pub const DNS_ALLOWED_V6: &str = "dns_allowed_v6";

/// Default size for DNS-resolved allowlist sets.
const DNS_SET_SIZE: usize = 65535;

type ZoneMap = BTreeMap<String, Vec<String>>;

pub fn compile(config: &Config, zone_map: &ZoneMap, tag: &GenerationTag) -> Result<Script, Error> {
    let mut b = ScriptBuilder::new(Family::Inet, TABLE);

    // 1. table carrying the generation tag
    b.table(Some(&tag.render()));

    // 2. flowtable over all configured interfaces
    if config.options.flow_offload && !config.interfaces.is_empty() {
        let devices: Vec<String> = config.interfaces.iter().map(|i| i.name.clone()).collect();
        b.flowtable(FLOWTABLE, 0, &devices);
    }

    // 3. protection chain ahead of conntrack
    protection_chain(&mut b, config);

    // 4. GeoIP country sets referenced by enabled rules
    for cc in referenced_countries(config) {
        b.set(&format!("geoip_country_{cc}"), "ipv4_addr", &[SetFlag::Interval], None);
    }

    // 5. user sets; static ones are flushed and repopulated, dynamic ones
    //    are declared only so their contents survive the apply
    user_sets(&mut b, config);

    // 6. DNS egress-control sets
    if config.dns.egress_filter {
        b.set(DNS_ALLOWED_V4, "ipv4_addr", &[SetFlag::Timeout], Some(DNS_SET_SIZE));
        b.set(DNS_ALLOWED_V6, "ipv6_addr", &[SetFlag::Timeout], Some(DNS_SET_SIZE));
    }

    // 7. base chains
    for (name, hook) in [(CHAIN_INPUT, "input"), (CHAIN_FORWARD, "forward"), (CHAIN_OUTPUT, "output")] {
        b.chain(
            name,
            &ChainSpec {
                chain_type: "filter",
                hook,
                priority: 0,
                policy: "drop",
            },
        );
    }

    // 8. baseline rules
    baseline_rules(&mut b, config);

    // 9. DNS wall
    if config.dns.egress_filter {
        b.rule(
            CHAIN_FORWARD,
            &format!(
                "ip daddr != @{DNS_ALLOWED_V4} ct state new limit rate 10/second burst 50 packets \
                 log prefix {} group {}",
                quoted("palisade-dnswall: "),
                super::LOG_GROUP_DROP
            ),
        );
        b.rule(
            CHAIN_FORWARD,
            &format!("ip daddr != @{DNS_ALLOWED_V4} ct state new reject with icmp type admin-prohibited"),
        );
        b.rule(
            CHAIN_FORWARD,
            &format!("ip6 daddr != @{DNS_ALLOWED_V6} ct state new reject with icmpv6 type admin-prohibited"),
        );
    }

    // 10. consolidated per-interface services dispatch
    services_rules(&mut b, config, zone_map);

    // 11. IP-set auto-block rules
    ipset_block_rules(&mut b, config);

    // 12. policy chains wired through the verdict maps
    policies(&mut b, config, zone_map)?;

    // 13. final verdicts
    final_rules(&mut b, config);

    Ok(b.build())
}

/// Rate-limited log-and-drop. Overflow beyond the limit falls through to
/// the chain's terminal verdict.
fn logged_drop(matches: &str, prefix: &str) -> String {
    format!("{} {}", matches, action_expr(RuleAction::Drop, None, prefix))
}

fn protection_chain(b: &mut ScriptBuilder, config: &Config) {
    if config.protections.is_empty() {
        return;
    }
    b.chain(
        CHAIN_PROTECTION,
        &ChainSpec {
            chain_type: "filter",
            hook: "prerouting",
            priority: -300,
            policy: "accept",
        },
    );
    for prot in &config.protections {
        let interfaces: Vec<String> = if prot.interface == "*" {
            config.interfaces.iter().map(|i| i.name.clone()).collect()
        } else {
            vec![prot.interface.clone()]
        };
        for iface in &interfaces {
            let iif = format!("iifname {}", quoted(iface));
            if prot.anti_spoofing {
                b.rule(
                    CHAIN_PROTECTION,
                    &logged_drop(&format!("{iif} ip saddr {{ {RFC1918} }}"), "palisade-spoof"),
                );
            }
            if prot.block_bogons {
                b.rule(
                    CHAIN_PROTECTION,
                    &logged_drop(&format!("{iif} ip saddr {{ {BOGONS_V4} }}"), "palisade-bogon"),
                );
            }
            if prot.drop_invalid {
                b.rule(
                    CHAIN_PROTECTION,
                    &logged_drop(&format!("{iif} ct state invalid"), "palisade-invalid"),
                );
            }
            if let Some(rate) = prot.syn_flood_rate {
                let burst = prot.syn_flood_burst.unwrap_or(rate);
                b.rule(
                    CHAIN_PROTECTION,
                    &format!(
                        "{iif} tcp flags & (fin|syn|rst|ack) == syn \
                         limit rate over {rate}/second burst {burst} packets \
                         log prefix {} group {} counter drop",
                        quoted("palisade-synflood: "),
                        super::LOG_GROUP_DROP
                    ),
                );
            }
            if let Some(rate) = prot.icmp_rate {
                b.rule(
                    CHAIN_PROTECTION,
                    &format!(
                        "{iif} meta l4proto icmp limit rate over {rate}/second burst 10 packets \
                         log prefix {} group {} counter drop",
                        quoted("palisade-icmpflood: "),
                        super::LOG_GROUP_DROP
                    ),
                );
            }
        }
    }
}

fn referenced_countries(config: &Config) -> BTreeSet<String> {
    let mut countries = BTreeSet::new();
    for policy in config.policies.iter().filter(|p| p.enabled) {
        for rule in policy.rules.iter().filter(|r| r.enabled) {
            if let Some(cc) = &rule.geoip_src {
                countries.insert(cc.clone());
            }
            if let Some(cc) = &rule.geoip_dest {
                countries.insert(cc.clone());
            }
        }
    }
    countries
}

fn user_sets(b: &mut ScriptBuilder, config: &Config) {
    for set in &config.ipsets {
        match set.set_type {
            IpSetType::Dns => {
                b.set(&set.name, set.set_type.element_type(), &[SetFlag::Timeout], Some(DNS_SET_SIZE));
            }
            IpSetType::Dynamic => {
                b.set(&set.name, set.set_type.element_type(), &[SetFlag::Interval], None);
            }
            IpSetType::Ipv4Addr | IpSetType::Ipv6Addr => {
                b.set(&set.name, set.set_type.element_type(), &[SetFlag::Interval], None);
                b.flush_set(&set.name);
                if !set.entries.is_empty() {
                    let mut entries = set.entries.clone();
                    entries.dedup();
                    b.elements(&set.name, &entries);
                }
            }
            IpSetType::InetService => {
                b.set(&set.name, set.set_type.element_type(), &[], None);
                b.flush_set(&set.name);
                if !set.entries.is_empty() {
                    let mut entries = set.entries.clone();
                    entries.dedup();
                    b.elements(&set.name, &entries);
                }
            }
        }
    }
}

fn baseline_rules(b: &mut ScriptBuilder, config: &Config) {
    // loopback
    b.rule(CHAIN_INPUT, "iifname \"lo\" accept");
    b.rule(CHAIN_OUTPUT, "oifname \"lo\" accept");

    // stateful fast path
    for chain in [CHAIN_INPUT, CHAIN_FORWARD, CHAIN_OUTPUT] {
        b.rule(chain, "ct state established,related accept");
    }

    // invalid packets
    for chain in [CHAIN_INPUT, CHAIN_FORWARD] {
        b.rule(chain, &logged_drop("ct state invalid", "palisade-invalid"));
    }

    // device discovery feed on new connections
    for chain in [CHAIN_INPUT, CHAIN_FORWARD] {
        b.rule(
            chain,
            &format!("ct state new limit rate 30/second burst 60 packets log group {LOG_GROUP_DISCOVERY}"),
        );
    }

    // mDNS discovery
    b.rule(
        CHAIN_INPUT,
        &format!("udp dport 5353 limit rate 4/second log group {LOG_GROUP_DISCOVERY}"),
    );

    // DHCP server and client
    b.rule(CHAIN_INPUT, "udp dport { 67, 68 } accept");
    b.rule(CHAIN_OUTPUT, "udp dport { 67, 68 } accept");

    // VPN lockout protection: never cut off a managed VPN path
    for vpn in config.vpn.iter().filter(|v| v.management_access) {
        let iface = quoted(&vpn.interface);
        b.rule(CHAIN_INPUT, &format!("iifname {iface} accept"));
        b.rule(CHAIN_OUTPUT, &format!("oifname {iface} accept"));
        b.rule(CHAIN_FORWARD, &format!("iifname {iface} accept"));
        b.rule(CHAIN_FORWARD, &format!("oifname {iface} accept"));
    }

    if config.options.mss_clamp {
        b.rule(CHAIN_FORWARD, "tcp flags syn tcp option maxseg size set rt mtu");
    }

    if config.options.flow_offload && !config.interfaces.is_empty() {
        b.rule(CHAIN_FORWARD, &format!("meta l4proto {{ tcp, udp }} flow add @{FLOWTABLE}"));
    }

    // ICMP and neighbor discovery
    b.rule(CHAIN_INPUT, "meta l4proto icmp accept");
    b.rule(CHAIN_INPUT, "meta l4proto icmpv6 accept");
    b.rule(CHAIN_OUTPUT, "meta l4proto icmp accept");
    b.rule(CHAIN_OUTPUT, "meta l4proto icmpv6 accept");
    b.rule(
        CHAIN_INPUT,
        "icmpv6 type { nd-neighbor-solicit, nd-neighbor-advert, nd-router-solicit, nd-router-advert } accept",
    );

    // mDNS reflector
    for chain in [CHAIN_INPUT, CHAIN_FORWARD] {
        b.rule(chain, "ip daddr 224.0.0.251 udp dport 5353 accept");
    }

    // NTP server and client
    b.rule(CHAIN_INPUT, "udp dport 123 accept");
    b.rule(CHAIN_OUTPUT, "udp dport 123 accept");

    // router's own resolver
    b.rule(CHAIN_OUTPUT, "udp dport 53 accept");
    b.rule(CHAIN_OUTPUT, "tcp dport 53 accept");

    // UPnP SSDP on internal interfaces
    let internal = internal_interfaces(config);
    if !internal.is_empty() {
        let list: Vec<String> = internal.iter().map(|i| quoted(i)).collect();
        b.rule(
            CHAIN_INPUT,
            &format!("iifname {{ {} }} udp dport 1900 accept", list.join(", ")),
        );
    }

    // mDNS does not belong on VPN links
    for vpn in &config.vpn {
        b.rule(
            CHAIN_INPUT,
            &logged_drop(
                &format!("iifname {} udp dport 5353", quoted(&vpn.interface)),
                "palisade-mdns-vpn",
            ),
        );
    }

    // TLS SNI learning feed
    b.rule(
        CHAIN_FORWARD,
        &format!("tcp dport 443 ct state new limit rate 10/second log group {LOG_GROUP_DISCOVERY}"),
    );
}

/// Interfaces not belonging to an external zone.
fn internal_interfaces(config: &Config) -> Vec<String> {
    let mut external = BTreeSet::new();
    for zone in config.zones.iter().filter(|z| z.external) {
        for iface in &zone.interfaces {
            external.insert(iface.clone());
        }
    }
    for iface in &config.interfaces {
        if let Some(zone) = &iface.zone {
            if config.zone(zone).map(|z| z.external).unwrap_or(false) {
                external.insert(iface.name.clone());
            }
        }
    }
    config
        .interfaces
        .iter()
        .map(|i| i.name.clone())
        .filter(|name| !external.contains(name))
        .collect()
}

fn zone_services_for(config: &Config, zone_map: &ZoneMap, iface: &str) -> Services {
    let mut services = Services::default();
    for zone in &config.zones {
        let member = zone_map
            .get(&zone.name)
            .map(|members| members.iter().any(|m| m == iface))
            .unwrap_or(false);
        if member {
            services.dns |= zone.services.dns;
            services.ntp |= zone.services.ntp;
            services.dhcp |= zone.services.dhcp;
        }
    }
    services
}

fn management_ports(mgmt: &Management, web_ui_port: Option<u16>) -> (BTreeSet<u16>, BTreeSet<u16>) {
    let mut tcp = BTreeSet::new();
    let mut udp = BTreeSet::new();
    if mgmt.ssh {
        tcp.insert(22);
    }
    if mgmt.web {
        tcp.insert(80);
        tcp.insert(443);
        if let Some(port) = web_ui_port {
            tcp.insert(port);
        }
    }
    if mgmt.api {
        tcp.insert(8080);
        tcp.insert(8443);
    }
    if mgmt.snmp {
        udp.insert(161);
    }
    if mgmt.syslog {
        udp.insert(514);
    }
    (tcp, udp)
}

/// One consolidated dispatch per transport: `iifname . dport` concatenation
/// sets give O(1) service lookup instead of a rule per interface per port.
fn services_rules(b: &mut ScriptBuilder, config: &Config, zone_map: &ZoneMap) {
    let mut tcp_elements: Vec<String> = Vec::new();
    let mut udp_elements: Vec<String> = Vec::new();
    let mut icmp_interfaces: Vec<String> = Vec::new();

    for iface in &config.interfaces {
        let mgmt = config.management_for(&iface.name);
        let (mut tcp, mut udp) = management_ports(&mgmt, iface.web_ui_port);
        if iface.access_web_ui {
            tcp.insert(80);
            tcp.insert(443);
            if let Some(port) = iface.web_ui_port {
                tcp.insert(port);
            }
        }
        let services = zone_services_for(config, zone_map, &iface.name);
        if services.dns {
            tcp.insert(53);
            udp.insert(53);
        }
        if services.ntp {
            udp.insert(123);
        }
        if services.dhcp {
            udp.insert(67);
            udp.insert(68);
        }

        // interface names inside concatenations must be quoted
        let name = quoted(&iface.name);
        tcp_elements.extend(tcp.iter().map(|port| format!("{name} . {port}")));
        udp_elements.extend(udp.iter().map(|port| format!("{name} . {port}")));
        if mgmt.icmp {
            icmp_interfaces.push(name.clone());
        }
    }

    if !tcp_elements.is_empty() {
        b.rule(
            CHAIN_INPUT,
            &format!("iifname . tcp dport {{ {} }} accept", tcp_elements.join(", ")),
        );
    }
    if !udp_elements.is_empty() {
        b.rule(
            CHAIN_INPUT,
            &format!("iifname . udp dport {{ {} }} accept", udp_elements.join(", ")),
        );
    }
    if !icmp_interfaces.is_empty() {
        b.rule(
            CHAIN_INPUT,
            &format!("iifname {{ {} }} meta l4proto icmp accept", icmp_interfaces.join(", ")),
        );
    }
}

fn ipset_block_rules(b: &mut ScriptBuilder, config: &Config) {
    for set in &config.ipsets {
        let Some(action) = set.action else { continue };
        let chains: &[&str] = match set.apply_to {
            ApplyTo::Input => &[CHAIN_INPUT],
            ApplyTo::Forward => &[CHAIN_FORWARD],
            ApplyTo::Both => &[CHAIN_INPUT, CHAIN_FORWARD],
        };
        let family = match set.set_type {
            IpSetType::Ipv6Addr => "ip6",
            _ => "ip",
        };
        let mut matches: Vec<String> = Vec::new();
        if set.match_on_source {
            matches.push(format!("{family} saddr @{}", set.name));
        }
        if set.match_on_dest {
            matches.push(format!("{family} daddr @{}", set.name));
        }
        for chain in chains {
            for matcher in &matches {
                let prefix = format!("palisade-block-{}", set.name);
                b.rule(chain, &format!("{} {}", matcher, action_expr(action, None, &prefix)));
            }
        }
    }
}

fn policies(b: &mut ScriptBuilder, config: &Config, zone_map: &ZoneMap) -> Result<(), Error> {
    let mut input_entries: BTreeMap<String, String> = BTreeMap::new();
    let mut forward_entries: BTreeMap<(String, String), String> = BTreeMap::new();
    let mut emitted_chains: BTreeSet<String> = BTreeSet::new();

    for policy in config.policies.iter().filter(|p| p.enabled) {
        let to_firewall = policy.to == "firewall" || policy.to == "self";
        let from_zones = zones::expand_glob(&policy.from, zone_map);
        let to_zones = if to_firewall {
            vec!["firewall".to_string()]
        } else {
            zones::expand_glob(&policy.to, zone_map)
        };

        for from in &from_zones {
            for to in &to_zones {
                let chain = format!("policy_{from}_{to}");
                if emitted_chains.insert(chain.clone()) {
                    b.named_chain(&chain);
                    for rule in policy.rules.iter().filter(|r| r.enabled) {
                        let expr = policy_rule_expr(rule, &chain)?;
                        match rule.label() {
                            Some(label) => {
                                b.rule_with_comment(&chain, &expr, &format!("rule:{label}"));
                            }
                            None => {
                                b.rule(&chain, &expr);
                            }
                        }
                    }
                    // terminal default action
                    b.rule(&chain, &action_expr(policy.action, None, &chain));
                }

                let verdict = format!("jump {chain}");
                if to_firewall {
                    for iface in zone_map.get(from).map(Vec::as_slice).unwrap_or(&[]) {
                        input_entries.entry(iface.clone()).or_insert_with(|| verdict.clone());
                    }
                } else {
                    for in_iface in zone_map.get(from).map(Vec::as_slice).unwrap_or(&[]) {
                        for out_iface in zone_map.get(to).map(Vec::as_slice).unwrap_or(&[]) {
                            forward_entries
                                .entry((in_iface.clone(), out_iface.clone()))
                                .or_insert_with(|| verdict.clone());
                        }
                    }
                }
            }
        }
    }

    b.map(MAP_INPUT_VMAP, "ifname", "verdict");
    b.flush_map(MAP_INPUT_VMAP);
    if !input_entries.is_empty() {
        let elements: Vec<String> = input_entries
            .iter()
            .map(|(iface, verdict)| format!("{} : {}", quoted(iface), verdict))
            .collect();
        b.elements(MAP_INPUT_VMAP, &elements);
    }

    b.map(MAP_FORWARD_VMAP, "ifname . ifname", "verdict");
    b.flush_map(MAP_FORWARD_VMAP);
    if !forward_entries.is_empty() {
        let elements: Vec<String> = forward_entries
            .iter()
            .map(|((in_iface, out_iface), verdict)| {
                format!("{} . {} : {}", quoted(in_iface), quoted(out_iface), verdict)
            })
            .collect();
        b.elements(MAP_FORWARD_VMAP, &elements);
    }

    // single-lookup dispatch replaces any linear jump list
    b.rule(CHAIN_INPUT, &format!("iifname vmap @{MAP_INPUT_VMAP}"));
    b.rule(
        CHAIN_FORWARD,
        &format!("meta iifname . meta oifname vmap @{MAP_FORWARD_VMAP}"),
    );

    Ok(())
}

fn final_rules(b: &mut ScriptBuilder, config: &Config) {
    match config.options.learning_queue {
        // fail-open: a saturated queue must not black-hole traffic
        Some(queue) => {
            b.rule(CHAIN_INPUT, &format!("queue num {queue} bypass"));
            b.rule(CHAIN_FORWARD, &format!("queue num {queue} bypass"));
        }
        None => {
            b.rule(CHAIN_INPUT, &action_expr(RuleAction::Drop, None, "palisade-drop-input"));
            b.rule(CHAIN_FORWARD, &action_expr(RuleAction::Drop, None, "palisade-drop-forward"));
        }
    }
}

//! Validated, flattened view of the network policy.
//!
//! Everything here is plain owned data, so a deep copy is a `Clone`.
//! Collections stay in declaration order; the compiler sorts where
//! determinism needs it.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub options: Options,
    pub zones: Vec<Zone>,
    pub interfaces: Vec<Interface>,
    pub policies: Vec<Policy>,
    pub nat: Vec<NatRule>,
    pub ipsets: Vec<IpSet>,
    pub protections: Vec<Protection>,
    pub vpn: Vec<VpnProvider>,
    pub dns: DnsConfig,
    pub marks: Vec<MarkRule>,
    pub uid_routes: Vec<UidRoute>,
    pub uplinks: Vec<Uplink>,
    pub scheduled: Vec<ScheduledPolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Fast-path established flows through a flowtable.
    pub flow_offload: bool,
    /// Clamp TCP MSS to PMTU on forward.
    pub mss_clamp: bool,
    /// Inline rule learning: final drops become `queue num N bypass`.
    pub learning_queue: Option<u16>,
    /// Integrity poll cadence override, e.g. `"5s"`.
    #[serde(with = "humantime_serde")]
    pub integrity_poll: Option<std::time::Duration>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Management {
    pub ssh: bool,
    pub web: bool,
    pub api: bool,
    pub icmp: bool,
    pub snmp: bool,
    pub syslog: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Services {
    pub dns: bool,
    pub ntp: bool,
    pub dhcp: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Zone {
    pub name: String,
    /// Interfaces declared directly on the zone.
    pub interfaces: Vec<String>,
    /// Interface name patterns (`*`, trailing-`*` prefix, exact).
    pub match_interfaces: Vec<String>,
    /// CIDR networks belonging to this zone.
    pub networks: Vec<String>,
    pub external: bool,
    pub management: Management,
    pub services: Services,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Interface {
    pub name: String,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
    pub zone: Option<String>,
    pub dhcp: bool,
    /// Nonzero and != 254 selects split routing through this table.
    pub routing_table: u32,
    /// Overrides the zone-level management toggles when present.
    pub management: Option<Management>,
    pub access_web_ui: bool,
    pub web_ui_port: Option<u16>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Accept,
    #[default]
    Drop,
    Reject,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Accept => "accept",
            RuleAction::Drop => "drop",
            RuleAction::Reject => "reject",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub from: String,
    pub to: String,
    pub action: RuleAction,
    pub masquerade: bool,
    pub enabled: bool,
    pub rules: Vec<PolicyRule>,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            from: String::new(),
            to: String::new(),
            action: RuleAction::Drop,
            masquerade: false,
            enabled: true,
            rules: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRule {
    /// Stable id used in the rule comment; falls back to `name`.
    pub id: Option<String>,
    pub name: Option<String>,
    /// `tcp`, `udp`, `icmp` or `any`.
    pub protocol: Option<String>,
    pub source_ip: Option<String>,
    pub src_ipset: Option<String>,
    pub dest_ip: Option<String>,
    pub dest_ipset: Option<String>,
    pub dest_port: Option<String>,
    pub conn_state: Vec<String>,
    pub geoip_src: Option<String>,
    pub geoip_dest: Option<String>,
    /// `HH:MM` or `HH:MM:SS`, both ends required for a window.
    pub time_start: Option<String>,
    pub time_end: Option<String>,
    pub days: Vec<String>,
    pub action: RuleAction,
    pub counter: Option<String>,
    pub enabled: bool,
}

impl Default for PolicyRule {
    fn default() -> Self {
        PolicyRule {
            id: None,
            name: None,
            protocol: None,
            source_ip: None,
            src_ipset: None,
            dest_ip: None,
            dest_ipset: None,
            dest_port: None,
            conn_state: Vec::new(),
            geoip_src: None,
            geoip_dest: None,
            time_start: None,
            time_end: None,
            days: Vec::new(),
            action: RuleAction::Accept,
            counter: None,
            enabled: true,
        }
    }
}

impl PolicyRule {
    /// Label used in the emitted `comment "rule:<..>"`.
    pub fn label(&self) -> Option<&str> {
        self.id.as_deref().or(self.name.as_deref())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatKind {
    Masquerade,
    Dnat,
    Snat,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatRule {
    pub kind: NatKind,
    /// Interface name or zone name; zones expand to their interfaces.
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub protocol: Option<String>,
    pub source_ip: Option<String>,
    pub dest_ip: Option<String>,
    pub mark: Option<u32>,
    pub dest_port: Option<String>,
    pub to_ip: Option<String>,
    pub to_port: Option<u16>,
    pub hairpin: bool,
}

impl Default for NatRule {
    fn default() -> Self {
        NatRule {
            kind: NatKind::Masquerade,
            in_interface: None,
            out_interface: None,
            protocol: None,
            source_ip: None,
            dest_ip: None,
            mark: None,
            dest_port: None,
            to_ip: None,
            to_port: None,
            hairpin: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpSetType {
    Ipv4Addr,
    Ipv6Addr,
    InetService,
    /// DNS-resolved allowlist; contents outlive applies.
    Dns,
    /// Runtime-populated set; contents outlive applies.
    Dynamic,
}

impl IpSetType {
    pub fn element_type(&self) -> &'static str {
        match self {
            IpSetType::Ipv4Addr | IpSetType::Dns | IpSetType::Dynamic => "ipv4_addr",
            IpSetType::Ipv6Addr => "ipv6_addr",
            IpSetType::InetService => "inet_service",
        }
    }

    /// Dynamic sets are declared but never flushed by an apply.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, IpSetType::Dns | IpSetType::Dynamic)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyTo {
    Input,
    Forward,
    #[default]
    Both,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpSet {
    pub name: String,
    pub set_type: IpSetType,
    pub entries: Vec<String>,
    /// Well-known list name resolved by the fetcher.
    pub list: Option<String>,
    pub url: Option<String>,
    pub auto_update: bool,
    pub refresh_hours: u32,
    /// When set, blocklist rules are generated for this set.
    pub action: Option<RuleAction>,
    pub apply_to: ApplyTo,
    pub match_on_source: bool,
    pub match_on_dest: bool,
}

impl Default for IpSet {
    fn default() -> Self {
        IpSet {
            name: String::new(),
            set_type: IpSetType::Ipv4Addr,
            entries: Vec::new(),
            list: None,
            url: None,
            auto_update: false,
            refresh_hours: 24,
            action: None,
            apply_to: ApplyTo::Both,
            match_on_source: true,
            match_on_dest: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Protection {
    /// Interface name or `*` for every interface.
    pub interface: String,
    pub anti_spoofing: bool,
    pub block_bogons: bool,
    pub drop_invalid: bool,
    pub syn_flood_rate: Option<u32>,
    pub syn_flood_burst: Option<u32>,
    pub icmp_rate: Option<u32>,
}

impl Default for Protection {
    fn default() -> Self {
        Protection {
            interface: "*".to_string(),
            anti_spoofing: false,
            block_bogons: false,
            drop_invalid: false,
            syn_flood_rate: None,
            syn_flood_burst: None,
            icmp_rate: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnProvider {
    pub name: String,
    pub kind: String,
    pub interface: String,
    pub port: Option<u16>,
    /// Emits the four lockout-protection accepts for this provider.
    pub management_access: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub egress_filter: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkRule {
    pub name: Option<String>,
    pub in_interface: Option<String>,
    pub out_interface: Option<String>,
    pub protocol: Option<String>,
    pub dest_port: Option<String>,
    pub mark: u32,
    pub save_mark: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UplinkKind {
    Wan,
    Wireguard,
    Tailscale,
    Custom,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Uplink {
    pub name: String,
    pub kind: UplinkKind,
    pub index: u32,
    /// Mark base for `kind = custom`.
    pub custom_base: Option<u32>,
}

impl Default for Uplink {
    fn default() -> Self {
        Uplink {
            name: String::new(),
            kind: UplinkKind::Wan,
            index: 0,
            custom_base: None,
        }
    }
}

impl Uplink {
    /// Routing mark for this uplink.
    pub fn mark(&self) -> u32 {
        let base = match self.kind {
            UplinkKind::Wan => 0x0100,
            UplinkKind::Wireguard => 0x0200,
            UplinkKind::Tailscale => 0x0220,
            UplinkKind::Custom => self.custom_base.unwrap_or(0x0300),
        };
        base + self.index
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UidRoute {
    pub uid: u32,
    pub uplink: String,
}

impl Default for UidRoute {
    fn default() -> Self {
        UidRoute {
            uid: 0,
            uplink: String::new(),
        }
    }
}

/// Named policy overlay toggled by the scheduler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduledRule {
    pub name: String,
    pub policy: Policy,
}

/// Configured scheduled rule: the overlay plus its activation window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduledPolicy {
    pub name: String,
    /// `HH:MM`.
    pub start: String,
    pub end: String,
    /// Empty means every day.
    pub days: Vec<String>,
    pub policy: Policy,
}

impl Default for ScheduledPolicy {
    fn default() -> Self {
        ScheduledPolicy {
            name: String::new(),
            start: "00:00".to_string(),
            end: "00:00".to_string(),
            days: Vec::new(),
            policy: Policy::default(),
        }
    }
}

impl Config {
    /// Stable string form used for the generation-tag hash. JSON of owned
    /// vectors in declaration order is deterministic for equal configs.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn zone(&self, name: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.name == name)
    }

    /// Effective management toggles for an interface: the interface override
    /// when present, else its zone's block.
    pub fn management_for(&self, interface: &str) -> Management {
        if let Some(iface) = self.interface(interface) {
            if let Some(m) = &iface.management {
                return m.clone();
            }
            if let Some(zone_name) = &iface.zone {
                if let Some(zone) = self.zone(zone_name) {
                    return zone.management.clone();
                }
            }
        }
        for zone in &self.zones {
            if zone.interfaces.iter().any(|i| i == interface) {
                return zone.management.clone();
            }
        }
        Management::default()
    }

    /// Interfaces that may reach the web UI or API; these get anti-lockout
    /// rules and `route_localnet`.
    pub fn web_api_interfaces(&self) -> Vec<String> {
        let mut out = Vec::new();
        for iface in &self.interfaces {
            let mgmt = self.management_for(&iface.name);
            if iface.access_web_ui || mgmt.web || mgmt.api || mgmt.ssh {
                out.push(iface.name.clone());
            }
        }
        out
    }
}

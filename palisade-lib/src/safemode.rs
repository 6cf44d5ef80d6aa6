//! Safe mode: a pre-rendered minimal lockdown applied in one transaction.
//!
//! Forwarding dies (no established/related accept on forward, policy
//! drop), management stays reachable on the trusted interfaces, and the
//! router keeps the outbound basics it needs to stay debuggable: DNS,
//! DHCP, ICMP, the VPN control ports. The script is rendered when the
//! configuration loads so entering safe mode costs one apply and nothing
//! else.

use std::sync::Arc;

use crate::compile::{CHAIN_FORWARD, CHAIN_INPUT, CHAIN_OUTPUT, TABLE};
use crate::config::{Config, RuleAction};
use crate::kernel::Backend;
use crate::manager::RuleSetManager;
use crate::script::{quoted, ChainSpec, Family, Script, ScriptBuilder};
use crate::Error;

pub const TAILSCALE_PORT: u16 = 41641;
pub const WIREGUARD_PORT: u16 = 51820;

const MANAGEMENT_PORTS: &str = "22, 80, 443, 8080, 8443";

pub struct SafeMode {
    script: Script,
    trusted: Vec<String>,
}

impl SafeMode {
    /// Pre-render the lockdown for a set of trusted management interfaces.
    /// Two renders with the same trusted set are byte-identical.
    pub fn pre_render(trusted_interfaces: &[String]) -> Self {
        let mut trusted: Vec<String> = trusted_interfaces.to_vec();
        trusted.sort();
        trusted.dedup();
        let script = render(&trusted);
        SafeMode { script, trusted }
    }

    /// Trusted interfaces derived from the configuration's management
    /// surface.
    pub fn from_config(config: &Config) -> Self {
        Self::pre_render(&config.web_api_interfaces())
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn trusted(&self) -> &[String] {
        &self.trusted
    }

    /// Commit the pre-rendered lockdown atomically.
    pub async fn apply(&self, backend: &Arc<dyn Backend>) -> Result<(), Error> {
        backend.apply(&self.script).await.map_err(|e| Error::Apply {
            detail: format!("safe mode apply failed: {e}"),
        })
    }
}

/// Leave safe mode by re-applying the last loaded configuration.
pub async fn exit_safe_mode(manager: &RuleSetManager) -> Result<(), Error> {
    manager.restore_current().await
}

fn render(trusted: &[String]) -> Script {
    let mut b = ScriptBuilder::new(Family::Inet, TABLE);
    b.table(None);
    b.raw(format!("flush table inet {TABLE}"));

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

    // forward deliberately omits established/related so existing forwarded
    // flows die with the lockdown
    b.rule(CHAIN_INPUT, "ct state established,related accept");
    b.rule(CHAIN_OUTPUT, "ct state established,related accept");

    b.rule(CHAIN_INPUT, "iifname \"lo\" accept");
    b.rule(CHAIN_OUTPUT, "oifname \"lo\" accept");

    b.rule(CHAIN_INPUT, "meta l4proto icmp accept");
    b.rule(CHAIN_INPUT, "meta l4proto icmpv6 accept");
    b.rule(CHAIN_OUTPUT, "meta l4proto icmp accept");
    b.rule(CHAIN_OUTPUT, "meta l4proto icmpv6 accept");

    // the router's own resolver
    b.rule(CHAIN_OUTPUT, "udp dport 53 accept");
    b.rule(CHAIN_OUTPUT, "tcp dport 53 accept");

    // DHCP
    b.rule(CHAIN_INPUT, "udp dport { 67, 68 } accept");
    b.rule(CHAIN_OUTPUT, "udp dport { 67, 68 } accept");

    // VPN control paths stay up
    b.rule(CHAIN_INPUT, &format!("udp dport {{ {TAILSCALE_PORT}, {WIREGUARD_PORT} }} accept"));
    b.rule(CHAIN_OUTPUT, &format!("udp dport {{ {TAILSCALE_PORT}, {WIREGUARD_PORT} }} accept"));
    for pattern in ["wg*", "tailscale*"] {
        b.rule(CHAIN_INPUT, &format!("iifname {} accept", quoted(pattern)));
        b.rule(CHAIN_OUTPUT, &format!("oifname {} accept", quoted(pattern)));
    }

    // management, restricted to the trusted interfaces when any exist
    if trusted.is_empty() {
        b.rule(CHAIN_INPUT, &format!("tcp dport {{ {MANAGEMENT_PORTS} }} accept"));
    } else {
        let list: Vec<String> = trusted.iter().map(|t| quoted(t)).collect();
        b.rule(
            CHAIN_INPUT,
            &format!(
                "iifname {{ {} }} tcp dport {{ {MANAGEMENT_PORTS} }} accept",
                list.join(", ")
            ),
        );
    }

    // rate-limited logging on everything that dies here
    b.rule(
        CHAIN_INPUT,
        &crate::compile::policy_action(RuleAction::Drop, "palisade-safemode-input"),
    );
    b.rule(
        CHAIN_FORWARD,
        &crate::compile::policy_action(RuleAction::Drop, "palisade-safemode-forward"),
    );
    b.rule(
        CHAIN_OUTPUT,
        &crate::compile::policy_action(RuleAction::Drop, "palisade-safemode-output"),
    );

    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MemoryBackend;

    #[test]
    fn pre_render_is_byte_identical() {
        let a = SafeMode::pre_render(&["eth1".to_string()]);
        let b = SafeMode::pre_render(&["eth1".to_string()]);
        assert_eq!(a.script().text(), b.script().text());
    }

    #[test]
    fn forward_has_no_stateful_accept() {
        let safe = SafeMode::pre_render(&[]);
        for line in safe.script().lines() {
            if line.contains(" forward ") {
                assert!(!line.contains("established"), "forward must not keep flows: {line}");
            }
        }
    }

    #[test]
    fn management_restricted_to_trusted_interfaces() {
        let safe = SafeMode::pre_render(&["eth1".to_string()]);
        let text = safe.script().text();
        assert!(text.contains("iifname { \"eth1\" } tcp dport { 22, 80, 443, 8080, 8443 } accept"));

        let open = SafeMode::pre_render(&[]);
        assert!(open.script().text().contains("add rule inet palisade input tcp dport { 22, 80, 443, 8080, 8443 } accept"));
    }

    #[tokio::test]
    async fn applies_atomically_and_flushes_managed_table() {
        let backend = MemoryBackend::new();
        let arc: Arc<dyn Backend> = Arc::new(backend.clone());
        // something is already live
        let mut b = ScriptBuilder::new(Family::Inet, TABLE);
        b.table(None);
        b.raw(format!("add chain inet {TABLE} input"));
        b.rule("input", "tcp dport 9999 accept");
        backend.apply(&b.build()).await.unwrap();

        let safe = SafeMode::pre_render(&["eth1".to_string()]);
        safe.apply(&arc).await.unwrap();

        let rules = backend.chain_rules(Family::Inet, TABLE, "input");
        assert!(!rules.iter().any(|r| r.contains("9999")));
        assert!(rules.iter().any(|r| r.contains("8443")));
    }
}

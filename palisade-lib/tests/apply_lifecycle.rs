mod common;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use palisade_lib::compile::TABLE;
use palisade_lib::config::{IpSet, IpSetType, RuleAction};
use palisade_lib::dynamic;
use palisade_lib::kernel::Backend;
use palisade_lib::safemode::{self, SafeMode};
use palisade_lib::script::Family;

#[tokio::test]
async fn lan_to_wan_policy_lands_in_kernel() {
    let h = common::harness();
    h.manager.apply(common::lan_wan_config()).await.unwrap();

    let policy_rules = h.backend.chain_rules(Family::Inet, TABLE, "policy_LAN_WAN");
    assert!(policy_rules
        .iter()
        .any(|r| r.starts_with("meta l4proto tcp tcp dport 443 counter accept")));
    // terminal default-action rule
    assert!(policy_rules.last().unwrap().contains("counter accept"));

    let vmap = h.backend.set_elements(Family::Inet, TABLE, "forward_vmap");
    assert!(vmap.contains(&"\"eth1\" . \"eth0\" : jump policy_LAN_WAN".to_string()));

    let forward = h.backend.chain_rules(Family::Inet, TABLE, "forward");
    assert!(forward
        .iter()
        .any(|r| r == "meta iifname . meta oifname vmap @forward_vmap"));
}

#[tokio::test]
async fn auto_masquerade_for_internal_to_external_policy() {
    let h = common::harness();
    h.manager.apply(common::lan_wan_config()).await.unwrap();

    let postrouting = h.backend.chain_rules(Family::Ip, "nat", "postrouting");
    let masq: Vec<&String> = postrouting
        .iter()
        .filter(|r| r.contains("oifname \"eth0\" masquerade"))
        .collect();
    assert_eq!(masq.len(), 1);
}

#[tokio::test]
async fn dynamic_set_contents_survive_applies() {
    let h = common::harness();
    let mut config = common::lan_wan_config();
    config.ipsets.push(IpSet {
        name: "resolved_hosts".to_string(),
        set_type: IpSetType::Dynamic,
        ..Default::default()
    });
    h.manager.apply(config.clone()).await.unwrap();

    h.ipsets
        .add_elements("resolved_hosts", &["203.0.113.10".to_string()])
        .await
        .unwrap();
    assert!(h.ipsets.contains("resolved_hosts", "203.0.113.10").await);

    // several applies later the contents are still there
    h.manager.apply(config.clone()).await.unwrap();
    h.manager.apply(config).await.unwrap();

    let kernel_side = h.backend.set_elements(Family::Inet, TABLE, "resolved_hosts");
    assert_eq!(kernel_side, vec!["203.0.113.10".to_string()]);
    assert!(h.ipsets.contains("resolved_hosts", "203.0.113.10").await);
}

#[tokio::test]
async fn static_url_set_replayed_after_apply() {
    let h = common::harness();
    let mut config = common::lan_wan_config();
    config.ipsets.push(IpSet {
        name: "badguys".to_string(),
        url: Some("https://example.test/list".to_string()),
        action: Some(RuleAction::Drop),
        ..Default::default()
    });
    h.manager.apply(config.clone()).await.unwrap();

    // the fetcher delivered content at runtime
    h.ipsets
        .atomic_reload("badguys", &["198.51.100.7".to_string()])
        .await
        .unwrap();

    // an apply flushes the static set, then the manager replays the mirror
    h.manager.apply(config).await.unwrap();
    let kernel_side = h.backend.set_elements(Family::Inet, TABLE, "badguys");
    assert_eq!(kernel_side, vec!["198.51.100.7".to_string()]);
}

#[tokio::test]
async fn dns_wall_with_authorize_ip() {
    let h = common::harness();
    let mut config = common::lan_wan_config();
    config.dns.egress_filter = true;
    h.manager.apply(config).await.unwrap();

    let forward = h.backend.chain_rules(Family::Inet, TABLE, "forward");
    assert!(forward
        .iter()
        .any(|r| r == "ip daddr != @dns_allowed_v4 ct state new reject with icmp type admin-prohibited"));

    dynamic::authorize_ip(&h.ipsets, "8.8.8.8".parse::<IpAddr>().unwrap(), Duration::from_secs(300))
        .await
        .unwrap();
    let allowed = h.backend.set_elements(Family::Inet, TABLE, "dns_allowed_v4");
    assert_eq!(allowed, vec!["8.8.8.8 timeout 300s".to_string()]);
    assert!(h.ipsets.contains("dns_allowed_v4", "8.8.8.8").await);
}

#[tokio::test]
async fn safe_mode_round_trip() {
    let h = common::harness();
    h.manager.apply(common::lan_wan_config()).await.unwrap();

    let safe = SafeMode::from_config(&common::lan_wan_config());
    let backend: Arc<dyn Backend> = Arc::new(h.backend.clone());
    safe.apply(&backend).await.unwrap();

    let input = h.backend.chain_rules(Family::Inet, TABLE, "input");
    // eth1 grants web ui access, so it is the trusted management interface
    assert!(input
        .iter()
        .any(|r| r == "iifname { \"eth1\" } tcp dport { 22, 80, 443, 8080, 8443 } accept"));
    let forward = h.backend.chain_rules(Family::Inet, TABLE, "forward");
    assert!(!forward.iter().any(|r| r.contains("established")));
    // the policy dispatch died with the lockdown
    assert!(!input.iter().any(|r| r.contains("vmap")));

    safemode::exit_safe_mode(&h.manager).await.unwrap();
    let input = h.backend.chain_rules(Family::Inet, TABLE, "input");
    assert!(input.iter().any(|r| r.contains("vmap @input_vmap")));

    // the expectation matches the restored ruleset
    let live = h.backend.list_ruleset().await.unwrap().generation_hash(TABLE);
    assert_eq!(h.manager.expected_generation().await, Some(live));
}

#[tokio::test]
async fn empty_config_applies_cleanly() {
    let h = common::harness();
    h.manager.apply(Default::default()).await.unwrap();
    let input = h.backend.chain_rules(Family::Inet, TABLE, "input");
    assert!(input.iter().any(|r| r == "iifname \"lo\" accept"));
    assert!(h.manager.expected_generation().await.is_some());
}

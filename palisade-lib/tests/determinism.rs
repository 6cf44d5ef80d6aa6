mod common;

use palisade_lib::compile::{self, TABLE};
use palisade_lib::config::{Policy, PolicyRule, RuleAction};
use palisade_lib::metadata::GenerationTag;

#[test]
fn compile_is_a_function_of_config_and_tag() {
    let config = common::lan_wan_config();
    let tag = GenerationTag::new(7, "cafef00d");
    let a = compile::compile(&config, &tag).unwrap();
    let b = compile::compile(&config, &tag).unwrap();
    assert_eq!(a.combined().text(), b.combined().text());
}

#[test]
fn only_the_counter_moves_between_applies() {
    let config = common::lan_wan_config();
    let a = compile::compile(&config, &GenerationTag::new(1, "cafef00d")).unwrap();
    let b = compile::compile(&config, &GenerationTag::new(2, "cafef00d")).unwrap();

    let a_lines = a.combined();
    let b_lines = b.combined();
    let differing: Vec<(&String, &String)> = a_lines
        .lines()
        .iter()
        .zip(b_lines.lines())
        .filter(|(x, y)| x != y)
        .collect();
    assert_eq!(differing.len(), 1);
    assert!(differing[0].0.contains("c=1"));
    assert!(differing[0].1.contains("c=2"));
}

#[test]
fn every_policy_chain_has_a_terminal_default() {
    let mut config = common::lan_wan_config();
    config.policies.push(Policy {
        from: "WAN".to_string(),
        to: "firewall".to_string(),
        action: RuleAction::Drop,
        rules: vec![PolicyRule {
            protocol: Some("tcp".to_string()),
            dest_port: Some("22".to_string()),
            action: RuleAction::Drop,
            ..Default::default()
        }],
        ..Default::default()
    });
    let compiled = compile::compile(&config, &GenerationTag::new(1, "cafef00d")).unwrap();

    let lines = compiled.filter.lines();
    let chains: Vec<String> = lines
        .iter()
        .filter_map(|l| l.strip_prefix(&format!("add chain inet {TABLE} policy_")))
        .map(|rest| format!("policy_{}", rest.split_whitespace().next().unwrap()))
        .collect();
    assert!(!chains.is_empty());
    for chain in chains {
        let last_rule = lines
            .iter()
            .filter(|l| l.starts_with(&format!("add rule inet {TABLE} {chain} ")))
            .next_back()
            .expect("chain has rules");
        assert!(
            last_rule.ends_with("accept") || last_rule.ends_with("drop") || last_rule.ends_with("reject"),
            "no terminal verdict in {chain}: {last_rule}"
        );
    }
}

#[tokio::test]
async fn terminal_state_is_independent_of_history() {
    let first = common::harness();
    first.manager.apply(common::lan_wan_config()).await.unwrap();
    let mut other = common::lan_wan_config();
    other.policies[0].rules[0].dest_port = Some("80".to_string());
    first.manager.apply(other.clone()).await.unwrap();

    let fresh = common::harness();
    fresh.manager.apply(other).await.unwrap();

    // same chains and rules regardless of what was applied before
    for chain in ["input", "forward", "output", "policy_LAN_WAN"] {
        assert_eq!(
            first.backend.chain_rules(palisade_lib::script::Family::Inet, TABLE, chain),
            fresh.backend.chain_rules(palisade_lib::script::Family::Inet, TABLE, chain),
            "chain {chain} differs"
        );
    }
}

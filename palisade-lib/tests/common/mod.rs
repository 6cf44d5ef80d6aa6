#![allow(dead_code)]

use std::sync::Arc;

use palisade_lib::config::{Config, Interface, Policy, PolicyRule, RuleAction, Zone};
use palisade_lib::ipset::IpSetManager;
use palisade_lib::kernel::{Backend, MemoryBackend};
use palisade_lib::manager::{RecordingSysctl, RuleSetManager};

pub struct Harness {
    pub backend: MemoryBackend,
    pub manager: Arc<RuleSetManager>,
    pub ipsets: Arc<IpSetManager>,
}

pub fn harness() -> Harness {
    let backend = MemoryBackend::new();
    let arc_backend: Arc<dyn Backend> = Arc::new(backend.clone());
    let ipsets = Arc::new(IpSetManager::new(arc_backend.clone()));
    let manager = Arc::new(RuleSetManager::new(
        arc_backend,
        ipsets.clone(),
        Arc::new(RecordingSysctl::default()),
    ));
    Harness {
        backend,
        manager,
        ipsets,
    }
}

pub fn lan_wan_config() -> Config {
    Config {
        zones: vec![
            Zone {
                name: "LAN".to_string(),
                interfaces: vec!["eth1".to_string()],
                ..Default::default()
            },
            Zone {
                name: "WAN".to_string(),
                interfaces: vec!["eth0".to_string()],
                external: true,
                ..Default::default()
            },
        ],
        interfaces: vec![
            Interface {
                name: "eth0".to_string(),
                dhcp: true,
                ..Default::default()
            },
            Interface {
                name: "eth1".to_string(),
                ipv4: vec!["192.168.1.1/24".to_string()],
                access_web_ui: true,
                ..Default::default()
            },
        ],
        policies: vec![Policy {
            from: "LAN".to_string(),
            to: "WAN".to_string(),
            action: RuleAction::Accept,
            rules: vec![PolicyRule {
                protocol: Some("tcp".to_string()),
                dest_port: Some("443".to_string()),
                action: RuleAction::Accept,
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

use serde::Deserialize;

use super::model;

/// Version 1 of the on-disk configuration document.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[allow(dead_code)]
    pub version: u8,
    #[serde(flatten)]
    pub inner: model::Config,
}

const KNOWN_KEYS: &[&str] = &[
    "version",
    "options",
    "zones",
    "interfaces",
    "policies",
    "nat",
    "ipsets",
    "protections",
    "vpn",
    "dns",
    "marks",
    "uid_routes",
    "uplinks",
    "scheduled",
];

pub fn wrong_keys(table: &toml::Table) -> Vec<String> {
    table
        .keys()
        .filter(|k| !KNOWN_KEYS.contains(&k.as_str()))
        .cloned()
        .collect()
}

impl From<Config> for model::Config {
    fn from(value: Config) -> Self {
        let mut config = value.inner;
        // Country codes are case-insensitive on input, uppercase internally.
        for policy in &mut config.policies {
            for rule in &mut policy.rules {
                if let Some(cc) = &rule.geoip_src {
                    rule.geoip_src = Some(cc.to_ascii_uppercase());
                }
                if let Some(cc) = &rule.geoip_dest {
                    rule.geoip_dest = Some(cc.to_ascii_uppercase());
                }
            }
        }
        config
    }
}

//! Anti-lockout table: a high-priority accept path for management traffic
//! so no misconfiguration can cut administrators off from the UI.
//!
//! Lives in its own table at priority -10 so it survives every apply of the
//! managed table, and the integrity monitor knows not to treat it as
//! foreign.

use crate::script::{quoted, ChainSpec, Family, Script, ScriptBuilder};

pub const LOCKOUT_TABLE: &str = "palisade-lockout";
pub const LOCKOUT_CHAIN: &str = "input";

/// Management ports the anti-lockout path always admits.
pub const LOCKOUT_PORTS: &str = "8080, 8443";

/// Render the anti-lockout table for the given interfaces. Loopback is
/// always included. Deterministic for a given interface list.
pub fn lockout_script(interfaces: &[String]) -> Script {
    let mut names: Vec<String> = interfaces.to_vec();
    names.push("lo".to_string());
    names.sort();
    names.dedup();

    let mut b = ScriptBuilder::new(Family::Inet, LOCKOUT_TABLE);
    b.table(None);
    b.chain(
        LOCKOUT_CHAIN,
        &ChainSpec {
            chain_type: "filter",
            hook: "input",
            priority: -10,
            policy: "accept",
        },
    );
    let list: Vec<String> = names.iter().map(|n| quoted(n)).collect();
    b.rule(
        LOCKOUT_CHAIN,
        &format!(
            "iifname {{ {} }} tcp dport {{ {LOCKOUT_PORTS} }} accept",
            list.join(", ")
        ),
    );
    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_always_present_and_output_deterministic() {
        let a = lockout_script(&["eth1".to_string(), "eth0".to_string()]);
        let b = lockout_script(&["eth0".to_string(), "eth1".to_string()]);
        assert_eq!(a.text(), b.text());
        assert!(a.text().contains("\"lo\""));
        assert!(a.text().contains("tcp dport { 8080, 8443 } accept"));
    }
}

//! Kernel ruleset backend.
//!
//! Scripts are fed to the kernel as the same text an administrator would
//! type, through `nft -f -`. Validation is a dry run (`nft -c -f -`) that
//! must surface any parse error before kernel state changes. The backend is
//! a trait so the rest of the crate never branches on platform; the
//! in-memory implementation backs tests and non-Linux builds.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use std::collections::BTreeMap;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use crate::script::{Family, Script};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn nft: {0}")]
    Spawn(io::Error),
    #[error("script rejected by check phase: {stderr}")]
    Rejected { stderr: String },
    #[error("apply transaction failed: {stderr}")]
    Failed { stderr: String },
    #[error("unreadable nft output: {0}")]
    Parse(String),
    #[error("kernel ruleset backend unavailable")]
    Unavailable,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// Capability set of the ruleset backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Dry-run the script. Must not mutate kernel state.
    async fn check(&self, script: &Script) -> Result<(), Error>;
    /// Apply the script as one transaction. An empty script is legal.
    async fn apply(&self, script: &Script) -> Result<(), Error>;
    /// Parsed view of the live ruleset.
    async fn list_ruleset(&self) -> Result<RulesetView, Error>;
    /// Re-appliable textual form of the live ruleset, for checkpoints.
    async fn ruleset_text(&self) -> Result<String, Error>;
    async fn delete_table(&self, family: Family, name: &str) -> Result<(), Error>;
}

/// The slice of `nft -j list ruleset` the control plane cares about.
#[derive(Clone, Debug, Default)]
pub struct RulesetView {
    /// (family, table name) of every table in the ruleset.
    pub tables: Vec<(String, String)>,
    /// Table comments keyed by (family, table name).
    pub table_comments: BTreeMap<(String, String), String>,
    /// Rule count per (table, chain) of the managed table's family.
    pub chain_rule_counts: BTreeMap<(String, String), usize>,
    /// Rule handles keyed by table name.
    pub rule_handles: BTreeMap<String, Vec<u64>>,
}

impl RulesetView {
    pub fn from_json(doc: &Value) -> Result<Self, Error> {
        let objects = doc
            .get("nftables")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Parse("missing nftables array".to_string()))?;

        let mut view = RulesetView::default();
        for object in objects {
            if let Some(table) = object.get("table") {
                let family = table.get("family").and_then(Value::as_str).unwrap_or_default().to_string();
                let name = table.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                if let Some(comment) = table.get("comment").and_then(Value::as_str) {
                    view.table_comments.insert((family.clone(), name.clone()), comment.to_string());
                }
                view.tables.push((family, name));
            } else if let Some(rule) = object.get("rule") {
                let table = rule.get("table").and_then(Value::as_str).unwrap_or_default().to_string();
                let chain = rule.get("chain").and_then(Value::as_str).unwrap_or_default().to_string();
                *view.chain_rule_counts.entry((table.clone(), chain)).or_default() += 1;
                if let Some(handle) = rule.get("handle").and_then(Value::as_u64) {
                    view.rule_handles.entry(table).or_default().push(handle);
                }
            }
        }
        Ok(view)
    }

    /// Fingerprint of the managed table within the live ruleset: table count
    /// plus per-chain rule counts plus the sum of rule handles. Any
    /// out-of-band insertion, deletion or replacement moves it.
    pub fn generation_hash(&self, managed_table: &str) -> u64 {
        let tables = self.tables.len() as u64;
        let rules: u64 = self
            .chain_rule_counts
            .iter()
            .filter(|((table, _), _)| table == managed_table)
            .map(|(_, count)| *count as u64)
            .sum();
        let handles: u64 = self
            .rule_handles
            .get(managed_table)
            .map(|handles| handles.iter().sum())
            .unwrap_or(0);
        tables + rules + handles
    }

    /// Tables other than the managed one, in every family.
    pub fn foreign_tables(&self, managed: &[(Family, &str)]) -> Vec<(String, String)> {
        self.tables
            .iter()
            .filter(|(family, name)| {
                !managed
                    .iter()
                    .any(|(mf, mn)| mf.as_str() == family && *mn == name)
            })
            .cloned()
            .collect()
    }

    pub fn table_comment(&self, family: Family, name: &str) -> Option<&str> {
        self.table_comments
            .get(&(family.as_str().to_string(), name.to_string()))
            .map(String::as_str)
    }
}

/// Production backend shelling out to the `nft` tool.
#[derive(Clone, Debug, Default)]
pub struct NftCli;

impl NftCli {
    pub fn new() -> Self {
        NftCli
    }

    async fn run_with_stdin(&self, args: &[&str], input: &str) -> Result<(), Error> {
        let mut child = Command::new("nft")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Failed {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

fn spawn_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::Unavailable
    } else {
        Error::Spawn(e)
    }
}

#[async_trait]
impl Backend for NftCli {
    async fn check(&self, script: &Script) -> Result<(), Error> {
        if script.is_empty() {
            return Ok(());
        }
        self.run_with_stdin(&["-c", "-f", "-"], &script.text())
            .await
            .map_err(|e| match e {
                Error::Failed { stderr } => Error::Rejected { stderr },
                other => other,
            })
    }

    async fn apply(&self, script: &Script) -> Result<(), Error> {
        if script.is_empty() {
            return Ok(());
        }
        self.run_with_stdin(&["-f", "-"], &script.text()).await
    }

    async fn list_ruleset(&self) -> Result<RulesetView, Error> {
        let output = Command::new("nft")
            .args(["-j", "list", "ruleset"])
            .output()
            .await
            .map_err(spawn_error)?;
        if !output.status.success() {
            return Err(Error::Failed {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let doc: Value = serde_json::from_slice(&output.stdout).map_err(|e| Error::Parse(e.to_string()))?;
        RulesetView::from_json(&doc)
    }

    async fn ruleset_text(&self) -> Result<String, Error> {
        let output = Command::new("nft")
            .args(["list", "ruleset"])
            .output()
            .await
            .map_err(spawn_error)?;
        if !output.status.success() {
            return Err(Error::Failed {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn delete_table(&self, family: Family, name: &str) -> Result<(), Error> {
        let output = Command::new("nft")
            .args(["delete", "table", family.as_str(), name])
            .output()
            .await
            .map_err(spawn_error)?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // absent table is a satisfied delete
        if stderr.contains("No such file or directory") {
            return Ok(());
        }
        Err(Error::Failed {
            stderr: stderr.trim().to_string(),
        })
    }
}

#[derive(Clone, Debug, Default)]
struct TableState {
    comment: Option<String>,
    /// chain name -> rules (handle, expression text)
    chains: BTreeMap<String, Vec<(u64, String)>>,
    /// set or map name -> elements
    sets: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<(String, String), TableState>,
    next_handle: u64,
    /// operation name -> error message, for forced failures
    fail_on: BTreeMap<String, String>,
    applied_scripts: Vec<Script>,
}

/// Stateful in-memory backend. Interprets the subset of nft script verbs the
/// builder emits, so tests can assert on resulting table state and the
/// integrity monitor can be driven without a kernel.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }

    pub fn fail_on(&self, op: &str, message: &str) {
        let mut s = self.state.lock().unwrap();
        s.fail_on.insert(op.to_string(), message.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().fail_on.clear();
    }

    pub fn applied_scripts(&self) -> Vec<Script> {
        self.state.lock().unwrap().applied_scripts.clone()
    }

    pub fn table_names(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().tables.keys().cloned().collect()
    }

    pub fn chain_rules(&self, family: Family, table: &str, chain: &str) -> Vec<String> {
        let s = self.state.lock().unwrap();
        s.tables
            .get(&(family.as_str().to_string(), table.to_string()))
            .and_then(|t| t.chains.get(chain))
            .map(|rules| rules.iter().map(|(_, text)| text.clone()).collect())
            .unwrap_or_default()
    }

    pub fn set_elements(&self, family: Family, table: &str, set: &str) -> Vec<String> {
        let s = self.state.lock().unwrap();
        s.tables
            .get(&(family.as_str().to_string(), table.to_string()))
            .and_then(|t| t.sets.get(set))
            .cloned()
            .unwrap_or_default()
    }

    /// Simulate an out-of-band mutation: inject a rule behind the manager's
    /// back so the generation hash moves.
    pub fn tamper_add_rule(&self, family: Family, table: &str, chain: &str, expr: &str) {
        let mut s = self.state.lock().unwrap();
        s.next_handle += 1;
        let handle = s.next_handle;
        if let Some(t) = s.tables.get_mut(&(family.as_str().to_string(), table.to_string())) {
            t.chains.entry(chain.to_string()).or_default().push((handle, expr.to_string()));
        }
    }

    /// Simulate a foreign process creating its own table.
    pub fn tamper_add_table(&self, family: Family, name: &str) {
        let mut s = self.state.lock().unwrap();
        s.tables
            .entry((family.as_str().to_string(), name.to_string()))
            .or_default();
    }

    fn interpret(state: &mut MemoryState, line: &str) -> Result<(), Error> {
        let reject = |line: &str| Error::Rejected {
            stderr: format!("syntax error: {line}"),
        };

        if line == "flush ruleset" {
            state.tables.clear();
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix("add table ") {
            let mut parts = rest.splitn(3, ' ');
            let fam = parts.next().ok_or_else(|| reject(line))?;
            let name = parts.next().ok_or_else(|| reject(line))?;
            let comment = parts
                .next()
                .and_then(|tail| tail.split('"').nth(1))
                .map(str::to_string);
            let entry = state.tables.entry((fam.to_string(), name.to_string())).or_default();
            if comment.is_some() {
                entry.comment = comment;
            }
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix("flush table ") {
            let mut parts = rest.splitn(2, ' ');
            let fam = parts.next().ok_or_else(|| reject(line))?;
            let name = parts.next().ok_or_else(|| reject(line))?;
            if let Some(t) = state.tables.get_mut(&(fam.to_string(), name.to_string())) {
                for rules in t.chains.values_mut() {
                    rules.clear();
                }
            }
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix("delete table ") {
            let mut parts = rest.splitn(2, ' ');
            let fam = parts.next().ok_or_else(|| reject(line))?;
            let name = parts.next().ok_or_else(|| reject(line))?;
            state.tables.remove(&(fam.to_string(), name.to_string()));
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix("add chain ") {
            let mut parts = rest.splitn(4, ' ');
            let fam = parts.next().ok_or_else(|| reject(line))?;
            let table = parts.next().ok_or_else(|| reject(line))?;
            let chain = parts.next().ok_or_else(|| reject(line))?;
            state
                .tables
                .entry((fam.to_string(), table.to_string()))
                .or_default()
                .chains
                .entry(chain.to_string())
                .or_default();
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix("flush chain ") {
            let mut parts = rest.splitn(3, ' ');
            let fam = parts.next().ok_or_else(|| reject(line))?;
            let table = parts.next().ok_or_else(|| reject(line))?;
            let chain = parts.next().ok_or_else(|| reject(line))?;
            if let Some(t) = state.tables.get_mut(&(fam.to_string(), table.to_string())) {
                if let Some(rules) = t.chains.get_mut(chain) {
                    rules.clear();
                }
            }
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix("add rule ") {
            let mut parts = rest.splitn(4, ' ');
            let fam = parts.next().ok_or_else(|| reject(line))?;
            let table = parts.next().ok_or_else(|| reject(line))?;
            let chain = parts.next().ok_or_else(|| reject(line))?;
            let expr = parts.next().ok_or_else(|| reject(line))?.to_string();
            state.next_handle += 1;
            let handle = state.next_handle;
            state
                .tables
                .entry((fam.to_string(), table.to_string()))
                .or_default()
                .chains
                .entry(chain.to_string())
                .or_default()
                .push((handle, expr));
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix("add set ").or_else(|| line.strip_prefix("add map ")) {
            let mut parts = rest.splitn(4, ' ');
            let fam = parts.next().ok_or_else(|| reject(line))?;
            let table = parts.next().ok_or_else(|| reject(line))?;
            let name = parts.next().ok_or_else(|| reject(line))?;
            state
                .tables
                .entry((fam.to_string(), table.to_string()))
                .or_default()
                .sets
                .entry(name.to_string())
                .or_default();
            return Ok(());
        }
        if let Some(rest) = line
            .strip_prefix("flush set ")
            .or_else(|| line.strip_prefix("flush map "))
        {
            let mut parts = rest.splitn(3, ' ');
            let fam = parts.next().ok_or_else(|| reject(line))?;
            let table = parts.next().ok_or_else(|| reject(line))?;
            let name = parts.next().ok_or_else(|| reject(line))?;
            if let Some(t) = state.tables.get_mut(&(fam.to_string(), table.to_string())) {
                if let Some(set) = t.sets.get_mut(name) {
                    set.clear();
                }
            }
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix("add element ") {
            let mut parts = rest.splitn(4, ' ');
            let fam = parts.next().ok_or_else(|| reject(line))?;
            let table = parts.next().ok_or_else(|| reject(line))?;
            let name = parts.next().ok_or_else(|| reject(line))?;
            let elements = parts
                .next()
                .and_then(|tail| tail.trim().strip_prefix('{'))
                .and_then(|tail| tail.strip_suffix('}'))
                .ok_or_else(|| reject(line))?;
            let set = state
                .tables
                .entry((fam.to_string(), table.to_string()))
                .or_default()
                .sets
                .entry(name.to_string())
                .or_default();
            for element in elements.split(',') {
                let element = element.trim().to_string();
                if !element.is_empty() && !set.contains(&element) {
                    set.push(element);
                }
            }
            return Ok(());
        }
        if line.starts_with("delete element ") || line.starts_with("add flowtable ") {
            return Ok(());
        }
        Err(reject(line))
    }

    fn render(state: &MemoryState) -> String {
        let mut out = String::new();
        for ((family, name), table) in &state.tables {
            match &table.comment {
                Some(comment) => {
                    out.push_str(&format!("add table {family} {name} {{ comment \"{comment}\" }}\n"));
                }
                None => out.push_str(&format!("add table {family} {name}\n")),
            }
            for (chain, _) in &table.chains {
                out.push_str(&format!("add chain {family} {name} {chain}\n"));
            }
            for (set, elements) in &table.sets {
                out.push_str(&format!("add set {family} {name} {set}\n"));
                if !elements.is_empty() {
                    out.push_str(&format!(
                        "add element {family} {name} {set} {{ {} }}\n",
                        elements.join(", ")
                    ));
                }
            }
            for (chain, rules) in &table.chains {
                for (_, rule) in rules {
                    out.push_str(&format!("add rule {family} {name} {chain} {rule}\n"));
                }
            }
        }
        out
    }

    fn view(state: &MemoryState) -> RulesetView {
        let mut view = RulesetView::default();
        for ((family, name), table) in &state.tables {
            view.tables.push((family.clone(), name.clone()));
            if let Some(comment) = &table.comment {
                view.table_comments.insert((family.clone(), name.clone()), comment.clone());
            }
            for (chain, rules) in &table.chains {
                view.chain_rule_counts.insert((name.clone(), chain.clone()), rules.len());
                let handles = view.rule_handles.entry(name.clone()).or_default();
                handles.extend(rules.iter().map(|(handle, _)| *handle));
            }
        }
        view
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn check(&self, script: &Script) -> Result<(), Error> {
        let state = self.state.lock().unwrap();
        if let Some(message) = state.fail_on.get("check") {
            return Err(Error::Rejected {
                stderr: message.clone(),
            });
        }
        // parse-only pass over a scratch copy
        let mut scratch = MemoryState {
            tables: state.tables.clone(),
            next_handle: state.next_handle,
            ..Default::default()
        };
        for line in script.lines() {
            Self::interpret(&mut scratch, line)?;
        }
        Ok(())
    }

    async fn apply(&self, script: &Script) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_on.get("apply") {
            return Err(Error::Failed {
                stderr: message.clone(),
            });
        }
        // all-or-nothing: interpret into a copy, swap on success
        let mut next = MemoryState {
            tables: state.tables.clone(),
            next_handle: state.next_handle,
            ..Default::default()
        };
        for line in script.lines() {
            Self::interpret(&mut next, line)?;
        }
        state.tables = next.tables;
        state.next_handle = next.next_handle;
        state.applied_scripts.push(script.clone());
        Ok(())
    }

    async fn list_ruleset(&self) -> Result<RulesetView, Error> {
        let state = self.state.lock().unwrap();
        if let Some(message) = state.fail_on.get("list_ruleset") {
            return Err(Error::Failed {
                stderr: message.clone(),
            });
        }
        Ok(Self::view(&state))
    }

    async fn ruleset_text(&self) -> Result<String, Error> {
        let state = self.state.lock().unwrap();
        if let Some(message) = state.fail_on.get("ruleset_text") {
            return Err(Error::Failed {
                stderr: message.clone(),
            });
        }
        Ok(Self::render(&state))
    }

    async fn delete_table(&self, family: Family, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_on.get("delete_table") {
            return Err(Error::Failed {
                stderr: message.clone(),
            });
        }
        state.tables.remove(&(family.as_str().to_string(), name.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{ChainSpec, ScriptBuilder};

    fn sample_script() -> Script {
        let mut b = ScriptBuilder::new(Family::Inet, "palisade");
        b.table(Some("palisade:v1:c=1:h=aabbccdd"));
        b.chain(
            "input",
            &ChainSpec {
                chain_type: "filter",
                hook: "input",
                priority: 0,
                policy: "drop",
            },
        );
        b.rule("input", "ct state established,related accept");
        b.rule("input", "iifname \"lo\" accept");
        b.set("badguys", "ipv4_addr", &[], None);
        b.elements("badguys", &["192.0.2.1".to_string(), "192.0.2.2".to_string()]);
        b.build()
    }

    #[tokio::test]
    async fn apply_builds_state_and_check_does_not() {
        let backend = MemoryBackend::new();
        backend.check(&sample_script()).await.unwrap();
        assert!(backend.table_names().is_empty());

        backend.apply(&sample_script()).await.unwrap();
        assert_eq!(backend.chain_rules(Family::Inet, "palisade", "input").len(), 2);
        assert_eq!(backend.set_elements(Family::Inet, "palisade", "badguys").len(), 2);
    }

    #[tokio::test]
    async fn failed_apply_leaves_state_untouched() {
        let backend = MemoryBackend::new();
        backend.apply(&sample_script()).await.unwrap();
        let before = backend.list_ruleset().await.unwrap().generation_hash("palisade");

        let mut b = ScriptBuilder::new(Family::Inet, "palisade");
        b.rule("input", "accept");
        b.raw("bogus command nobody knows");
        let bad = b.build();
        assert!(backend.apply(&bad).await.is_err());

        let after = backend.list_ruleset().await.unwrap().generation_hash("palisade");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn generation_hash_moves_on_tamper() {
        let backend = MemoryBackend::new();
        backend.apply(&sample_script()).await.unwrap();
        let clean = backend.list_ruleset().await.unwrap().generation_hash("palisade");

        backend.tamper_add_rule(Family::Inet, "palisade", "input", "tcp dport 23 accept");
        let tampered = backend.list_ruleset().await.unwrap().generation_hash("palisade");
        assert_ne!(clean, tampered);
    }

    #[tokio::test]
    async fn foreign_tables_are_visible() {
        let backend = MemoryBackend::new();
        backend.apply(&sample_script()).await.unwrap();
        backend.tamper_add_table(Family::Ip, "intruder");

        let view = backend.list_ruleset().await.unwrap();
        let foreign = view.foreign_tables(&[(Family::Inet, "palisade")]);
        assert_eq!(foreign, vec![("ip".to_string(), "intruder".to_string())]);
    }

    #[test]
    fn view_parses_nft_json() {
        let doc: Value = serde_json::from_str(
            r#"{"nftables":[
                {"metainfo":{"version":"1.0.9"}},
                {"table":{"family":"inet","name":"palisade","handle":1,"comment":"palisade:v1:c=4:h=00112233"}},
                {"chain":{"family":"inet","table":"palisade","name":"input","handle":2}},
                {"rule":{"family":"inet","table":"palisade","chain":"input","handle":7}},
                {"rule":{"family":"inet","table":"palisade","chain":"input","handle":9}}
            ]}"#,
        )
        .unwrap();
        let view = RulesetView::from_json(&doc).unwrap();
        assert_eq!(view.tables.len(), 1);
        assert_eq!(view.generation_hash("palisade"), 1 + 2 + 7 + 9);
        assert_eq!(
            view.table_comment(Family::Inet, "palisade"),
            Some("palisade:v1:c=4:h=00112233")
        );
    }
}

//! Rule-set manager: the single serialized mutator of the live ruleset.
//!
//! Owns the authoritative `base_config`, the dynamic NAT overlay and the
//! scheduled-rule overlay. Every mutation merges the overlays onto a
//! copy of the base, compiles, checks, applies, then
//! resynchronizes the expected integrity generation. One async lock covers
//! the whole apply path; the integrity restore callback is invoked outside
//! it.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::compile::{self, TABLE};
use crate::config::{validate, Config, NatRule, ScheduledRule};
use crate::error::ApplyOutcome;
use crate::ipset::IpSetManager;
use crate::kernel::{self, Backend};
use crate::metadata::{self, GenerationTag};
use crate::script::Family;
use crate::Error;

/// Invoked after the integrity monitor restored the ruleset.
pub type RestoreCallback = Arc<dyn Fn() + Send + Sync>;

/// `route_localnet` toggling, behind a trait so tests and non-Linux builds
/// substitute a recording double.
pub trait Sysctl: Send + Sync {
    fn set_route_localnet(&self, interface: &str, enabled: bool) -> io::Result<()>;
}

pub struct ProcSysctl;

impl Sysctl for ProcSysctl {
    fn set_route_localnet(&self, interface: &str, enabled: bool) -> io::Result<()> {
        let path = format!("/proc/sys/net/ipv4/conf/{interface}/route_localnet");
        std::fs::write(path, if enabled { "1" } else { "0" })
    }
}

/// Records writes instead of touching `/proc`.
#[derive(Default)]
pub struct RecordingSysctl {
    pub writes: std::sync::Mutex<Vec<(String, bool)>>,
}

impl Sysctl for RecordingSysctl {
    fn set_route_localnet(&self, interface: &str, enabled: bool) -> io::Result<()> {
        self.writes.lock().unwrap().push((interface.to_string(), enabled));
        Ok(())
    }
}

struct Inner {
    base_config: Option<Config>,
    current_config: Option<Config>,
    dynamic_nat: Vec<NatRule>,
    scheduled: BTreeMap<String, ScheduledRule>,
    expected_generation: Option<u64>,
    apply_count: u64,
}

pub struct RuleSetManager {
    backend: Arc<dyn Backend>,
    ipsets: Arc<IpSetManager>,
    sysctl: Arc<dyn Sysctl>,
    inner: Mutex<Inner>,
    restore_callback: std::sync::Mutex<Option<RestoreCallback>>,
}

impl RuleSetManager {
    pub fn new(backend: Arc<dyn Backend>, ipsets: Arc<IpSetManager>, sysctl: Arc<dyn Sysctl>) -> Self {
        RuleSetManager {
            backend,
            ipsets,
            sysctl,
            inner: Mutex::new(Inner {
                base_config: None,
                current_config: None,
                dynamic_nat: Vec::new(),
                scheduled: BTreeMap::new(),
                expected_generation: None,
                apply_count: 0,
            }),
            restore_callback: std::sync::Mutex::new(None),
        }
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    pub fn ipsets(&self) -> Arc<IpSetManager> {
        self.ipsets.clone()
    }

    /// Load and apply a new base configuration.
    pub async fn apply(&self, config: Config) -> Result<ApplyOutcome, Error> {
        validate::validate(&config)?;
        let mut inner = self.inner.lock().await;
        let previous = inner.base_config.take();
        inner.base_config = Some(config);
        match self.apply_locked(&mut inner).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                // keep the last good base so retries and integrity restores
                // have something coherent to work from
                inner.base_config = previous;
                Err(error)
            }
        }
    }

    /// Re-apply the merged `current_config` as-is. Used by the integrity
    /// monitor and by safe-mode exit.
    pub async fn restore_current(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.base_config.is_none() {
            return Err(Error::NotInitialized);
        }
        self.apply_locked(&mut inner).await.map(|_| ())
    }

    pub async fn add_dynamic_nat(&self, rule: NatRule) -> Result<ApplyOutcome, Error> {
        let mut inner = self.inner.lock().await;
        if inner.base_config.is_none() {
            return Err(Error::NotInitialized);
        }
        inner.dynamic_nat.push(rule);
        self.apply_locked(&mut inner).await
    }

    pub async fn remove_dynamic_nat<F>(&self, predicate: F) -> Result<ApplyOutcome, Error>
    where
        F: Fn(&NatRule) -> bool,
    {
        let mut inner = self.inner.lock().await;
        if inner.base_config.is_none() {
            return Err(Error::NotInitialized);
        }
        inner.dynamic_nat.retain(|rule| !predicate(rule));
        self.apply_locked(&mut inner).await
    }

    pub async fn dynamic_nat(&self) -> Vec<NatRule> {
        self.inner.lock().await.dynamic_nat.clone()
    }

    /// Add or remove a scheduled overlay by name and re-apply.
    pub async fn apply_scheduled(&self, rule: ScheduledRule, enabled: bool) -> Result<ApplyOutcome, Error> {
        let mut inner = self.inner.lock().await;
        if inner.base_config.is_none() {
            return Err(Error::NotInitialized);
        }
        if enabled {
            inner.scheduled.insert(rule.name.clone(), rule);
        } else {
            inner.scheduled.remove(&rule.name);
        }
        self.apply_locked(&mut inner).await
    }

    pub fn set_integrity_restore_callback(&self, callback: RestoreCallback) {
        *self.restore_callback.lock().unwrap() = Some(callback);
    }

    pub fn restore_callback(&self) -> Option<RestoreCallback> {
        self.restore_callback.lock().unwrap().clone()
    }

    pub async fn expected_generation(&self) -> Option<u64> {
        self.inner.lock().await.expected_generation
    }

    pub async fn base_config(&self) -> Option<Config> {
        self.inner.lock().await.base_config.clone()
    }

    pub async fn current_config(&self) -> Option<Config> {
        self.inner.lock().await.current_config.clone()
    }

    /// Adopt a configuration without touching the kernel, then resync the
    /// expected generation from the live ruleset. Used after a checkpoint
    /// restore, where the kernel already holds the wanted state.
    pub async fn adopt_config(&self, config: Option<Config>) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        inner.current_config = config.clone();
        inner.base_config = config;
        let view = self.backend.list_ruleset().await.map_err(map_kernel)?;
        inner.expected_generation = Some(view.generation_hash(TABLE));
        Ok(())
    }

    async fn apply_locked(&self, inner: &mut Inner) -> Result<ApplyOutcome, Error> {
        let base = inner.base_config.as_ref().ok_or(Error::NotInitialized)?;

        // overlays never touch the base
        let mut current = base.clone();
        current.nat.extend(inner.dynamic_nat.iter().cloned());
        for scheduled in inner.scheduled.values() {
            current.policies.push(scheduled.policy.clone());
        }

        let apply_count = self.next_apply_count(inner).await;
        let tag = GenerationTag::new(apply_count, metadata::config_hash(&current.fingerprint()));

        let compiled = compile::compile(&current, &tag)?;
        let script = compiled.combined();

        self.backend.check(&script).await.map_err(|e| match e {
            kernel::Error::Rejected { stderr } => Error::Validate { snippet: stderr },
            other => map_kernel(other),
        })?;

        // a failure after this commit must not leave the live ruleset and
        // the recorded state disagreeing, so keep an undo checkpoint
        let checkpoint = self.backend.ruleset_text().await.map_err(map_kernel)?;

        self.backend.apply(&script).await.map_err(|e| Error::Apply {
            detail: e.to_string(),
        })?;

        // dynamic set contents survived; URL-backed static sets get their
        // cached contents replayed
        if let Err(error) = self.ipsets.sync_after_apply(&current).await {
            self.rollback_ruleset(&checkpoint).await;
            return Err(Error::Apply {
                detail: format!("ipset replay failed: {error}"),
            });
        }

        for interface in current.web_api_interfaces() {
            if let Err(error) = self.sysctl.set_route_localnet(&interface, true) {
                tracing::warn!(%interface, error = %error, "failed setting route_localnet");
            }
        }

        let view = match self.backend.list_ruleset().await {
            Ok(view) => view,
            Err(error) => {
                self.rollback_ruleset(&checkpoint).await;
                return Err(map_kernel(error));
            }
        };
        inner.expected_generation = Some(view.generation_hash(TABLE));
        inner.apply_count = apply_count;
        inner.current_config = Some(current);

        Ok(ApplyOutcome::applied(format!("applied ruleset generation {apply_count}")))
    }

    /// Undo a committed apply by restoring the pre-apply ruleset text.
    /// Best effort: a failure here is logged and left for the integrity
    /// monitor to reconcile on its next tick.
    async fn rollback_ruleset(&self, checkpoint: &str) {
        let mut b = crate::script::ScriptBuilder::new(Family::Inet, TABLE);
        b.raw("flush ruleset".to_string());
        for line in checkpoint.lines().filter(|l| !l.trim().is_empty()) {
            b.raw(line.to_string());
        }
        if let Err(error) = self.backend.apply(&b.build()).await {
            tracing::error!(error = %error, "rollback after failed apply did not restore the ruleset");
        }
    }

    /// The apply counter continues from whatever the live table carries, so
    /// restarts and other instances do not reset it.
    async fn next_apply_count(&self, inner: &Inner) -> u64 {
        let live = self
            .backend
            .list_ruleset()
            .await
            .ok()
            .and_then(|view| {
                view.table_comment(Family::Inet, TABLE)
                    .and_then(|comment| GenerationTag::parse(comment).ok())
            })
            .map(|tag| tag.apply_count);
        live.unwrap_or(inner.apply_count) + 1
    }
}

fn map_kernel(error: kernel::Error) -> Error {
    match error {
        kernel::Error::Unavailable => Error::KernelUnavailable,
        other => Error::Apply {
            detail: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Interface, NatKind, Policy, PolicyRule, RuleAction, Zone};
    use crate::kernel::MemoryBackend;

    fn test_manager() -> (Arc<RuleSetManager>, MemoryBackend, Arc<RecordingSysctl>) {
        let backend = MemoryBackend::new();
        let arc_backend: Arc<dyn Backend> = Arc::new(backend.clone());
        let ipsets = Arc::new(IpSetManager::new(arc_backend.clone()));
        let sysctl = Arc::new(RecordingSysctl::default());
        let manager = Arc::new(RuleSetManager::new(arc_backend, ipsets, sysctl.clone()));
        (manager, backend, sysctl)
    }

    fn config() -> Config {
        Config {
            zones: vec![
                Zone {
                    name: "lan".to_string(),
                    interfaces: vec!["eth1".to_string()],
                    ..Default::default()
                },
                Zone {
                    name: "wan".to_string(),
                    interfaces: vec!["eth0".to_string()],
                    external: true,
                    ..Default::default()
                },
            ],
            interfaces: vec![
                Interface {
                    name: "eth0".to_string(),
                    ..Default::default()
                },
                Interface {
                    name: "eth1".to_string(),
                    access_web_ui: true,
                    ..Default::default()
                },
            ],
            policies: vec![Policy {
                from: "lan".to_string(),
                to: "wan".to_string(),
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

    #[tokio::test]
    async fn apply_sets_generation_and_route_localnet() {
        let (manager, backend, sysctl) = test_manager();
        let outcome = manager.apply(config()).await.unwrap();
        assert!(outcome.success);

        let expected = manager.expected_generation().await.unwrap();
        let live = backend.list_ruleset().await.unwrap().generation_hash(TABLE);
        assert_eq!(expected, live);

        let writes = sysctl.writes.lock().unwrap();
        assert!(writes.contains(&("eth1".to_string(), true)));
        assert!(!writes.iter().any(|(iface, _)| iface == "eth0"));
    }

    #[tokio::test]
    async fn apply_is_idempotent_at_terminal_state() {
        let (manager, backend, _) = test_manager();
        manager.apply(config()).await.unwrap();
        let first = backend.chain_rules(Family::Inet, TABLE, "forward");

        manager.apply(config()).await.unwrap();
        let second = backend.chain_rules(Family::Inet, TABLE, "forward");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn dynamic_nat_add_then_remove_restores_base_script() {
        let (manager, backend, _) = test_manager();
        manager.apply(config()).await.unwrap();
        let base_rules = backend.chain_rules(Family::Ip, "nat", "prerouting");

        let rule = NatRule {
            kind: NatKind::Dnat,
            in_interface: Some("eth0".to_string()),
            dest_port: Some("8080".to_string()),
            to_ip: Some("192.168.1.50".to_string()),
            to_port: Some(80),
            ..Default::default()
        };
        manager.add_dynamic_nat(rule.clone()).await.unwrap();
        let with_dynamic = backend.chain_rules(Family::Ip, "nat", "prerouting");
        assert_ne!(base_rules, with_dynamic);

        manager.remove_dynamic_nat(|r| *r == rule).await.unwrap();
        let after_remove = backend.chain_rules(Family::Ip, "nat", "prerouting");
        assert_eq!(base_rules, after_remove);
    }

    #[tokio::test]
    async fn scheduled_overlay_round_trip() {
        let (manager, backend, _) = test_manager();
        manager.apply(config()).await.unwrap();

        let overlay = ScheduledRule {
            name: "night-curfew".to_string(),
            policy: Policy {
                from: "lan".to_string(),
                to: "wan".to_string(),
                action: RuleAction::Drop,
                ..Default::default()
            },
        };
        manager.apply_scheduled(overlay.clone(), true).await.unwrap();
        assert!(manager
            .current_config()
            .await
            .unwrap()
            .policies
            .iter()
            .any(|p| p.action == RuleAction::Drop));

        manager.apply_scheduled(overlay, false).await.unwrap();
        // base stays untouched by overlays
        assert_eq!(manager.base_config().await.unwrap(), config());
        let _ = backend;
    }

    #[tokio::test]
    async fn failed_apply_surfaces_and_keeps_previous_base() {
        let (manager, backend, _) = test_manager();
        manager.apply(config()).await.unwrap();

        backend.fail_on("apply", "device busy");
        let mut bad = config();
        bad.policies[0].rules[0].dest_port = Some("80".to_string());
        let error = manager.apply(bad).await.unwrap_err();
        assert!(matches!(error, Error::Apply { .. }));
        backend.clear_failures();

        assert_eq!(manager.base_config().await.unwrap(), config());
    }

    #[tokio::test]
    async fn failure_after_commit_restores_previous_ruleset() {
        let (manager, backend, _) = test_manager();
        manager.apply(config()).await.unwrap();
        let before = backend.ruleset_text().await.unwrap();

        // the apply itself lands, the post-commit resync does not
        backend.fail_on("list_ruleset", "lost netlink");
        let mut changed = config();
        changed.policies[0].rules[0].dest_port = Some("80".to_string());
        let error = manager.apply(changed).await.unwrap_err();
        assert!(matches!(error, Error::Apply { .. }));
        backend.clear_failures();

        assert_eq!(backend.ruleset_text().await.unwrap(), before);
        assert_eq!(manager.base_config().await.unwrap(), config());
    }

    #[tokio::test]
    async fn invalid_identifier_rejected_before_kernel() {
        let (manager, backend, _) = test_manager();
        let mut bad = config();
        bad.zones[0].name = "lan;inject".to_string();
        assert!(matches!(manager.apply(bad).await, Err(Error::ConfigInvalid { .. })));
        assert!(backend.applied_scripts().is_empty());
    }

    #[tokio::test]
    async fn mutators_require_initialization() {
        let (manager, _, _) = test_manager();
        assert!(matches!(
            manager.add_dynamic_nat(NatRule::default()).await,
            Err(Error::NotInitialized)
        ));
    }
}

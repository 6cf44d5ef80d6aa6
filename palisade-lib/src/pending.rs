//! Safe-apply: connectivity-verified two-phase apply with timed rollback.
//!
//! The invariant is one pending apply system-wide. A safe apply backs up
//! the configuration into a bounded versioned history, checkpoints the
//! live ruleset to disk, applies, verifies connectivity, and either
//! finishes or arms an auto-rollback timer that restores both the ruleset
//! checkpoint and the configuration backup at the deadline.

use uuid::Uuid;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::ApplyOutcome;
use crate::manager::RuleSetManager;
use crate::probe::{self, ProbeOptions};
use crate::script::{Family, ScriptBuilder};
use crate::store::Store;
use crate::Error;

pub const DEFAULT_ROLLBACK_DELAY: Duration = Duration::from_secs(30);

/// Bounded size of the configuration backup history.
const MAX_BACKUPS: usize = 10;

const BACKUP_BUCKET: &str = "config_history";

#[derive(Clone, Debug)]
pub struct SafeApplyOptions {
    /// Probe targets; the client's address when empty.
    pub ping_targets: Vec<IpAddr>,
    pub ping_timeout: Option<Duration>,
    /// Probe port override; the management trio when `None`.
    pub probe_ports: Option<Vec<u16>>,
    pub require_confirmation: bool,
    pub rollback_delay: Duration,
}

impl Default for SafeApplyOptions {
    fn default() -> Self {
        SafeApplyOptions {
            ping_targets: Vec::new(),
            ping_timeout: None,
            probe_ports: None,
            require_confirmation: false,
            rollback_delay: DEFAULT_ROLLBACK_DELAY,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PendingApply {
    pub id: Uuid,
    pub start_time: SystemTime,
    pub rollback_time: SystemTime,
    pub client_ip: IpAddr,
    pub config_backup_version: u64,
    pub ruleset_backup_path: PathBuf,
    pub confirmed: bool,
    pub rolled_back: bool,
}

struct PendingSlot {
    apply: PendingApply,
    timer: JoinHandle<()>,
    previous_config: Option<Config>,
}

pub struct SafeApply {
    manager: Arc<RuleSetManager>,
    store: Arc<Store>,
    checkpoint_path: PathBuf,
    pending: Mutex<Option<PendingSlot>>,
    last_rollback_cause: std::sync::Mutex<Option<String>>,
}

impl SafeApply {
    pub fn new(manager: Arc<RuleSetManager>, store: Arc<Store>, checkpoint_path: impl Into<PathBuf>) -> Self {
        SafeApply {
            manager,
            store,
            checkpoint_path: checkpoint_path.into(),
            pending: Mutex::new(None),
            last_rollback_cause: std::sync::Mutex::new(None),
        }
    }

    pub async fn safe_apply(
        self: &Arc<Self>,
        config: Config,
        client_ip: IpAddr,
        options: SafeApplyOptions,
    ) -> Result<ApplyOutcome, Error> {
        {
            let pending = self.pending.lock().await;
            if pending.is_some() {
                return Err(Error::AlreadyPending);
            }
        }

        let previous_config = self.manager.base_config().await;
        let backup_target = previous_config.clone().unwrap_or_else(|| config.clone());
        let backup_version = self.backup_config(&backup_target)?;

        self.save_checkpoint().await?;

        if let Err(error) = self.manager.apply(config).await {
            tracing::warn!(error = %error, "safe apply failed, restoring checkpoint");
            self.restore_checkpoint(previous_config.clone()).await?;
            self.remove_checkpoint().await;
            return Err(error);
        }

        let targets = if options.ping_targets.is_empty() {
            vec![client_ip]
        } else {
            options.ping_targets.clone()
        };
        let mut probe_options = ProbeOptions::new(targets, options.ping_timeout);
        if let Some(ports) = &options.probe_ports {
            probe_options = probe_options.with_ports(ports.clone());
        }
        if !probe::verify_connectivity(&probe_options).await {
            tracing::warn!("connectivity verification failed, rolling back");
            self.restore_checkpoint(previous_config.clone()).await?;
            self.remove_checkpoint().await;
            self.set_cause("connectivity verification failed");
            return Err(Error::Timeout {
                operation: "connectivity verification".to_string(),
            });
        }

        if !options.require_confirmation {
            self.remove_checkpoint().await;
            let mut outcome = ApplyOutcome::applied("configuration applied");
            outcome.backup_version = Some(backup_version);
            return Ok(outcome);
        }

        let id = Uuid::new_v4();
        let now = SystemTime::now();
        let rollback_time = now + options.rollback_delay;
        let apply = PendingApply {
            id,
            start_time: now,
            rollback_time,
            client_ip,
            config_backup_version: backup_version,
            ruleset_backup_path: self.checkpoint_path.clone(),
            confirmed: false,
            rolled_back: false,
        };

        let timer = {
            let this = self.clone();
            let delay = options.rollback_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                this.auto_rollback(id).await;
            })
        };

        let mut pending = self.pending.lock().await;
        *pending = Some(PendingSlot {
            apply: apply.clone(),
            timer,
            previous_config,
        });

        Ok(ApplyOutcome {
            success: true,
            pending_id: Some(id),
            message: "applied, awaiting confirmation".to_string(),
            rollback_time: Some(rollback_time),
            backup_version: Some(backup_version),
        })
    }

    /// Keep the new configuration and disarm the rollback.
    pub async fn confirm(&self, id: Uuid) -> Result<ApplyOutcome, Error> {
        let mut pending = self.pending.lock().await;
        match pending.take() {
            Some(slot) if slot.apply.id == id => {
                slot.timer.abort();
                drop(pending);
                self.remove_checkpoint().await;
                tracing::info!(%id, "pending apply confirmed");
                Ok(ApplyOutcome::applied("configuration confirmed"))
            }
            other => {
                *pending = other;
                Err(Error::PendingNotFound)
            }
        }
    }

    /// Undo the pending apply immediately.
    pub async fn cancel(&self, id: Uuid) -> Result<ApplyOutcome, Error> {
        let mut pending = self.pending.lock().await;
        match pending.take() {
            Some(slot) if slot.apply.id == id => {
                slot.timer.abort();
                drop(pending);
                self.rollback(&slot).await?;
                self.set_cause("cancelled by operator");
                tracing::info!(%id, "pending apply cancelled and rolled back");
                Ok(ApplyOutcome::applied("configuration rolled back"))
            }
            other => {
                *pending = other;
                Err(Error::PendingNotFound)
            }
        }
    }

    pub async fn status(&self) -> (Option<PendingApply>, Option<String>) {
        let pending = self.pending.lock().await;
        let apply = pending.as_ref().map(|slot| slot.apply.clone());
        let cause = self.last_rollback_cause.lock().unwrap().clone();
        (apply, cause)
    }

    async fn auto_rollback(self: Arc<Self>, id: Uuid) {
        let mut pending = self.pending.lock().await;
        let Some(slot) = pending.take() else {
            return;
        };
        if slot.apply.id != id || slot.apply.confirmed {
            *pending = Some(slot);
            return;
        }
        drop(pending);

        tracing::warn!(%id, "confirmation window expired, rolling back ruleset and configuration");
        if let Err(error) = self.rollback(&slot).await {
            tracing::error!(error = %error, "auto-rollback failed");
            self.set_cause(format!("auto-rollback failed: {error}"));
            return;
        }
        self.set_cause("confirmation window expired");
    }

    async fn rollback(&self, slot: &PendingSlot) -> Result<(), Error> {
        // prefer the recorded backup; the in-memory previous config is the
        // fallback when the store lost it
        let backed_up: Option<Config> = self
            .store
            .get(BACKUP_BUCKET, &backup_key(slot.apply.config_backup_version))
            .ok()
            .flatten();
        let restore_to = backed_up.or_else(|| slot.previous_config.clone());
        self.restore_checkpoint(restore_to).await?;
        self.remove_checkpoint().await;
        Ok(())
    }

    async fn save_checkpoint(&self) -> Result<(), Error> {
        let text = self
            .manager
            .backend()
            .ruleset_text()
            .await
            .map_err(|e| Error::Apply {
                detail: format!("checkpoint failed: {e}"),
            })?;
        let content = format!("flush ruleset\n{text}");
        tokio::fs::write(&self.checkpoint_path, content).await?;
        Ok(())
    }

    async fn restore_checkpoint(&self, config: Option<Config>) -> Result<(), Error> {
        let content = tokio::fs::read_to_string(&self.checkpoint_path).await?;
        let mut b = ScriptBuilder::new(Family::Inet, crate::compile::TABLE);
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            b.raw(line.to_string());
        }
        self.manager
            .backend()
            .apply(&b.build())
            .await
            .map_err(|e| Error::Apply {
                detail: format!("checkpoint restore failed: {e}"),
            })?;
        // the kernel now holds the checkpointed state; adopt the matching
        // config and resync the integrity expectation
        self.manager.adopt_config(config).await?;
        Ok(())
    }

    async fn remove_checkpoint(&self) {
        let _ = tokio::fs::remove_file(&self.checkpoint_path).await;
    }

    fn backup_config(&self, config: &Config) -> Result<u64, Error> {
        let version = self.store.current_version() + 1;
        self.store
            .set(BACKUP_BUCKET, &backup_key(version), config)
            .map_err(|e| Error::Store(e.to_string()))?;

        // bound the history
        let mut keys = self
            .store
            .keys(BACKUP_BUCKET)
            .map_err(|e| Error::Store(e.to_string()))?;
        keys.sort();
        while keys.len() > MAX_BACKUPS {
            let oldest = keys.remove(0);
            let _ = self.store.delete(BACKUP_BUCKET, &oldest);
        }
        Ok(version)
    }

    pub fn backup(&self, version: u64) -> Option<Config> {
        self.store.get(BACKUP_BUCKET, &backup_key(version)).ok().flatten()
    }

    fn set_cause(&self, cause: impl Into<String>) {
        *self.last_rollback_cause.lock().unwrap() = Some(cause.into());
    }
}

fn backup_key(version: u64) -> String {
    format!("{version:020}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Interface, Zone};
    use crate::ipset::IpSetManager;
    use crate::kernel::{Backend, MemoryBackend};
    use crate::manager::RecordingSysctl;
    use crate::script::Family;

    use std::net::Ipv4Addr;

    fn client_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5))
    }

    fn config(zone: &str) -> Config {
        Config {
            zones: vec![Zone {
                name: zone.to_string(),
                interfaces: vec!["eth0".to_string()],
                ..Default::default()
            }],
            interfaces: vec![Interface {
                name: "eth0".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    async fn setup() -> (Arc<SafeApply>, Arc<RuleSetManager>, MemoryBackend, tempfile::TempDir) {
        let backend = MemoryBackend::new();
        let arc_backend: Arc<dyn Backend> = Arc::new(backend.clone());
        let ipsets = Arc::new(IpSetManager::new(arc_backend.clone()));
        let manager = Arc::new(RuleSetManager::new(
            arc_backend,
            ipsets,
            Arc::new(RecordingSysctl::default()),
        ));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_temporary().unwrap());
        let safe = Arc::new(SafeApply::new(
            manager.clone(),
            store,
            dir.path().join("rollback.nft"),
        ));
        (safe, manager, backend, dir)
    }

    /// A local listener that answers the probe, plus options pointing at it.
    async fn reachable_options(confirm: bool, delay_ms: u64) -> (tokio::net::TcpListener, SafeApplyOptions) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let options = SafeApplyOptions {
            probe_ports: Some(vec![port]),
            require_confirmation: confirm,
            rollback_delay: Duration::from_millis(delay_ms),
            ..Default::default()
        };
        (listener, options)
    }

    #[tokio::test]
    async fn unconfirmed_apply_rolls_back_ruleset_and_config() {
        let (safe, manager, backend, _dir) = setup().await;
        manager.apply(config("lan")).await.unwrap();
        let before = backend.ruleset_text().await.unwrap();

        let (_listener, options) = reachable_options(true, 100).await;
        let outcome = safe
            .safe_apply(config("dmz"), IpAddr::V4(Ipv4Addr::LOCALHOST), options)
            .await
            .unwrap();
        assert!(outcome.success);
        let pending_id = outcome.pending_id.unwrap();
        assert!(outcome.rollback_time.is_some());

        // no confirmation: the deadline fires
        tokio::time::sleep(Duration::from_millis(300)).await;

        let after = backend.ruleset_text().await.unwrap();
        assert_eq!(before, after, "ruleset must be byte-identical after rollback");
        let restored = manager.base_config().await.unwrap();
        assert_eq!(restored.zones[0].name, "lan");

        let (pending, cause) = safe.status().await;
        assert!(pending.is_none());
        assert!(cause.unwrap().contains("expired"));
        // a stale confirm is rejected
        assert!(matches!(safe.confirm(pending_id).await, Err(Error::PendingNotFound)));
    }

    #[tokio::test]
    async fn confirm_keeps_new_configuration() {
        let (safe, manager, _backend, _dir) = setup().await;
        manager.apply(config("lan")).await.unwrap();

        let (_listener, options) = reachable_options(true, 60_000).await;
        let outcome = safe
            .safe_apply(config("dmz"), IpAddr::V4(Ipv4Addr::LOCALHOST), options)
            .await
            .unwrap();
        let id = outcome.pending_id.unwrap();
        safe.confirm(id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.base_config().await.unwrap().zones[0].name, "dmz");
        let (pending, _) = safe.status().await;
        assert!(pending.is_none());
    }

    #[tokio::test]
    async fn cancel_restores_immediately() {
        let (safe, manager, _backend, _dir) = setup().await;
        manager.apply(config("lan")).await.unwrap();

        let (_listener, options) = reachable_options(true, 60_000).await;
        let outcome = safe
            .safe_apply(config("dmz"), IpAddr::V4(Ipv4Addr::LOCALHOST), options)
            .await
            .unwrap();
        safe.cancel(outcome.pending_id.unwrap()).await.unwrap();
        assert_eq!(manager.base_config().await.unwrap().zones[0].name, "lan");
    }

    #[tokio::test]
    async fn second_pending_apply_is_refused() {
        let (safe, manager, _backend, _dir) = setup().await;
        manager.apply(config("lan")).await.unwrap();

        let (_listener, options) = reachable_options(true, 60_000).await;
        let first = safe
            .safe_apply(config("dmz"), IpAddr::V4(Ipv4Addr::LOCALHOST), options.clone())
            .await
            .unwrap();
        let second = safe
            .safe_apply(config("guest"), IpAddr::V4(Ipv4Addr::LOCALHOST), options)
            .await;
        assert!(matches!(second, Err(Error::AlreadyPending)));
        safe.cancel(first.pending_id.unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn failed_probe_rolls_back() {
        let (safe, manager, backend, _dir) = setup().await;
        manager.apply(config("lan")).await.unwrap();
        let before = backend.ruleset_text().await.unwrap();

        // TEST-NET client, default probe ports: nothing answers
        let opts = SafeApplyOptions {
            ping_timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let result = safe.safe_apply(config("dmz"), client_ip(), opts).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(backend.ruleset_text().await.unwrap(), before);
        assert_eq!(manager.base_config().await.unwrap().zones[0].name, "lan");
    }

    #[tokio::test]
    async fn backup_history_is_bounded() {
        let (safe, manager, _backend, _dir) = setup().await;
        manager.apply(config("lan")).await.unwrap();
        let (_listener, options) = reachable_options(false, 100).await;
        for i in 0..15 {
            let outcome = safe
                .safe_apply(
                    config(&format!("zone{i}")),
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    options.clone(),
                )
                .await
                .unwrap();
            assert!(outcome.backup_version.is_some());
        }
        let keys = safe.store.keys(BACKUP_BUCKET).unwrap();
        assert!(keys.len() <= MAX_BACKUPS);
    }
}

//! Named-set management on the live ruleset.
//!
//! Keeps a local mirror of every managed set for O(1) membership checks and
//! enumeration without shelling out. All mutations go through the kernel
//! backend in bounded batches; an atomic reload is flush+add in a single
//! transaction so readers never observe an empty set.

use thiserror::Error;

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::compile::TABLE;
use crate::config::{Config, IpSetType};
use crate::kernel::{self, Backend};
use crate::script::{Family, ScriptBuilder, SetFlag};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid set name `{0}`")]
    InvalidName(String),
    #[error("unknown set `{0}`")]
    UnknownSet(String),
    #[error("invalid element `{0}`")]
    InvalidElement(String),
    #[error(transparent)]
    Kernel(#[from] kernel::Error),
}

#[derive(Clone, Debug)]
struct SetState {
    element_type: &'static str,
    flags: Vec<SetFlag>,
    elements: BTreeSet<String>,
}

pub struct IpSetManager {
    backend: Arc<dyn Backend>,
    sets: RwLock<BTreeMap<String, SetState>>,
}

impl IpSetManager {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        IpSetManager {
            backend,
            sets: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn create(&self, name: &str, element_type: &'static str, flags: &[SetFlag]) -> Result<(), Error> {
        check_name(name)?;
        let mut b = ScriptBuilder::new(Family::Inet, TABLE);
        b.set(name, element_type, flags, None);
        self.backend.apply(&b.build()).await?;
        let mut sets = self.sets.write().await;
        sets.entry(name.to_string()).or_insert_with(|| SetState {
            element_type,
            flags: flags.to_vec(),
            elements: BTreeSet::new(),
        });
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<(), Error> {
        check_name(name)?;
        let mut b = ScriptBuilder::new(Family::Inet, TABLE);
        b.raw(format!("delete set inet {TABLE} {name}"));
        self.backend.apply(&b.build()).await?;
        self.sets.write().await.remove(name);
        Ok(())
    }

    pub async fn flush(&self, name: &str) -> Result<(), Error> {
        check_name(name)?;
        let mut b = ScriptBuilder::new(Family::Inet, TABLE);
        b.flush_set(name);
        self.backend.apply(&b.build()).await?;
        if let Some(state) = self.sets.write().await.get_mut(name) {
            state.elements.clear();
        }
        Ok(())
    }

    pub async fn add_elements(&self, name: &str, elements: &[String]) -> Result<usize, Error> {
        check_name(name)?;
        let rendered = render_elements(elements)?;
        if rendered.is_empty() {
            return Ok(0);
        }
        let mut b = ScriptBuilder::new(Family::Inet, TABLE);
        b.elements(name, &rendered);
        self.backend.apply(&b.build()).await?;

        let mut sets = self.sets.write().await;
        let state = sets.get_mut(name).ok_or_else(|| Error::UnknownSet(name.to_string()))?;
        let added = rendered.len();
        state.elements.extend(rendered);
        Ok(added)
    }

    /// Add elements with a kernel-side timeout; the set must carry the
    /// timeout flag. The mirror stores the plain element.
    pub async fn add_elements_with_timeout(
        &self,
        name: &str,
        elements: &[String],
        ttl: std::time::Duration,
    ) -> Result<(), Error> {
        check_name(name)?;
        let rendered = render_elements(elements)?;
        if rendered.is_empty() {
            return Ok(());
        }
        let timed: Vec<String> = rendered
            .iter()
            .map(|element| format!("{element} timeout {}s", ttl.as_secs()))
            .collect();
        let mut b = ScriptBuilder::new(Family::Inet, TABLE);
        b.elements(name, &timed);
        self.backend.apply(&b.build()).await?;

        let mut sets = self.sets.write().await;
        let state = sets.entry(name.to_string()).or_insert_with(|| SetState {
            element_type: "ipv4_addr",
            flags: vec![SetFlag::Timeout],
            elements: BTreeSet::new(),
        });
        state.elements.extend(rendered);
        Ok(())
    }

    pub async fn remove_elements(&self, name: &str, elements: &[String]) -> Result<(), Error> {
        check_name(name)?;
        let rendered = render_elements(elements)?;
        if rendered.is_empty() {
            return Ok(());
        }
        let mut b = ScriptBuilder::new(Family::Inet, TABLE);
        for chunk in rendered.chunks(crate::script::ELEMENT_BATCH) {
            b.raw(format!("delete element inet {TABLE} {name} {{ {} }}", chunk.join(", ")));
        }
        self.backend.apply(&b.build()).await?;

        let mut sets = self.sets.write().await;
        if let Some(state) = sets.get_mut(name) {
            for element in &rendered {
                state.elements.remove(element);
            }
        }
        Ok(())
    }

    /// Flush and repopulate in one transaction.
    pub async fn atomic_reload(&self, name: &str, elements: &[String]) -> Result<usize, Error> {
        check_name(name)?;
        let rendered = render_elements(elements)?;
        let mut b = ScriptBuilder::new(Family::Inet, TABLE);
        b.flush_set(name);
        b.elements(name, &rendered);
        self.backend.apply(&b.build()).await?;

        let mut sets = self.sets.write().await;
        let state = sets.get_mut(name).ok_or_else(|| Error::UnknownSet(name.to_string()))?;
        state.elements = rendered.iter().cloned().collect();
        Ok(state.elements.len())
    }

    /// O(1) membership check against the mirror.
    pub async fn contains(&self, name: &str, element: &str) -> bool {
        let Ok(rendered) = render_element(element) else {
            return false;
        };
        let sets = self.sets.read().await;
        sets.get(name).map(|s| s.elements.contains(&rendered)).unwrap_or(false)
    }

    pub async fn list(&self) -> Vec<String> {
        self.sets.read().await.keys().cloned().collect()
    }

    pub async fn enumerate(&self, name: &str) -> Result<Vec<String>, Error> {
        let sets = self.sets.read().await;
        sets.get(name)
            .map(|s| s.elements.iter().cloned().collect())
            .ok_or_else(|| Error::UnknownSet(name.to_string()))
    }

    pub async fn flags(&self, name: &str) -> Option<(&'static str, Vec<SetFlag>)> {
        let sets = self.sets.read().await;
        sets.get(name).map(|s| (s.element_type, s.flags.clone()))
    }

    /// Register the configured sets after an apply and restore the mirror's
    /// contents for sets the compiler flushed (URL/list-backed sets lose
    /// their kernel contents on apply; dynamic sets keep theirs).
    pub async fn sync_after_apply(&self, config: &Config) -> Result<(), Error> {
        let mut to_restore: Vec<(String, Vec<String>)> = Vec::new();
        {
            let mut sets = self.sets.write().await;
            let configured: BTreeSet<&str> = config.ipsets.iter().map(|s| s.name.as_str()).collect();
            sets.retain(|name, _| configured.contains(name.as_str()) || name.starts_with("geoip_country_"));

            for set in &config.ipsets {
                let state = sets.entry(set.name.clone()).or_insert_with(|| SetState {
                    element_type: set.set_type.element_type(),
                    flags: Vec::new(),
                    elements: BTreeSet::new(),
                });
                if !set.set_type.is_dynamic() {
                    // the kernel side now holds exactly the inline entries
                    let inline: BTreeSet<String> = render_elements(&set.entries).unwrap_or_default().into_iter().collect();
                    let cached: Vec<String> = state.elements.difference(&inline).cloned().collect();
                    state.elements = inline;
                    if (set.url.is_some() || set.list.is_some()) && !cached.is_empty() {
                        to_restore.push((set.name.clone(), cached));
                    }
                }
            }
        }
        for (name, elements) in to_restore {
            self.add_elements(&name, &elements).await?;
        }
        Ok(())
    }
}

fn check_name(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

/// Normalize one element: bare addresses stay single keys, CIDRs become the
/// interval they span, ports and port ranges pass through.
fn render_element(element: &str) -> Result<String, Error> {
    let element = element.trim();
    if element.is_empty() {
        return Err(Error::InvalidElement(element.to_string()));
    }
    if element.parse::<IpAddr>().is_ok() {
        return Ok(element.to_string());
    }
    if let Ok(cidr) = element.parse::<cidr::IpCidr>() {
        if cidr.is_host_address() {
            return Ok(cidr.first_address().to_string());
        }
        return Ok(format!("{}-{}", cidr.first_address(), cidr.last_address()));
    }
    // inet_service elements
    if element.parse::<u16>().is_ok() {
        return Ok(element.to_string());
    }
    if let Some((lo, hi)) = element.split_once('-') {
        if lo.parse::<u16>().is_ok() && hi.parse::<u16>().is_ok() {
            return Ok(element.to_string());
        }
    }
    Err(Error::InvalidElement(element.to_string()))
}

/// Render and deduplicate; duplicates are emitted exactly once.
fn render_elements(elements: &[String]) -> Result<Vec<String>, Error> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(elements.len());
    for element in elements {
        let rendered = render_element(element)?;
        if seen.insert(rendered.clone()) {
            out.push(rendered);
        }
    }
    Ok(out)
}

/// Set types that survive a ruleset apply untouched.
pub fn survives_apply(set_type: IpSetType) -> bool {
    set_type.is_dynamic()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MemoryBackend;

    async fn manager() -> (IpSetManager, MemoryBackend) {
        let backend = MemoryBackend::new();
        // the managed table must exist before set commands land in it
        let mut b = ScriptBuilder::new(Family::Inet, TABLE);
        b.table(None);
        backend.apply(&b.build()).await.unwrap();
        (IpSetManager::new(Arc::new(backend.clone())), backend)
    }

    #[tokio::test]
    async fn create_add_contains_enumerate() {
        let (manager, _backend) = manager().await;
        manager.create("badguys", "ipv4_addr", &[SetFlag::Interval]).await.unwrap();
        manager
            .add_elements(
                "badguys",
                &["192.0.2.1".to_string(), "198.51.100.0/24".to_string(), "192.0.2.1".to_string()],
            )
            .await
            .unwrap();

        assert!(manager.contains("badguys", "192.0.2.1").await);
        assert!(!manager.contains("badguys", "192.0.2.2").await);
        let elements = manager.enumerate("badguys").await.unwrap();
        // duplicate collapsed, CIDR expanded to its interval
        assert_eq!(elements.len(), 2);
        assert!(elements.contains(&"198.51.100.0-198.51.100.255".to_string()));
    }

    #[tokio::test]
    async fn atomic_reload_replaces_contents() {
        let (manager, backend) = manager().await;
        manager.create("list", "ipv4_addr", &[]).await.unwrap();
        manager.add_elements("list", &["192.0.2.1".to_string()]).await.unwrap();
        manager.atomic_reload("list", &["203.0.113.7".to_string()]).await.unwrap();

        assert!(!manager.contains("list", "192.0.2.1").await);
        assert!(manager.contains("list", "203.0.113.7").await);
        let kernel_side = backend.set_elements(Family::Inet, TABLE, "list");
        assert_eq!(kernel_side, vec!["203.0.113.7".to_string()]);
    }

    #[tokio::test]
    async fn rejects_bad_names_and_elements() {
        let (manager, _backend) = manager().await;
        assert!(matches!(
            manager.create("bad name", "ipv4_addr", &[]).await,
            Err(Error::InvalidName(_))
        ));
        manager.create("ok", "ipv4_addr", &[]).await.unwrap();
        assert!(matches!(
            manager.add_elements("ok", &["not-an-ip".to_string()]).await,
            Err(Error::InvalidElement(_))
        ));
    }
}

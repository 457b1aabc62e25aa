//! The daemon's central command: the shared, `Arc`-held bundle of database,
//! configuration, scheduler and policy table every unit is built around.

use std::io;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::db::Database;
use crate::domain::ZoneId;
use crate::enforcer::ZoneLocks;
use crate::error::{PolicyReloadError, ZoneAddError, ZoneRemoveError};
use crate::keys::factory::{KeyMaterialRepository, SoftwareRepository};
use crate::log::Logger;
use crate::policy::{self, Policy};
use crate::scheduler::{Scheduler, TaskKind, TaskTarget, VirtualClock};

//----------- Center -----------------------------------------------------------------

/// The daemon's central, shared state.
pub struct Center {
    pub db: Database,
    pub config: Config,
    pub logger: &'static Logger,
    pub scheduler: Scheduler,
    pub locks: ZoneLocks,
    pub key_repo: Box<dyn KeyMaterialRepository>,
    pub policies: Mutex<foldhash::HashMap<Box<str>, Policy>>,
    pub change_tx: mpsc::UnboundedSender<Change>,
}

impl Center {
    pub fn new(config: Config, logger: &'static Logger, change_tx: mpsc::UnboundedSender<Change>) -> Self {
        Center {
            db: Database::new(),
            config,
            logger,
            scheduler: Scheduler::new(VirtualClock::wall_clock()),
            locks: ZoneLocks::default(),
            key_repo: Box::new(SoftwareRepository::default()),
            policies: Mutex::new(foldhash::HashMap::default()),
            change_tx,
        }
    }

    fn notify(&self, change: Change) {
        let _ = self.change_tx.send(change);
    }
}

//--- Zones

/// Register a new zone under `policy_name`, per §4.7's `zone add`.
pub fn add_zone(center: &Center, name: &str, policy_name: &str) -> Result<ZoneId, ZoneAddError> {
    {
        let policies = center.policies.lock().unwrap();
        let policy = policies.get(policy_name).ok_or(ZoneAddError::NoSuchPolicy)?;
        if policy.mid_deletion {
            return Err(ZoneAddError::PolicyMidDeletion);
        }
    }

    let mut txn = center.db.transaction().map_err(|_| ZoneAddError::NoSuchPolicy)?;
    if txn.get_zone_by_name(name).is_some() {
        return Err(ZoneAddError::AlreadyExists);
    }
    let id = txn.create_zone(name, policy_name);
    txn.commit();

    {
        let mut policies = center.policies.lock().unwrap();
        if let Some(policy) = policies.get_mut(policy_name) {
            policy.zones.insert(name.into());
        }
    }

    center.notify(Change::ZoneAdded(id));
    center.scheduler.enqueue(TaskKind::Enforce, TaskTarget::Zone(id), center.scheduler.clock.now());
    tracing::info!("added zone '{name}'");
    Ok(id)
}

/// Mark `name` for removal: its keys purge on the next reconcile instead of
/// vanishing mid-enforce.
pub fn remove_zone(center: &Center, name: &str) -> Result<(), ZoneRemoveError> {
    let mut txn = center.db.transaction().map_err(|_| ZoneRemoveError::NoSuchZone)?;
    let zone = txn.get_zone_by_name(name).ok_or(ZoneRemoveError::NoSuchZone)?;
    let (id, policy_name) = (zone.id, zone.policy.clone());
    txn.delete_zone(id);
    txn.commit();

    let mut policies = center.policies.lock().unwrap();
    if let Some(policy) = policies.get_mut(&policy_name) {
        policy.zones.remove(name);
    }

    center.notify(Change::ZoneRemoved(id));
    tracing::info!("removed zone '{name}'");
    Ok(())
}

//--- Policies

/// Reload every policy file under `config.policy_dir`, firing `enforce` for
/// every zone whose policy actually changed.
pub fn reload_policies(center: &Center) -> Result<(), PolicyReloadError> {
    let mut policies = center.policies.lock().unwrap();
    let mut changed = Vec::new();

    policy::reload_all(&mut policies, &center.config, |change| {
        if let Change::PolicyChanged(_, new) = &change {
            changed.push(new.name.clone());
        }
        if let Change::PolicyAdded(new) = &change {
            changed.push(new.name.clone());
        }
    })?;

    drop(policies);

    if !changed.is_empty() {
        let txn = center.db.transaction().expect("in-process database never refuses a transaction");
        for policy_name in &changed {
            for zone in txn.list_zones_for_policy(policy_name) {
                center.scheduler.enqueue(TaskKind::Enforce, TaskTarget::Zone(zone.id), center.scheduler.clock.now());
            }
        }
    }

    Ok(())
}

//----------- Change -----------------------------------------------------------------

/// A change to central state, broadcast to interested units.
#[derive(Clone, Debug)]
pub enum Change {
    ConfigChanged,
    PolicyAdded(std::sync::Arc<crate::policy::PolicyVersion>),
    PolicyChanged(std::sync::Arc<crate::policy::PolicyVersion>, std::sync::Arc<crate::policy::PolicyVersion>),
    PolicyRemoved(std::sync::Arc<crate::policy::PolicyVersion>),
    ZoneAdded(ZoneId),
    ZoneRemoved(ZoneId),
}

//----------- Persisted state snapshot ------------------------------------------------

/// The on-disk recovery snapshot of known zones and policies (§6's
/// "persisted state" requirement), saved with the same debounced
/// dirty-flag-plus-delayed-write approach used for signer configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StateSpec {
    pub zones: Vec<ZoneSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ZoneSpec {
    pub name: Box<str>,
    pub policy: Box<str>,
}

impl StateSpec {
    pub fn build(center: &Center) -> io::Result<Self> {
        let txn = center.db.transaction().map_err(|e| io::Error::other(e.to_string()))?;
        Ok(StateSpec {
            zones: txn
                .list_zones()
                .map(|z| ZoneSpec { name: z.name.clone(), policy: z.policy.clone() })
                .collect(),
        })
    }

    pub fn save(&self, path: &Utf8PathBuf) -> io::Result<()> {
        let text = toml::to_string_pretty(self).map_err(io::Error::other)?;
        crate::util::write_file(path, text.as_bytes())
    }

    pub fn load(path: &Utf8PathBuf) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(io::Error::other)
    }

    /// Recreate zones from a saved snapshot without re-running the normal
    /// `zone add` validation (the policies that own them are trusted to
    /// already be loaded).
    pub fn restore_into(&self, center: &Center) {
        let mut txn = center.db.transaction().expect("in-process database never refuses a transaction");
        for zone in &self.zones {
            if txn.get_zone_by_name(&zone.name).is_none() {
                txn.create_zone(zone.name.clone(), zone.policy.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::file::Spec;

    fn test_center() -> Center {
        let config = Config::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let logger: &'static Logger = Box::leak(Box::new(Logger::for_tests()));
        let center = Center::new(config, logger, tx);
        center.policies.lock().unwrap().insert("default".into(), Policy::new(Spec::default().parse("default")));
        center
    }

    #[test]
    fn add_zone_rejects_unknown_policy() {
        let center = test_center();
        let err = add_zone(&center, "example.", "nonexistent").unwrap_err();
        assert_eq!(err, ZoneAddError::NoSuchPolicy);
    }

    #[test]
    fn add_zone_enqueues_an_enforce_task() {
        let center = test_center();
        add_zone(&center, "example.", "default").unwrap();
        assert_eq!(center.scheduler.pending_count(), 1);
    }

    #[test]
    fn state_round_trips_through_a_file() {
        let center = test_center();
        add_zone(&center, "example.", "default").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("state.toml")).unwrap();
        let spec = StateSpec::build(&center).unwrap();
        spec.save(&path).unwrap();
        let back = StateSpec::load(&path).unwrap();
        assert_eq!(back.zones.len(), 1);
    }
}

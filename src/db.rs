//! The persistence abstraction: typed retrieval and mutation of zones,
//! keys, policies and HSM key handles inside a transaction.
//!
//! The reference backend is an in-process, `Mutex`-guarded table set
//! (mirroring the rest of the daemon's single `Mutex<State>` behind an
//! `Arc` pattern) rather than a real SQL engine. A transaction borrows the
//! guard for its duration: "commit" is dropping the guard after mutations
//! land on the owned tables, "rollback" is discarding a [`Transaction`]
//! without calling [`Transaction::commit`].

use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::{HsmKey, HsmKeyId, Key, KeyDependency, KeyDependencyId, KeyId, Zone, ZoneId};
use crate::error::EnforcerError;

//----------- Tables ---------------------------------------------------------------

#[derive(Debug, Default)]
struct Tables {
    next_zone_id: u64,
    next_key_id: u64,
    next_hsm_key_id: u64,
    next_dependency_id: u64,

    zones: foldhash::HashMap<ZoneId, Zone>,
    zones_by_name: foldhash::HashMap<Box<str>, ZoneId>,
    keys: foldhash::HashMap<KeyId, Key>,
    hsm_keys: foldhash::HashMap<HsmKeyId, HsmKey>,
    dependencies: foldhash::HashMap<KeyDependencyId, KeyDependency>,
}

//----------- Database --------------------------------------------------------------

/// The in-process database backend. Cheap to clone (an `Arc` handle).
#[derive(Clone, Debug, Default)]
pub struct Database {
    tables: Arc<Mutex<Tables>>,
}

impl Database {
    pub fn new() -> Self {
        Database::default()
    }

    /// Open a transaction. The guard is held for the transaction's entire
    /// lifetime, modeling the "a zone-level advisory lock taken inside a
    /// transaction" serialisation point of the concurrency model: only one
    /// transaction can be open process-wide at a time in this reference
    /// backend.
    pub fn transaction(&self) -> Result<Transaction<'_>, EnforcerError> {
        let guard = self
            .tables
            .lock()
            .map_err(|_| EnforcerError::Fatal("database mutex poisoned".into()))?;
        Ok(Transaction { tables: guard })
    }
}

//----------- Transaction -----------------------------------------------------------

pub struct Transaction<'a> {
    tables: MutexGuard<'a, Tables>,
}

impl Transaction<'_> {
    /// Commit: a no-op beyond dropping the guard, since mutations are
    /// already applied to the owned tables as they happen.
    pub fn commit(self) {
        drop(self);
    }

    //--- Zones

    pub fn get_zone_by_name(&self, name: &str) -> Option<&Zone> {
        let id = *self.tables.zones_by_name.get(name)?;
        self.tables.zones.get(&id)
    }

    pub fn get_zone(&self, id: ZoneId) -> Option<&Zone> {
        self.tables.zones.get(&id)
    }

    pub fn get_zone_mut(&mut self, id: ZoneId) -> Option<&mut Zone> {
        self.tables.zones.get_mut(&id)
    }

    pub fn list_zones(&self) -> impl Iterator<Item = &Zone> {
        self.tables.zones.values()
    }

    pub fn list_zones_for_policy<'t>(&'t self, policy: &'t str) -> impl Iterator<Item = &'t Zone> {
        self.tables.zones.values().filter(move |z| &*z.policy == policy)
    }

    pub fn create_zone(&mut self, name: impl Into<Box<str>>, policy: impl Into<Box<str>>) -> ZoneId {
        let name = name.into();
        let id = ZoneId(self.tables.next_zone_id);
        self.tables.next_zone_id += 1;
        let zone = Zone::new(id, name.clone(), policy);
        self.tables.zones.insert(id, zone);
        self.tables.zones_by_name.insert(name, id);
        id
    }

    pub fn delete_zone(&mut self, id: ZoneId) {
        if let Some(zone) = self.tables.zones.remove(&id) {
            self.tables.zones_by_name.remove(&zone.name);
        }
        self.tables.keys.retain(|_, k| k.zone != id);
    }

    //--- Keys

    pub fn get_key(&self, id: KeyId) -> Option<&Key> {
        self.tables.keys.get(&id)
    }

    pub fn get_key_mut(&mut self, id: KeyId) -> Option<&mut Key> {
        self.tables.keys.get_mut(&id)
    }

    pub fn list_keys(&self, zone: ZoneId) -> impl Iterator<Item = &Key> {
        self.tables.keys.values().filter(move |k| k.zone == zone)
    }

    pub fn insert_key(&mut self, mut key: Key) -> KeyId {
        let id = KeyId(self.tables.next_key_id);
        self.tables.next_key_id += 1;
        key.id = id;
        self.tables.keys.insert(id, key);
        id
    }

    pub fn delete_key(&mut self, id: KeyId) {
        self.tables.keys.remove(&id);
        self.tables.dependencies.retain(|_, d| d.from != id && d.to != id);
    }

    //--- HSM keys

    pub fn get_hsm_key(&self, id: HsmKeyId) -> Option<&HsmKey> {
        self.tables.hsm_keys.get(&id)
    }

    pub fn get_hsm_key_mut(&mut self, id: HsmKeyId) -> Option<&mut HsmKey> {
        self.tables.hsm_keys.get_mut(&id)
    }

    pub fn list_hsm_keys(&self) -> impl Iterator<Item = &HsmKey> {
        self.tables.hsm_keys.values()
    }

    pub fn list_hsm_keys_mut(&mut self) -> impl Iterator<Item = &mut HsmKey> {
        self.tables.hsm_keys.values_mut()
    }

    pub fn insert_hsm_key(&mut self, mut key: HsmKey) -> HsmKeyId {
        let id = HsmKeyId(self.tables.next_hsm_key_id);
        self.tables.next_hsm_key_id += 1;
        key.id = id;
        self.tables.hsm_keys.insert(id, key);
        id
    }

    //--- Key dependencies

    pub fn list_dependencies(&self, zone: ZoneId) -> impl Iterator<Item = &KeyDependency> {
        self.tables.dependencies.values().filter(move |d| d.zone == zone)
    }

    pub fn insert_dependency(&mut self, mut dep: KeyDependency) -> KeyDependencyId {
        let id = KeyDependencyId(self.tables.next_dependency_id);
        self.tables.next_dependency_id += 1;
        dep.id = id;
        self.tables.dependencies.insert(id, dep);
        id
    }

    pub fn delete_dependency(&mut self, id: KeyDependencyId) {
        self.tables.dependencies.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_fetch_zone() {
        let db = Database::new();
        let id = {
            let mut txn = db.transaction().unwrap();
            let id = txn.create_zone("example.", "default");
            txn.commit();
            id
        };

        let txn = db.transaction().unwrap();
        assert_eq!(txn.get_zone(id).unwrap().name.as_ref(), "example.");
        assert_eq!(txn.get_zone_by_name("example.").unwrap().id, id);
    }

    #[test]
    fn delete_zone_drops_its_keys() {
        let db = Database::new();
        let mut txn = db.transaction().unwrap();
        let zone = txn.create_zone("example.", "default");
        let hsm = txn.insert_hsm_key(HsmKey {
            id: HsmKeyId(0),
            locator: "loc".into(),
            bits: 256,
            algorithm: 13,
            repository: "default".into(),
            policy: "default".into(),
            role: crate::domain::KeyRole::Zsk,
            inception: None,
            candidate_for_sharing: false,
            revoke: false,
            backed_up: false,
            used_by_zones: vec![],
        });
        let key_id = txn.insert_key(Key {
            id: KeyId(0),
            zone,
            hsm_key: hsm,
            role: crate::domain::KeyRole::Zsk,
            algorithm: 13,
            inception: crate::domain::UnixTime::now(),
            introducing: true,
            standby: false,
            ds_at_parent: crate::domain::DsAtParent::Unsubmitted,
            keytag: 0,
            states: vec![],
            manual_roll: false,
        });
        txn.delete_zone(zone);
        assert!(txn.get_key(key_id).is_none());
    }
}

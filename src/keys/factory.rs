//! The key material factory: satisfies requests for key material without
//! blocking the enforcer on HSM latency, backed by a pre-generated pool of
//! [`HsmKey`] rows.

use crate::db::Transaction;
use crate::domain::{DsAtParent, HsmKey, HsmKeyId, Key, KeyId, KeyRole, KeyState, RecordKind, UnixTime, ZoneId};
use crate::error::EnforcerError;

/// An opaque key-material repository (the HSM). The core never sees
/// private key bytes, only locators handed back from `generate`.
pub trait KeyMaterialRepository: Send + Sync {
    /// Generate one new key and return its locator.
    fn generate(&self, bits: u32, algorithm: u8) -> Result<Box<str>, EnforcerError>;

    fn list(&self) -> Vec<Box<str>>;

    fn locate_by_id(&self, locator: &str) -> Option<Box<str>>;

    fn backup(&self, locator: &str) -> Result<(), EnforcerError>;
}

/// A software-only repository that hands out locators without doing any
/// actual cryptography; matches "the core sees an opaque repository".
#[derive(Default)]
pub struct SoftwareRepository {
    counter: std::sync::atomic::AtomicU64,
}

impl KeyMaterialRepository for SoftwareRepository {
    fn generate(&self, bits: u32, algorithm: u8) -> Result<Box<str>, EnforcerError> {
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(format!("sw-{algorithm}-{bits}-{n:016x}").into())
    }

    fn list(&self) -> Vec<Box<str>> {
        Vec::new()
    }

    fn locate_by_id(&self, locator: &str) -> Option<Box<str>> {
        Some(locator.into())
    }

    fn backup(&self, _locator: &str) -> Result<(), EnforcerError> {
        Ok(())
    }
}

/// A request for one slot's worth of key material.
#[derive(Clone, Debug)]
pub struct KeyRequest<'a> {
    pub bits: u32,
    pub repository: &'a str,
    pub policy: &'a str,
    pub algorithm: u8,
    pub role: KeyRole,
}

/// Claim an unused pre-generated [`HsmKey`] matching `req` exactly, stamp
/// its inception, and return its id.
pub fn create_new_key(txn: &mut Transaction<'_>, req: &KeyRequest<'_>, now: UnixTime) -> Result<HsmKeyId, EnforcerError> {
    let found = txn
        .list_hsm_keys()
        .find(|k| {
            k.inception.is_none()
                && k.bits == req.bits
                && &*k.repository == req.repository
                && &*k.policy == req.policy
                && k.algorithm == req.algorithm
                && k.role == req.role
        })
        .map(|k| k.id);

    let Some(id) = found else {
        return Err(EnforcerError::Shortage {
            bits: req.bits,
            repository: req.repository.into(),
            policy: req.policy.into(),
        });
    };

    let hsm_key = txn.get_hsm_key_mut(id).expect("just found by id");
    hsm_key.inception = Some(now);
    Ok(id)
}

/// Like [`create_new_key`], but additionally marks the key as a sharing
/// candidate and records `zone` as a user.
pub fn create_shared_key(
    txn: &mut Transaction<'_>,
    req: &KeyRequest<'_>,
    zone: ZoneId,
    now: UnixTime,
) -> Result<HsmKeyId, EnforcerError> {
    let id = create_new_key(txn, req, now)?;
    let hsm_key = txn.get_hsm_key_mut(id).expect("just created");
    hsm_key.candidate_for_sharing = true;
    hsm_key.used_by_zones.push(zone);
    Ok(id)
}

/// Find an in-use [`HsmKey`] matching `req` whose `used_by_zones` does not
/// already contain `zone`, and add it.
pub fn use_shared_key(txn: &mut Transaction<'_>, req: &KeyRequest<'_>, zone: ZoneId) -> Result<HsmKeyId, EnforcerError> {
    let found = txn
        .list_hsm_keys()
        .find(|k| {
            k.candidate_for_sharing
                && k.inception.is_some()
                && k.bits == req.bits
                && &*k.repository == req.repository
                && &*k.policy == req.policy
                && k.algorithm == req.algorithm
                && k.role == req.role
                && !k.used_by_zones.contains(&zone)
        })
        .map(|k| k.id);

    let Some(id) = found else {
        return Err(EnforcerError::Shortage {
            bits: req.bits,
            repository: req.repository.into(),
            policy: req.policy.into(),
        });
    };

    let hsm_key = txn.get_hsm_key_mut(id).expect("just found by id");
    hsm_key.used_by_zones.push(zone);
    Ok(id)
}

pub fn get_by_locator<'t>(txn: &'t Transaction<'_>, locator: &str) -> Option<&'t HsmKey> {
    txn.list_hsm_keys().find(|k| &*k.locator == locator)
}

/// Generate `count` fresh, unused [`HsmKey`] rows for a shortage. Called by
/// the scheduler's `key-generate` task.
pub fn replenish(
    txn: &mut Transaction<'_>,
    repo: &dyn KeyMaterialRepository,
    req: &KeyRequest<'_>,
    count: u32,
) -> Result<(), EnforcerError> {
    for _ in 0..count {
        let locator = repo.generate(req.bits, req.algorithm)?;
        txn.insert_hsm_key(HsmKey {
            id: HsmKeyId(0),
            locator,
            bits: req.bits,
            algorithm: req.algorithm,
            repository: req.repository.into(),
            policy: req.policy.into(),
            role: req.role,
            inception: None,
            candidate_for_sharing: false,
            revoke: false,
            backed_up: false,
            used_by_zones: Vec::new(),
        });
    }
    Ok(())
}

/// Instantiate a fresh [`Key`] referencing `hsm_key`, with all four states
/// initialised per §4.4 step 3b: HIDDEN where the role cares about the
/// record, NOCARE elsewhere, DNSKEY always HIDDEN initially.
pub fn new_key(zone: ZoneId, hsm_key: HsmKeyId, role: KeyRole, algorithm: u8, now: UnixTime) -> Key {
    let states = RecordKind::ALL
        .into_iter()
        .map(|kind| {
            let cares = match kind {
                RecordKind::Ds => role.cares_about_ds(),
                RecordKind::Dnskey => true,
                RecordKind::RrsigDnskey => true,
                RecordKind::Rrsig => role.cares_about_rrsig(),
            };
            if cares {
                KeyState::new_hidden(kind, now, false)
            } else {
                KeyState::new_nocare(kind, now)
            }
        })
        .collect();

    Key {
        id: KeyId(0),
        zone,
        hsm_key,
        role,
        algorithm,
        inception: now,
        introducing: true,
        standby: false,
        ds_at_parent: DsAtParent::Unsubmitted,
        keytag: 0,
        states,
        manual_roll: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_key(role: KeyRole) -> HsmKey {
        HsmKey {
            id: HsmKeyId(0),
            locator: "loc".into(),
            bits: 256,
            algorithm: 13,
            repository: "default".into(),
            policy: "default".into(),
            role,
            inception: None,
            candidate_for_sharing: false,
            revoke: false,
            backed_up: false,
            used_by_zones: Vec::new(),
        }
    }

    #[test]
    fn create_new_key_claims_matching_unused_row() {
        let db = crate::db::Database::new();
        let mut txn = db.transaction().unwrap();
        txn.insert_hsm_key(pool_key(KeyRole::Zsk));

        let req = KeyRequest {
            bits: 256,
            repository: "default",
            policy: "default",
            algorithm: 13,
            role: KeyRole::Zsk,
        };
        let id = create_new_key(&mut txn, &req, UnixTime::now()).unwrap();
        assert!(txn.get_hsm_key(id).unwrap().inception.is_some());
    }

    #[test]
    fn create_new_key_reports_shortage_when_pool_empty() {
        let db = crate::db::Database::new();
        let mut txn = db.transaction().unwrap();
        let req = KeyRequest {
            bits: 256,
            repository: "default",
            policy: "default",
            algorithm: 13,
            role: KeyRole::Zsk,
        };
        let err = create_new_key(&mut txn, &req, UnixTime::now()).unwrap_err();
        assert!(matches!(err, EnforcerError::Shortage { .. }));
    }

    #[test]
    fn use_shared_key_avoids_double_counting_a_zone() {
        let db = crate::db::Database::new();
        let mut txn = db.transaction().unwrap();
        let zone = txn.create_zone("example.", "default");
        let req = KeyRequest {
            bits: 256,
            repository: "default",
            policy: "default",
            algorithm: 13,
            role: KeyRole::Zsk,
        };
        let id = create_shared_key(&mut txn, &req, zone, UnixTime::now()).unwrap();
        assert!(use_shared_key(&mut txn, &req, zone).is_err());
        let other_zone = txn.create_zone("other.", "default");
        let got = use_shared_key(&mut txn, &req, other_zone).unwrap();
        assert_eq!(got, id);
    }
}

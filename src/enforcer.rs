//! The zone enforcer: the single `enforce(zone)` operation tying the
//! reconciler and state engine together (§4.5).

use std::sync::Mutex;

use crate::db::Database;
use crate::domain::{DsAtParent, RecordKind, UnixTime, ZoneId};
use crate::error::EnforcerError;
use crate::keys::factory::KeyMaterialRepository;
use crate::keys::{engine, reconciler};
use crate::policy::Policy;

/// Per-zone advisory locks (§5): serialises `enforce` with any other
/// zone-touching command on the same zone. The in-memory backend has no
/// row-level granularity of its own, so this is the only thing standing
/// in for it.
#[derive(Default)]
pub struct ZoneLocks {
    locks: Mutex<foldhash::HashMap<ZoneId, ()>>,
}

impl ZoneLocks {
    pub fn guard(&self, zone: ZoneId) -> ZoneGuard<'_> {
        loop {
            {
                let mut locks = self.locks.lock().unwrap();
                if !locks.contains_key(&zone) {
                    locks.insert(zone, ());
                    return ZoneGuard { locks: &self.locks, zone };
                }
            }
            std::thread::yield_now();
        }
    }
}

pub struct ZoneGuard<'a> {
    locks: &'a Mutex<foldhash::HashMap<ZoneId, ()>>,
    zone: ZoneId,
}

impl Drop for ZoneGuard<'_> {
    fn drop(&mut self) {
        self.locks.lock().unwrap().remove(&self.zone);
    }
}

/// The outcome of one `enforce` call.
pub struct EnforceOutcome {
    pub next_change: Option<UnixTime>,
    pub signconf_dirty: bool,
    /// Keytags the operator should be told to submit/retract a DS for.
    pub ds_submit: Vec<u16>,
    pub ds_retract: Vec<u16>,
}

/// Run one enforcement pass over `zone`, per §4.5 steps 1-9.
pub fn enforce(
    db: &Database,
    repo: &dyn KeyMaterialRepository,
    locks: &ZoneLocks,
    zone_id: ZoneId,
    policy: &Policy,
    now: UnixTime,
) -> Result<EnforceOutcome, EnforcerError> {
    let _guard = locks.guard(zone_id);

    let mut txn = db.transaction()?;

    let reconcile_outcome = reconciler::reconcile(&mut txn, repo, zone_id, &policy.latest, now)?;

    let mut keys: Vec<_> = txn.list_keys(zone_id).cloned().collect();
    let zone_snapshot = txn
        .get_zone(zone_id)
        .ok_or_else(|| EnforcerError::InvariantViolated(format!("zone {zone_id} vanished mid-enforce")))?
        .clone();

    let sweep_outcome = engine::sweep(&mut keys, &zone_snapshot, &policy.latest.timing, reconcile_outcome.allow_unsigned, now);

    let mut ds_submit = Vec::new();
    let mut ds_retract = Vec::new();

    for key in &mut keys {
        let ds = key.state(RecordKind::Ds);
        let just_rumoured = ds.value == crate::domain::KeyStateValue::Rumoured && ds.last_change == now;
        let just_unretentive = ds.value == crate::domain::KeyStateValue::Unretentive && ds.last_change == now;

        if just_rumoured && key.ds_at_parent == DsAtParent::Unsubmitted {
            key.ds_at_parent = DsAtParent::Submit;
            ds_submit.push(key.keytag);
        }
        if just_unretentive && matches!(key.ds_at_parent, DsAtParent::Seen | DsAtParent::Submitted) {
            key.ds_at_parent = DsAtParent::Retract;
            ds_retract.push(key.keytag);
        }

        let stored = txn.get_key_mut(key.id).ok_or_else(|| {
            EnforcerError::InvariantViolated(format!("key {} vanished mid-enforce", key.id))
        })?;
        *stored = key.clone();
    }

    let next_change = match (reconcile_outcome.next_time, sweep_outcome.next_time) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };

    let zone = txn
        .get_zone_mut(zone_id)
        .ok_or_else(|| EnforcerError::InvariantViolated(format!("zone {zone_id} vanished mid-enforce")))?;
    zone.next_change = next_change;
    if sweep_outcome.signconf_dirty {
        zone.signconf_dirty = true;
    }

    for keytag in &ds_submit {
        tracing::warn!("please submit DS with keytag {keytag} for zone '{}'", zone.name);
    }
    for keytag in &ds_retract {
        tracing::warn!("please remove DS with keytag {keytag} for zone '{}'", zone.name);
    }

    txn.commit();

    Ok(EnforceOutcome {
        next_change,
        signconf_dirty: sweep_outcome.signconf_dirty,
        ds_submit,
        ds_retract,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::KeyRole;
    use crate::domain::KeyStateValue::{NoCare, Omnipresent, Rumoured};
    use crate::keys::factory::{self, KeyRequest, SoftwareRepository};
    use crate::policy::file::{KeyRoleSpec, KeySpec, Spec};
    use crate::policy::KeyParameters;

    #[test]
    fn enforce_is_idempotent_on_an_unaltered_zone() {
        let db = Database::new();
        let repo = SoftwareRepository::default();
        let locks = ZoneLocks::default();
        let policy = Policy::new(Spec::default().parse("default"));

        let zone_id = {
            let mut txn = db.transaction().unwrap();
            let id = txn.create_zone("example.", "default");
            txn.commit();
            id
        };

        let now = UnixTime::now();
        let first = enforce(&db, &repo, &locks, zone_id, &policy, now).unwrap();
        let second = enforce(&db, &repo, &locks, zone_id, &policy, now).unwrap();
        assert_eq!(first.next_change, second.next_change);
    }

    fn ksk_zsk_policy() -> Policy {
        let spec = Spec {
            keys: vec![
                KeySpec {
                    role: KeyRoleSpec::Ksk,
                    algorithm: KeyParameters::RsaSha256(2048),
                    lifetime: std::time::Duration::from_secs(365 * 86400),
                    ..KeySpec::default()
                },
                KeySpec {
                    role: KeyRoleSpec::Zsk,
                    algorithm: KeyParameters::RsaSha256(1024),
                    lifetime: std::time::Duration::from_secs(90 * 86400),
                    ..KeySpec::default()
                },
            ],
            ..Spec::default()
        };
        Policy::new(spec.parse("default"))
    }

    /// S1: a freshly-added zone with a KSK+ZSK policy rumours every record
    /// both keys care about on the very first tick (no timing delay gates
    /// entry into RUMOURED), asks the operator to submit the KSK's DS, and
    /// settles to OMNIPRESENT everywhere once enough time has passed.
    #[test]
    fn cold_start_ksk_and_zsk_rumour_immediately_then_settle_to_omnipresent() {
        let db = Database::new();
        let repo = SoftwareRepository::default();
        let locks = ZoneLocks::default();
        let policy = ksk_zsk_policy();

        let zone_id = {
            let mut txn = db.transaction().unwrap();
            let id = txn.create_zone("example.", "default");
            txn.commit();
            id
        };

        {
            let mut txn = db.transaction().unwrap();
            for slot in &policy.latest.keys {
                factory::replenish(
                    &mut txn,
                    &repo,
                    &KeyRequest {
                        bits: slot.algorithm.bits(),
                        repository: &slot.repository,
                        policy: &policy.latest.name,
                        algorithm: slot.algorithm.algorithm_number(),
                        role: slot.role,
                    },
                    1,
                )
                .unwrap();
            }
            txn.commit();
        }

        let now = UnixTime::now();
        let first = enforce(&db, &repo, &locks, zone_id, &policy, now).unwrap();
        assert!(first.next_change.is_some());
        assert_eq!(first.ds_submit.len(), 1);
        assert!(first.ds_retract.is_empty());

        {
            let txn = db.transaction().unwrap();
            let ksk = txn.list_keys(zone_id).find(|k| k.role == KeyRole::Ksk).unwrap();
            assert_eq!(ksk.state(RecordKind::Ds).value, Rumoured);
            assert_eq!(ksk.state(RecordKind::Dnskey).value, Rumoured);
            assert_eq!(ksk.state(RecordKind::RrsigDnskey).value, Rumoured);
            assert_eq!(ksk.state(RecordKind::Rrsig).value, NoCare);

            let zsk = txn.list_keys(zone_id).find(|k| k.role == KeyRole::Zsk).unwrap();
            assert_eq!(zsk.state(RecordKind::Ds).value, NoCare);
            assert_eq!(zsk.state(RecordKind::Dnskey).value, Rumoured);
            assert_eq!(zsk.state(RecordKind::RrsigDnskey).value, Rumoured);
            assert_eq!(zsk.state(RecordKind::Rrsig).value, Rumoured);
        }

        // Safely past every timing gate computed from this policy's default
        // TimingPolicy (the largest being DS's registration_delay+ttl+
        // propagation_delay = 93600s).
        let later = now + std::time::Duration::from_secs(200_000);
        enforce(&db, &repo, &locks, zone_id, &policy, later).unwrap();

        let txn = db.transaction().unwrap();
        let ksk = txn.list_keys(zone_id).find(|k| k.role == KeyRole::Ksk).unwrap();
        assert_eq!(ksk.state(RecordKind::Ds).value, Omnipresent);
        assert_eq!(ksk.state(RecordKind::Dnskey).value, Omnipresent);
        assert_eq!(ksk.state(RecordKind::RrsigDnskey).value, Omnipresent);

        let zsk = txn.list_keys(zone_id).find(|k| k.role == KeyRole::Zsk).unwrap();
        assert_eq!(zsk.state(RecordKind::Dnskey).value, Omnipresent);
        assert_eq!(zsk.state(RecordKind::RrsigDnskey).value, Omnipresent);
        assert_eq!(zsk.state(RecordKind::Rrsig).value, Omnipresent);
    }

    /// S4: a policy with zero key slots waives the whole DNSSEC apparatus —
    /// no keys, no DS bookkeeping, nothing ever pending.
    #[test]
    fn zero_key_policy_stays_unsigned_and_quiescent() {
        let db = Database::new();
        let repo = SoftwareRepository::default();
        let locks = ZoneLocks::default();
        let policy = Policy::new(Spec::default().parse("unsigned"));

        let zone_id = {
            let mut txn = db.transaction().unwrap();
            let id = txn.create_zone("example.", "unsigned");
            txn.commit();
            id
        };

        let outcome = enforce(&db, &repo, &locks, zone_id, &policy, UnixTime::now()).unwrap();
        assert!(outcome.ds_submit.is_empty());
        assert!(outcome.ds_retract.is_empty());
        assert!(!outcome.signconf_dirty);
        assert!(outcome.next_change.is_none());

        let txn = db.transaction().unwrap();
        assert_eq!(txn.list_keys(zone_id).count(), 0);
    }

    /// S6: an empty HSM pool can't satisfy a key-requiring policy. `enforce`
    /// doesn't fail the whole pass — it logs the shortage, leaves the zone
    /// with no keys, and asks to be retried shortly.
    #[test]
    fn hsm_shortage_is_swallowed_and_retried_shortly() {
        let db = Database::new();
        let repo = SoftwareRepository::default();
        let locks = ZoneLocks::default();
        let policy = ksk_zsk_policy();

        let zone_id = {
            let mut txn = db.transaction().unwrap();
            let id = txn.create_zone("example.", "default");
            txn.commit();
            id
        };

        let now = UnixTime::now();
        let outcome = enforce(&db, &repo, &locks, zone_id, &policy, now).unwrap();
        assert!(outcome.ds_submit.is_empty());
        assert_eq!(outcome.next_change, Some(now + std::time::Duration::from_secs(60)));

        let txn = db.transaction().unwrap();
        assert_eq!(txn.list_keys(zone_id).count(), 0);
    }
}

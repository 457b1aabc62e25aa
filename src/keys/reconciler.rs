//! The policy→keys reconciler: materialises the keys a policy requires,
//! rolls keys at end of life, and purges keys that have fully retired.

use crate::db::Transaction;
use crate::domain::{Key, KeyRole, UnixTime, ZoneId};
use crate::error::EnforcerError;
use crate::keys::factory::{self, KeyMaterialRepository, KeyRequest};
use crate::policy::PolicyVersion;

pub struct ReconcileOutcome {
    /// `true` once the policy defines zero key slots across all roles.
    pub allow_unsigned: bool,
    /// The earliest time reconciliation should be attempted again (for
    /// example, a slot's current key has not yet reached its lifetime, or
    /// a shortage pushed the retry out by 60s).
    pub next_time: Option<UnixTime>,
}

const SHORTAGE_RETRY: std::time::Duration = std::time::Duration::from_secs(60);

/// Run one reconciliation pass for `zone` against `policy`, per §4.4.
pub fn reconcile(
    txn: &mut Transaction<'_>,
    repo: &dyn KeyMaterialRepository,
    zone: ZoneId,
    policy: &PolicyVersion,
    now: UnixTime,
) -> Result<ReconcileOutcome, EnforcerError> {
    let allow_unsigned = policy.keys.is_empty();
    let mut next_time: Option<UnixTime> = None;

    // Step 1: age out keys whose (role, algorithm, bits, repository) no
    // longer matches any slot in the policy.
    let stale: Vec<_> = txn
        .list_keys(zone)
        .filter(|k| !policy.keys.iter().any(|slot| key_matches_slot(txn, k, slot)))
        .map(|k| k.id)
        .collect();
    for id in stale {
        if let Some(key) = txn.get_key_mut(id) {
            key.introducing = false;
        }
    }

    let force_roll = {
        let z = txn.get_zone(zone).expect("zone exists during its own reconcile");
        (
            z.roll_now_for(KeyRole::Ksk),
            z.roll_now_for(KeyRole::Zsk),
            z.roll_now_for(KeyRole::Csk),
        )
    };

    // Step 3: for every slot, ensure standby_count + 1 live instances.
    for slot in &policy.keys {
        let forced = match slot.role {
            KeyRole::Ksk => force_roll.0,
            KeyRole::Zsk => force_roll.1,
            KeyRole::Csk => force_roll.2,
        };

        for _ in 0..=slot.standby_count {
            let youngest = txn
                .list_keys(zone)
                .filter(|k| key_matches_slot(txn, k, slot))
                .max_by_key(|k| k.inception.0)
                .map(|k| (k.id, k.inception));

            if let Some((_, inception)) = youngest {
                if !forced && !slot.manual_rollover {
                    let expiry = inception + slot.lifetime;
                    if expiry > now {
                        next_time = Some(next_time.map_or(expiry, |t| t.min(expiry)));
                        continue;
                    }
                }
            }

            let req = KeyRequest {
                bits: slot.algorithm.bits(),
                repository: &slot.repository,
                policy: &policy.name,
                algorithm: slot.algorithm.algorithm_number(),
                role: slot.role,
            };

            let hsm_key = if policy.share_keys {
                factory::use_shared_key(txn, &req, zone).or_else(|_| factory::create_shared_key(txn, &req, zone, now))
            } else {
                factory::create_new_key(txn, &req, now)
            };

            let hsm_key = match hsm_key {
                Ok(id) => id,
                Err(EnforcerError::Shortage { bits, repository, policy: pol }) => {
                    tracing::warn!("key shortage: no spare {bits}-bit key in repository '{repository}' for policy '{pol}'");
                    let _ = repo; // kept for symmetry with the caller who triggers replenishment
                    next_time = Some(next_time.map_or(now + SHORTAGE_RETRY, |t| t.min(now + SHORTAGE_RETRY)));
                    continue;
                }
                Err(err) => return Err(err),
            };

            let new_key = factory::new_key(zone, hsm_key, slot.role, slot.algorithm.algorithm_number(), now);
            let new_id = txn.insert_key(new_key);

            // Step 3c: any existing key of the same slot but a different
            // HSM locator is now being rolled away.
            let locator = txn.get_hsm_key(hsm_key).map(|h| h.locator.clone());
            let siblings: Vec<_> = txn
                .list_keys(zone)
                .filter(|k| k.id != new_id && key_matches_slot(txn, k, slot))
                .filter(|k| txn.get_hsm_key(k.hsm_key).map(|h| h.locator.clone()) != locator)
                .map(|k| k.id)
                .collect();
            for id in siblings {
                if let Some(key) = txn.get_key_mut(id) {
                    key.introducing = false;
                }
            }
        }
    }

    if let Some(zone_mut) = txn.get_zone_mut(zone) {
        zone_mut.clear_roll_now_for(KeyRole::Ksk);
        zone_mut.clear_roll_now_for(KeyRole::Zsk);
        zone_mut.clear_roll_now_for(KeyRole::Csk);
    }

    // Step 4: purge keys fully retired and past purge-after.
    let purge: Vec<_> = txn
        .list_keys(zone)
        .filter(|k| k.is_fully_hidden() && now.saturating_sub(k.last_change()) >= policy.purge_after)
        .map(|k| (k.id, k.hsm_key))
        .collect();
    for (key_id, hsm_id) in purge {
        if let Some(hsm_key) = txn.get_hsm_key_mut(hsm_id) {
            hsm_key.used_by_zones.retain(|&z| z != zone);
        }
        txn.delete_key(key_id);
    }

    Ok(ReconcileOutcome { allow_unsigned, next_time })
}

/// Whether `key` satisfies `slot`: role, algorithm, bit-length and
/// repository must all agree, since a policy can define multiple slots of
/// the same role+algorithm that differ only in bits or repository.
fn key_matches_slot(txn: &Transaction<'_>, key: &Key, slot: &crate::policy::KeyConfig) -> bool {
    let Some(hsm_key) = txn.get_hsm_key(key.hsm_key) else {
        return false;
    };
    key.role == slot.role
        && key.algorithm == slot.algorithm.algorithm_number()
        && hsm_key.bits == slot.algorithm.bits()
        && hsm_key.repository.as_ref() == slot.repository.as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::factory::SoftwareRepository;
    use crate::policy::file::{KeyRoleSpec, KeySpec, Spec};

    fn ksk_zsk_spec() -> Spec {
        Spec {
            keys: vec![
                KeySpec {
                    role: KeyRoleSpec::Ksk,
                    ..KeySpec::default()
                },
                KeySpec {
                    role: KeyRoleSpec::Zsk,
                    ..KeySpec::default()
                },
            ],
            ..Spec::default()
        }
    }

    #[test]
    fn reconcile_creates_keys_for_a_fresh_zone() {
        let db = crate::db::Database::new();
        let repo = SoftwareRepository::default();
        let mut txn = db.transaction().unwrap();
        let zone = txn.create_zone("example.", "default");
        let version = ksk_zsk_spec().parse("default");
        let now = UnixTime::now();

        // Seed the pool since create_new_key never calls the repository
        // directly; only the scheduler's key-generate task does that.
        for slot in &version.keys {
            factory::replenish(
                &mut txn,
                &repo,
                &KeyRequest {
                    bits: slot.algorithm.bits(),
                    repository: &slot.repository,
                    policy: &version.name,
                    algorithm: slot.algorithm.algorithm_number(),
                    role: slot.role,
                },
                1,
            )
            .unwrap();
        }

        let outcome = reconcile(&mut txn, &repo, zone, &version, now).unwrap();
        assert!(!outcome.allow_unsigned);
        assert_eq!(txn.list_keys(zone).count(), version.keys.len());
    }

    /// S3: a ZSK at the end of its lifetime gets a successor, and the
    /// outgoing key is told to stop introducing (its siblings check, step
    /// 3c) without being deleted outright.
    #[test]
    fn a_zsk_past_its_lifetime_is_rolled_not_replaced_in_place() {
        let db = crate::db::Database::new();
        let repo = SoftwareRepository::default();
        let mut txn = db.transaction().unwrap();
        let zone = txn.create_zone("example.", "default");

        let spec = Spec {
            keys: vec![KeySpec {
                role: KeyRoleSpec::Zsk,
                lifetime: std::time::Duration::from_secs(90 * 86400),
                ..KeySpec::default()
            }],
            ..Spec::default()
        };
        let version = spec.parse("default");
        let slot = &version.keys[0];
        let req = KeyRequest {
            bits: slot.algorithm.bits(),
            repository: &slot.repository,
            policy: &version.name,
            algorithm: slot.algorithm.algorithm_number(),
            role: slot.role,
        };

        // Seed one old key, already at its lifetime boundary.
        factory::replenish(&mut txn, &repo, &req, 1).unwrap();
        let old_inception = UnixTime(0);
        let old_hsm = txn.list_hsm_keys().next().unwrap().id;
        txn.get_hsm_key_mut(old_hsm).unwrap().inception = Some(old_inception);
        let mut old_key = factory::new_key(zone, old_hsm, slot.role, slot.algorithm.algorithm_number(), old_inception);
        // An established, actively-signing key: not fully hidden, so step 4's
        // purge (gated only on `is_fully_hidden`) leaves it alone regardless
        // of `purge_after`.
        for kind in [crate::domain::RecordKind::Dnskey, crate::domain::RecordKind::RrsigDnskey, crate::domain::RecordKind::Rrsig] {
            old_key.state_mut(kind).value = crate::domain::KeyStateValue::Omnipresent;
        }
        let old_id = txn.insert_key(old_key);

        // Seed the pool with the key the reconciler should pick as successor.
        factory::replenish(&mut txn, &repo, &req, 1).unwrap();

        let now = old_inception + slot.lifetime;
        let outcome = reconcile(&mut txn, &repo, zone, &version, now).unwrap();
        assert!(!outcome.allow_unsigned);

        assert_eq!(txn.list_keys(zone).count(), 2);
        assert!(!txn.get_key(old_id).unwrap().introducing);
        let successor = txn.list_keys(zone).find(|k| k.id != old_id).unwrap();
        assert!(successor.introducing);
    }

    #[test]
    fn zero_key_policy_allows_unsigned() {
        let db = crate::db::Database::new();
        let repo = SoftwareRepository::default();
        let mut txn = db.transaction().unwrap();
        let zone = txn.create_zone("example.", "unsigned");
        let text = "[signature]\n[denial]\ntype = \"nsec\"\n[timing]\n";
        let spec: Spec = toml::from_str(text).unwrap();
        let version = spec.parse("unsigned");

        let outcome = reconcile(&mut txn, &repo, zone, &version, UnixTime::now()).unwrap();
        assert!(outcome.allow_unsigned);
        assert_eq!(txn.list_keys(zone).count(), 0);
    }
}

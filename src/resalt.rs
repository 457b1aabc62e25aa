//! NSEC3 resalting and signer-configuration emission (§4.8).

use std::time::Duration;

use camino::Utf8PathBuf;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::center::Center;
use crate::domain::{KeyRole, UnixTime, Zone};
use crate::error::EnforcerError;
use crate::policy::{DenialPolicy, Policy};
use crate::scheduler::{TaskKind, TaskTarget};

/// Resalt every NSEC3 policy whose `resalt_period` has elapsed, enqueueing
/// a `signconf` task for each of its zones.
pub fn resalt_due_policies(center: &Center, now: UnixTime) -> Result<Vec<Box<str>>, EnforcerError> {
    let rng = SystemRandom::new();
    let mut resalted = Vec::new();

    let mut policies = center.policies.lock().unwrap();
    for (name, policy) in policies.iter_mut() {
        let DenialPolicy::NSec3 { resalt_period, salt_length, .. } = &policy.latest.denial else {
            continue;
        };

        let due = policy
            .nsec3_salt_last_change
            .map(|last| last + *resalt_period <= now)
            .unwrap_or(true);
        if !due {
            continue;
        }

        let mut bytes = vec![0u8; *salt_length as usize];
        rng.fill(&mut bytes).map_err(|_| EnforcerError::Fatal("system RNG unavailable".into()))?;
        policy.nsec3_salt = Some(hex_encode(&bytes).into());
        policy.nsec3_salt_last_change = Some(now);
        resalted.push(name.clone());
    }
    drop(policies);

    let txn = center.db.transaction()?;
    for name in &resalted {
        for zone in txn.list_zones_for_policy(name) {
            center.scheduler.enqueue(TaskKind::Signconf, TaskTarget::Zone(zone.id), now);
        }
        tracing::info!("resalted policy '{name}'");
    }

    Ok(resalted)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

//----------- Signer configuration ------------------------------------------------------

/// The signer-configuration document emitted for one zone (§4.8's
/// "sign-conf"): timing, denial parameters and the set of keys to publish.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct SignerConfig {
    pub zone: Box<str>,
    #[serde(with = "crate::common::datetime::secs")]
    pub resign_interval: Duration,
    #[serde(with = "crate::common::datetime::secs")]
    pub refresh_interval: Duration,
    #[serde(with = "crate::common::datetime::secs")]
    pub validity: Duration,
    #[serde(with = "crate::common::datetime::secs")]
    pub jitter: Duration,
    #[serde(with = "crate::common::datetime::secs")]
    pub inception_offset: Duration,
    pub denial: SignerDenialConfig,
    pub keys: Vec<SignerKeyConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub enum SignerDenialConfig {
    #[default]
    NSec,
    NSec3 {
        opt_out: bool,
        hash_algorithm: crate::policy::Nsec3HashAlgorithm,
        iterations: u16,
        salt: Box<str>,
    },
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SignerKeyConfig {
    pub locator: Box<str>,
    pub algorithm: u8,
    pub role: KeyRole,
    pub active: bool,
}

/// Run the `signconf(zone)` task: read zone + policy + keys, diff against
/// the last written document, and write atomically only if changed.
pub fn emit_signconf(center: &Center, zone_id: crate::domain::ZoneId) -> Result<bool, EnforcerError> {
    let mut txn = center.db.transaction()?;
    let zone = txn
        .get_zone(zone_id)
        .ok_or_else(|| EnforcerError::InvariantViolated(format!("zone {zone_id} vanished before signconf")))?
        .clone();

    let policies = center.policies.lock().unwrap();
    let policy = policies
        .get(&zone.policy)
        .ok_or_else(|| EnforcerError::PolicyInvalid(format!("zone '{}' references unknown policy '{}'", zone.name, zone.policy)))?;

    let doc = build_signer_config(&zone, policy, txn.list_keys(zone_id).cloned().collect::<Vec<_>>().as_slice());
    drop(policies);

    let path = signconf_path(&center.config.signconf_dir, &zone.name);
    let changed = match std::fs::read_to_string(&path) {
        Ok(existing) => toml::from_str::<SignerConfig>(&existing).map(|prev| prev != doc).unwrap_or(true),
        Err(_) => true,
    };

    if changed {
        let text = toml::to_string_pretty(&doc).map_err(|e| EnforcerError::Fatal(e.to_string()))?;
        crate::util::write_file(&path, text.as_bytes()).map_err(|e| EnforcerError::Transient(e.to_string()))?;
        notify_signer(center, &zone.name);
    }

    if let Some(zone) = txn.get_zone_mut(zone_id) {
        zone.signconf_dirty = false;
    }
    txn.commit();

    Ok(changed)
}

fn build_signer_config(zone: &Zone, policy: &Policy, keys: &[crate::domain::Key]) -> SignerConfig {
    let denial = match &policy.latest.denial {
        DenialPolicy::NSec => SignerDenialConfig::NSec,
        DenialPolicy::NSec3 { opt_out, hash_algorithm, iterations, .. } => SignerDenialConfig::NSec3 {
            opt_out: *opt_out,
            hash_algorithm: *hash_algorithm,
            iterations: *iterations,
            salt: policy.nsec3_salt.clone().unwrap_or_default(),
        },
    };

    let keys = keys
        .iter()
        .filter(|k| k.is_publish())
        .map(|k| SignerKeyConfig {
            locator: format!("key-{}", k.id).into(),
            algorithm: k.algorithm,
            role: k.role,
            active: k.is_active(),
        })
        .collect();

    SignerConfig {
        zone: zone.name.clone(),
        resign_interval: policy.latest.signature.resign_interval,
        refresh_interval: policy.latest.signature.refresh_interval,
        validity: policy.latest.signature.validity,
        jitter: policy.latest.signature.jitter,
        inception_offset: policy.latest.signature.inception_offset,
        denial,
        keys,
    }
}

fn signconf_path(dir: &Utf8PathBuf, zone_name: &str) -> Utf8PathBuf {
    dir.join(format!("{zone_name}.toml"))
}

fn notify_signer(center: &Center, zone_name: &str) {
    let Some(command) = &center.config.signer_notify_command else {
        return;
    };
    match std::process::Command::new("sh").arg("-c").arg(format!("{command} {zone_name}")).status() {
        Ok(status) if status.success() => tracing::debug!("notified signer for zone '{zone_name}'"),
        Ok(status) => tracing::warn!("signer notification for '{zone_name}' exited with {status}"),
        Err(err) => tracing::warn!("failed to run signer notification for '{zone_name}': {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::file::{DenialSpec, Spec};
    use crate::policy::Nsec3HashAlgorithm;

    fn test_center() -> Center {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::Config::default();
        config.signconf_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::mem::forget(dir);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let logger: &'static crate::log::Logger = Box::leak(Box::new(crate::log::Logger::for_tests()));
        let center = Center::new(config, logger, tx);
        center.policies.lock().unwrap().insert("default".into(), Policy::new(Spec::default().parse("default")));
        center
    }

    #[test]
    fn resalt_is_a_no_op_before_the_period_elapses() {
        let center = test_center();
        let resalted = resalt_due_policies(&center, UnixTime(0)).unwrap();
        assert_eq!(resalted, vec!["default".into()]);
        let resalted_again = resalt_due_policies(&center, UnixTime(1)).unwrap();
        assert!(resalted_again.is_empty());
    }

    /// S5: a policy configured for weekly NSEC3 resalting with an 8-byte
    /// salt produces a 16-hex-character salt and wakes up `signconf` for
    /// every zone on that policy.
    #[test]
    fn resalt_emits_a_salt_of_the_configured_length_and_wakes_signconf() {
        let center = test_center();
        let spec = Spec {
            denial: DenialSpec::NSec3 {
                opt_out: false,
                ttl: Duration::from_secs(3600),
                resalt_period: Duration::from_secs(7 * 86400),
                hash_algorithm: Nsec3HashAlgorithm::Sha1,
                iterations: 0,
                salt_length: 8,
            },
            ..Spec::default()
        };
        center
            .policies
            .lock()
            .unwrap()
            .insert("resalted".into(), Policy::new(spec.parse("resalted")));

        let zone_id = {
            let mut txn = center.db.transaction().unwrap();
            let id = txn.create_zone("example.", "resalted");
            txn.commit();
            id
        };

        let resalted = resalt_due_policies(&center, UnixTime(0)).unwrap();
        assert!(resalted.contains(&Box::<str>::from("resalted")));

        let salt = center
            .policies
            .lock()
            .unwrap()
            .get("resalted")
            .unwrap()
            .nsec3_salt
            .clone()
            .unwrap();
        assert_eq!(salt.len(), 16); // 2 hex chars per salt byte, 8-byte salt

        let task = center.scheduler.pop_ready(UnixTime(0)).unwrap();
        assert_eq!(task.kind, TaskKind::Signconf);
        assert_eq!(task.target, TaskTarget::Zone(zone_id));

        // A week later it's due again.
        let not_due = resalt_due_policies(&center, UnixTime(86400)).unwrap();
        assert!(!not_due.contains(&Box::<str>::from("resalted")));
        let due_again = resalt_due_policies(&center, UnixTime(7 * 86400)).unwrap();
        assert!(due_again.contains(&Box::<str>::from("resalted")));
    }

    #[test]
    fn signconf_is_written_once_for_an_unchanged_zone() {
        let center = test_center();
        let zone_id = {
            let mut txn = center.db.transaction().unwrap();
            let id = txn.create_zone("example.", "default");
            txn.commit();
            id
        };
        let first = emit_signconf(&center, zone_id).unwrap();
        assert!(first);
        let second = emit_signconf(&center, zone_id).unwrap();
        assert!(!second);
    }
}

//! Key-management policy.

use std::fmt::{Display, Formatter};
use std::time::Duration;
use std::{fs, io};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::center::Change;
use crate::domain::{KeyRole, UnixTime};
use crate::error::PolicyReloadError;
use crate::config::Config;

pub mod file;

//----------- Policy -----------------------------------------------------------

/// A policy.
#[derive(Clone, Debug)]
pub struct Policy {
    /// The latest version of the policy.
    pub latest: std::sync::Arc<PolicyVersion>,

    /// Whether the policy is being deleted.
    ///
    /// This is an intermediate state used to prevent race conditions while
    /// the policy is being removed. In this state, new zones cannot be
    /// attached to this policy.
    pub mid_deletion: bool,

    /// The zones using this policy.
    pub zones: foldhash::HashSet<Box<str>>,

    /// The current NSEC3 salt, shared by every zone on this policy, and
    /// when it was last rotated. `None` until the first resalt, or always
    /// for an NSEC policy.
    pub nsec3_salt: Option<Box<str>>,
    pub nsec3_salt_last_change: Option<UnixTime>,
}

impl Policy {
    pub fn new(latest: PolicyVersion) -> Self {
        Policy {
            latest: std::sync::Arc::new(latest),
            mid_deletion: false,
            zones: Default::default(),
            nsec3_salt: None,
            nsec3_salt_last_change: None,
        }
    }

    /// Whether this policy defines no key slots in any role: §4.4's
    /// `allow_unsigned` condition.
    pub fn allow_unsigned(&self) -> bool {
        self.latest.keys.is_empty()
    }

    pub fn key_config(&self, role: KeyRole) -> Option<&KeyConfig> {
        self.latest.keys.iter().find(|k| k.role == role)
    }
}

//--- Loading / Saving

impl Policy {
    /// Reload this policy from its backing file.
    pub fn reload(&mut self, config: &Config, mut on_change: impl FnMut(Change)) -> io::Result<()> {
        let path = config.policy_dir.join(format!("{}.toml", self.latest.name));
        let spec = file::Spec::load(&path)?;
        let new = std::sync::Arc::new(spec.parse(&self.latest.name));
        if *self.latest != *new {
            let old = core::mem::replace(&mut self.latest, new.clone());
            (on_change)(Change::PolicyChanged(old, new));
        }
        Ok(())
    }
}

/// Reload every policy from `config.policy_dir`.
pub fn reload_all(
    policies: &mut foldhash::HashMap<Box<str>, Policy>,
    config: &Config,
    mut on_change: impl FnMut(Change),
) -> Result<(), PolicyReloadError> {
    let mut new_policies = foldhash::HashMap::<_, _>::default();

    for entry in fs::read_dir(&*config.policy_dir)
        .map_err(|e| PolicyReloadError::Io(config.policy_dir.clone(), e.to_string()))?
    {
        let entry =
            entry.map_err(|e| PolicyReloadError::Io(config.policy_dir.clone(), e.to_string()))?;

        let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
            tracing::warn!("Ignoring potential policy '{}': non-UTF-8 path", entry.path().display());
            continue;
        };

        if path
            .file_name()
            .expect("this path has a known parent directory")
            .starts_with('.')
        {
            continue;
        }

        if path
            .extension()
            .is_none_or(|e| !e.eq_ignore_ascii_case("toml"))
        {
            continue;
        }

        let spec = match file::Spec::load(&path) {
            Ok(spec) => spec,
            Err(err) if err.kind() == io::ErrorKind::IsADirectory => continue,
            Err(err) => return Err(PolicyReloadError::Io(path, err.to_string())),
        };

        let name = path
            .file_stem()
            .expect("this path points to a readable file, so it must have a file name");

        let policy = if let Some(mut policy) = policies.remove(name) {
            let new = std::sync::Arc::new(spec.parse(name));
            if *policy.latest != *new {
                let old = core::mem::replace(&mut policy.latest, new.clone());
                (on_change)(Change::PolicyChanged(old, new));
            }
            policy
        } else {
            tracing::info!("Loaded new policy '{name}'");
            let policy = Policy::new(spec.parse(name));
            (on_change)(Change::PolicyAdded(policy.latest.clone()));
            policy
        };

        let prev = new_policies.insert(name.into(), policy);
        assert!(prev.is_none(), "there is at most one policy per path");
    }

    for (name, policy) in policies.drain() {
        if !policy.zones.is_empty() {
            tracing::error!(
                "Policy file for '{name}' disappeared but zones still reference it; keeping the in-memory copy"
            );
            new_policies.insert(name, policy);
        } else {
            tracing::info!("Forgetting now-removed policy '{name}'");
            (on_change)(Change::PolicyRemoved(policy.latest));
        }
    }

    *policies = new_policies;
    Ok(())
}

//----------- PolicyVersion ----------------------------------------------------

/// An immutable snapshot of a policy's configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyVersion {
    pub name: Box<str>,

    /// Per-role key configurations. At most one entry per role.
    pub keys: Vec<KeyConfig>,

    pub signature: SignaturePolicy,
    pub denial: DenialPolicy,
    pub timing: TimingPolicy,

    /// Share HSM key material across zones that need the same
    /// (role, algorithm, bits, repository) combination.
    pub share_keys: bool,

    /// How long a fully-hidden key is kept around before being purged.
    pub purge_after: Duration,

    /// If set, the enforcer records intended state but never actually
    /// requires DNSSEC validity (used for staged zone onboarding).
    pub pass_through: bool,
}

//----------- KeyConfig ---------------------------------------------------------

/// Configuration for one key role.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyConfig {
    pub role: KeyRole,
    pub algorithm: KeyParameters,
    pub repository: Box<str>,
    pub lifetime: Duration,
    pub standby_count: u32,
    pub manual_rollover: bool,
    pub rfc5011: bool,
    pub minimize_ds: bool,
    pub minimize_dnskey: bool,
    pub minimize_rrsig_dnskey: bool,
    pub minimize_rrsig: bool,
}

impl KeyConfig {
    /// A role's minimise bit for a record kind it doesn't care about is
    /// always unset (DESIGN.md, Open Question 1).
    pub fn minimize(&self, kind: crate::domain::RecordKind) -> bool {
        use crate::domain::RecordKind::*;
        match kind {
            Ds => self.role.cares_about_ds() && self.minimize_ds,
            Dnskey => self.minimize_dnskey,
            RrsigDnskey => self.minimize_rrsig_dnskey,
            Rrsig => self.role.cares_about_rrsig() && self.minimize_rrsig,
        }
    }
}

//----------- SignaturePolicy ----------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct SignaturePolicy {
    pub resign_interval: Duration,
    pub refresh_interval: Duration,
    pub validity: Duration,
    pub jitter: Duration,
    pub inception_offset: Duration,
    pub max_zone_ttl: Duration,
}

//----------- DenialPolicy --------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum DenialPolicy {
    NSec,
    NSec3 {
        opt_out: bool,
        ttl: Duration,
        resalt_period: Duration,
        hash_algorithm: Nsec3HashAlgorithm,
        iterations: u16,
        salt_length: u8,
    },
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum Nsec3HashAlgorithm {
    #[default]
    Sha1,
}

//----------- TimingPolicy --------------------------------------------------------

/// Zone/parent timing parameters feeding the minimum-transition-time
/// formulas (spec §4.3 Test 3) and the effective-TTL computation.
#[derive(Clone, Debug, PartialEq)]
pub struct TimingPolicy {
    pub propagation_delay: Duration,
    pub soa_ttl: Duration,
    pub soa_minimum: Duration,
    pub registration_delay: Duration,
    pub ds_ttl: Duration,
    pub key_ttl: Duration,
    pub publish_safety: Duration,
    pub retire_safety: Duration,
}

//----------- KeyParameters ---------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum KeyParameters {
    RsaSha256(u32),
    RsaSha512(u32),
    #[default]
    EcdsaP256Sha256,
    EcdsaP384Sha384,
    Ed25519,
    Ed448,
}

impl KeyParameters {
    /// The algorithm number as used in DNSKEY/DS/RRSIG records (RFC 8624).
    pub fn algorithm_number(self) -> u8 {
        match self {
            KeyParameters::RsaSha256(_) => 8,
            KeyParameters::RsaSha512(_) => 10,
            KeyParameters::EcdsaP256Sha256 => 13,
            KeyParameters::EcdsaP384Sha384 => 14,
            KeyParameters::Ed25519 => 15,
            KeyParameters::Ed448 => 16,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            KeyParameters::RsaSha256(bits) | KeyParameters::RsaSha512(bits) => bits,
            KeyParameters::EcdsaP256Sha256 => 256,
            KeyParameters::EcdsaP384Sha384 => 384,
            KeyParameters::Ed25519 => 256,
            KeyParameters::Ed448 => 456,
        }
    }
}

impl Display for KeyParameters {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyParameters::RsaSha256(bits) => write!(fmt, "RSASHA256 {bits} bits"),
            KeyParameters::RsaSha512(bits) => write!(fmt, "RSASHA512 {bits} bits"),
            KeyParameters::EcdsaP256Sha256 => write!(fmt, "ECDSAP256SHA256"),
            KeyParameters::EcdsaP384Sha384 => write!(fmt, "ECDSAP384SHA384"),
            KeyParameters::Ed25519 => write!(fmt, "ED25519"),
            KeyParameters::Ed448 => write!(fmt, "ED448"),
        }
    }
}

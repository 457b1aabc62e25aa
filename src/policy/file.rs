//! The on-disk (TOML) representation of a policy.

use std::time::Duration;
use std::{fs, io};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::domain::KeyRole;

use super::{
    DenialPolicy, KeyConfig, KeyParameters, Nsec3HashAlgorithm, PolicyVersion, SignaturePolicy,
    TimingPolicy,
};

//----------- Spec ---------------------------------------------------------------

/// A policy file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Spec {
    pub keys: Vec<KeySpec>,
    pub signature: SignatureSpec,
    pub denial: DenialSpec,
    pub timing: TimingSpec,
    pub share_keys: bool,
    #[serde(with = "crate::common::datetime::secs")]
    pub purge_after: Duration,
    pub pass_through: bool,
}

impl Spec {
    pub fn parse(self, name: &str) -> PolicyVersion {
        PolicyVersion {
            name: name.into(),
            keys: self.keys.into_iter().map(KeySpec::parse).collect(),
            signature: self.signature.parse(),
            denial: self.denial.parse(),
            timing: self.timing.parse(),
            share_keys: self.share_keys,
            purge_after: self.purge_after,
            pass_through: self.pass_through,
        }
    }
}

impl Spec {
    pub fn load(path: &Utf8Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

//----------- KeySpec --------------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct KeySpec {
    pub role: KeyRoleSpec,
    pub algorithm: KeyParameters,
    pub repository: String,
    #[serde(with = "crate::common::datetime::secs")]
    pub lifetime: Duration,
    pub standby_count: u32,
    pub manual_rollover: bool,
    pub rfc5011: bool,
    pub minimize_ds: bool,
    pub minimize_dnskey: bool,
    pub minimize_rrsig_dnskey: bool,
    pub minimize_rrsig: bool,
}

impl Default for KeySpec {
    fn default() -> Self {
        const FOUR_WEEKS: u64 = 2419200;
        KeySpec {
            role: KeyRoleSpec::Zsk,
            algorithm: KeyParameters::default(),
            repository: "default".into(),
            lifetime: Duration::from_secs(FOUR_WEEKS),
            standby_count: 0,
            manual_rollover: false,
            rfc5011: false,
            minimize_ds: false,
            minimize_dnskey: false,
            minimize_rrsig_dnskey: false,
            minimize_rrsig: false,
        }
    }
}

impl KeySpec {
    pub fn parse(self) -> KeyConfig {
        KeyConfig {
            role: self.role.parse(),
            algorithm: self.algorithm,
            repository: self.repository.into(),
            lifetime: self.lifetime,
            standby_count: self.standby_count,
            manual_rollover: self.manual_rollover,
            rfc5011: self.rfc5011,
            minimize_ds: self.minimize_ds,
            minimize_dnskey: self.minimize_dnskey,
            minimize_rrsig_dnskey: self.minimize_rrsig_dnskey,
            minimize_rrsig: self.minimize_rrsig,
        }
    }
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyRoleSpec {
    Ksk,
    Zsk,
    Csk,
}

impl KeyRoleSpec {
    pub fn parse(self) -> KeyRole {
        match self {
            KeyRoleSpec::Ksk => KeyRole::Ksk,
            KeyRoleSpec::Zsk => KeyRole::Zsk,
            KeyRoleSpec::Csk => KeyRole::Csk,
        }
    }
}

//----------- SignatureSpec --------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SignatureSpec {
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
    #[serde(with = "crate::common::datetime::secs")]
    pub max_zone_ttl: Duration,
}

impl Default for SignatureSpec {
    fn default() -> Self {
        const ONE_DAY: u64 = 86400;
        const FOUR_WEEKS: u64 = 2419200;
        SignatureSpec {
            resign_interval: Duration::from_secs(ONE_DAY),
            refresh_interval: Duration::from_secs(ONE_DAY * 3),
            validity: Duration::from_secs(FOUR_WEEKS),
            jitter: Duration::from_secs(ONE_DAY),
            inception_offset: Duration::from_secs(3600),
            max_zone_ttl: Duration::from_secs(ONE_DAY),
        }
    }
}

impl SignatureSpec {
    pub fn parse(self) -> SignaturePolicy {
        SignaturePolicy {
            resign_interval: self.resign_interval,
            refresh_interval: self.refresh_interval,
            validity: self.validity,
            jitter: self.jitter,
            inception_offset: self.inception_offset,
            max_zone_ttl: self.max_zone_ttl,
        }
    }
}

//----------- DenialSpec -----------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum DenialSpec {
    NSec,
    NSec3 {
        opt_out: bool,
        #[serde(with = "crate::common::datetime::secs")]
        ttl: Duration,
        #[serde(with = "crate::common::datetime::secs")]
        resalt_period: Duration,
        hash_algorithm: Nsec3HashAlgorithm,
        iterations: u16,
        salt_length: u8,
    },
}

impl Default for DenialSpec {
    fn default() -> Self {
        DenialSpec::NSec3 {
            opt_out: false,
            ttl: Duration::from_secs(3600),
            resalt_period: Duration::from_secs(180 * 86400),
            hash_algorithm: Nsec3HashAlgorithm::Sha1,
            iterations: 0,
            salt_length: 8,
        }
    }
}

impl DenialSpec {
    pub fn parse(self) -> DenialPolicy {
        match self {
            DenialSpec::NSec => DenialPolicy::NSec,
            DenialSpec::NSec3 {
                opt_out,
                ttl,
                resalt_period,
                hash_algorithm,
                iterations,
                salt_length,
            } => DenialPolicy::NSec3 {
                opt_out,
                ttl,
                resalt_period,
                hash_algorithm,
                iterations,
                salt_length,
            },
        }
    }
}

//----------- TimingSpec -----------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TimingSpec {
    #[serde(with = "crate::common::datetime::secs")]
    pub propagation_delay: Duration,
    #[serde(with = "crate::common::datetime::secs")]
    pub soa_ttl: Duration,
    #[serde(with = "crate::common::datetime::secs")]
    pub soa_minimum: Duration,
    #[serde(with = "crate::common::datetime::secs")]
    pub registration_delay: Duration,
    #[serde(with = "crate::common::datetime::secs")]
    pub ds_ttl: Duration,
    #[serde(with = "crate::common::datetime::secs")]
    pub key_ttl: Duration,
    #[serde(with = "crate::common::datetime::secs")]
    pub publish_safety: Duration,
    #[serde(with = "crate::common::datetime::secs")]
    pub retire_safety: Duration,
}

impl Default for TimingSpec {
    fn default() -> Self {
        TimingSpec {
            propagation_delay: Duration::from_secs(3600),
            soa_ttl: Duration::from_secs(3600),
            soa_minimum: Duration::from_secs(3600),
            registration_delay: Duration::from_secs(86400),
            ds_ttl: Duration::from_secs(3600),
            key_ttl: Duration::from_secs(3600),
            publish_safety: Duration::from_secs(3600),
            retire_safety: Duration::from_secs(3600),
        }
    }
}

impl TimingSpec {
    pub fn parse(self) -> TimingPolicy {
        TimingPolicy {
            propagation_delay: self.propagation_delay,
            soa_ttl: self.soa_ttl,
            soa_minimum: self.soa_minimum,
            registration_delay: self.registration_delay,
            ds_ttl: self.ds_ttl,
            key_ttl: self.key_ttl,
            publish_safety: self.publish_safety,
            retire_safety: self.retire_safety,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_parses() {
        let spec = Spec::default();
        let text = toml::to_string_pretty(&spec).unwrap();
        let back: Spec = toml::from_str(&text).unwrap();
        let _version = back.parse("default");
    }

    #[test]
    fn zero_key_policy_round_trips() {
        let text = r#"
            [signature]
            [denial]
            type = "nsec"
            [timing]
        "#;
        let spec: Spec = toml::from_str(text).unwrap();
        let version = spec.parse("unsigned");
        assert!(version.keys.is_empty());
    }
}

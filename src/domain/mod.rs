//! The core domain model: zones, keys, key states and key material handles.
//!
//! Everything here is plain data.  Records are identified by stable integer
//! ids rather than in-memory pointers, so that a zone's keys, a key's states,
//! and the dependencies between keys can form cycles without requiring
//! `Rc`/`Weak` bookkeeping; the [`crate::db`] module is the arena that owns
//! these records and hands out ids.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod time;

pub use time::UnixTime;

//----------- Ids ---------------------------------------------------------------

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(ZoneId);
id_type!(KeyId);
id_type!(HsmKeyId);
id_type!(KeyDependencyId);

//----------- KeyRole -------------------------------------------------------------

/// The role a key plays within a zone's signing chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyRole {
    /// Key-signing key: signs the zone's DNSKEY RRset, and is the one whose
    /// hash is published as a DS record at the parent.
    Ksk,
    /// Zone-signing key: signs all other RRsets in the zone.
    Zsk,
    /// Combined signing key: plays both roles at once.
    Csk,
}

impl KeyRole {
    /// Whether this role's DS record is meaningful (KSK and CSK carry a DS
    /// at the parent; a pure ZSK does not).
    pub fn cares_about_ds(self) -> bool {
        matches!(self, KeyRole::Ksk | KeyRole::Csk)
    }

    /// Whether this role signs ordinary RRsets (ZSK and CSK do; a pure KSK
    /// only ever signs the DNSKEY RRset).
    pub fn cares_about_rrsig(self) -> bool {
        matches!(self, KeyRole::Zsk | KeyRole::Csk)
    }
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyRole::Ksk => "KSK",
            KeyRole::Zsk => "ZSK",
            KeyRole::Csk => "CSK",
        })
    }
}

//----------- RecordKind ----------------------------------------------------------

/// The four record kinds whose presence the enforcer tracks per key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Ds,
    Dnskey,
    RrsigDnskey,
    Rrsig,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [
        RecordKind::Ds,
        RecordKind::Dnskey,
        RecordKind::RrsigDnskey,
        RecordKind::Rrsig,
    ];
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordKind::Ds => "DS",
            RecordKind::Dnskey => "DNSKEY",
            RecordKind::RrsigDnskey => "RRSIG(DNSKEY)",
            RecordKind::Rrsig => "RRSIG",
        })
    }
}

//----------- KeyStateValue -------------------------------------------------------

/// One position in the five-state lattice a record can occupy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyStateValue {
    Hidden,
    Rumoured,
    Omnipresent,
    Unretentive,
    /// This record kind is irrelevant for the key's role (e.g. DS on a
    /// pure ZSK); it never transitions.
    NoCare,
}

impl KeyStateValue {
    pub fn is_settled(self, other: KeyStateValue) -> bool {
        self == other
    }
}

impl fmt::Display for KeyStateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyStateValue::Hidden => "hidden",
            KeyStateValue::Rumoured => "rumoured",
            KeyStateValue::Omnipresent => "omnipresent",
            KeyStateValue::Unretentive => "unretentive",
            KeyStateValue::NoCare => "nocare",
        })
    }
}

//----------- KeyState -------------------------------------------------------------

/// The state of one (key, record kind) pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyState {
    pub kind: RecordKind,
    pub value: KeyStateValue,
    /// When `value` was last changed.
    pub last_change: UnixTime,
    /// The effective TTL recorded for this record the last time it changed,
    /// used by the minimum-transition-time formulas.
    pub ttl: Duration,
    /// Whether this record kind is in "minimise" mode for this key (see
    /// policy `KeyConfig::minimize_*`).
    pub minimise: bool,
}

impl KeyState {
    pub fn new_nocare(kind: RecordKind, now: UnixTime) -> Self {
        KeyState {
            kind,
            value: KeyStateValue::NoCare,
            last_change: now,
            ttl: Duration::ZERO,
            minimise: false,
        }
    }

    pub fn new_hidden(kind: RecordKind, now: UnixTime, minimise: bool) -> Self {
        KeyState {
            kind,
            value: KeyStateValue::Hidden,
            last_change: now,
            ttl: Duration::ZERO,
            minimise,
        }
    }
}

//----------- DsAtParent -----------------------------------------------------------

/// Where a key's DS record stands with respect to the parent zone.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DsAtParent {
    /// No DS exists at the parent and none should yet.
    Unsubmitted,
    /// The enforcer wants the operator to submit a DS to the parent.
    Submit,
    /// The operator has reported submitting it.
    Submitted,
    /// The operator has confirmed the parent publishes it.
    Seen,
    /// The enforcer wants the operator to remove the DS from the parent.
    Retract,
    /// The operator has reported removing it.
    Retracted,
}

//----------- Key -------------------------------------------------------------------

/// An intended presence of cryptographic material in a zone.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Key {
    pub id: KeyId,
    pub zone: ZoneId,
    pub hsm_key: HsmKeyId,
    pub role: KeyRole,
    pub algorithm: u8,
    pub inception: UnixTime,
    /// Goal direction: `true` while the key is being introduced, `false`
    /// once it has been told to retire.
    pub introducing: bool,
    pub standby: bool,
    pub ds_at_parent: DsAtParent,
    pub keytag: u16,
    /// States for DS, DNSKEY, RRSIG(DNSKEY) and RRSIG, always in that
    /// order so index lookups (`states[kind as usize]`-style) stay simple.
    pub states: Vec<KeyState>,
    /// Forced rollover requested by the operator; consumed by the next
    /// reconcile.
    pub manual_roll: bool,
}

impl Key {
    pub fn state(&self, kind: RecordKind) -> &KeyState {
        self.states
            .iter()
            .find(|s| s.kind == kind)
            .expect("a Key always carries all four KeyStates")
    }

    pub fn state_mut(&mut self, kind: RecordKind) -> &mut KeyState {
        self.states
            .iter_mut()
            .find(|s| s.kind == kind)
            .expect("a Key always carries all four KeyStates")
    }

    /// Derived: DNSKEY is being published.
    pub fn is_publish(&self) -> bool {
        matches!(
            self.state(RecordKind::Dnskey).value,
            KeyStateValue::Omnipresent | KeyStateValue::Rumoured
        )
    }

    /// Derived: RRSIG is actively being produced with this key.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state(RecordKind::Rrsig).value,
            KeyStateValue::Omnipresent | KeyStateValue::Rumoured
        )
    }

    /// All four states are HIDDEN or NOCARE: the key is fully retired.
    pub fn is_fully_hidden(&self) -> bool {
        self.states
            .iter()
            .all(|s| matches!(s.value, KeyStateValue::Hidden | KeyStateValue::NoCare))
    }

    /// The most recent `last_change` among the key's states, used to decide
    /// whether `purge_after` has elapsed since it went fully hidden.
    pub fn last_change(&self) -> UnixTime {
        self.states
            .iter()
            .map(|s| s.last_change)
            .max()
            .unwrap_or(self.inception)
    }
}

//----------- KeyDependency ---------------------------------------------------------

/// Informational edge: retirement of `from` was initiated expecting `to` to
/// reach OMNIPRESENT on `kind` first. Not consulted by the state engine (see
/// DESIGN.md, Open Question 2); kept for operator visibility only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyDependency {
    pub id: KeyDependencyId,
    pub zone: ZoneId,
    pub from: KeyId,
    pub to: KeyId,
    pub kind: RecordKind,
}

//----------- HsmKey ----------------------------------------------------------------

/// A handle to opaque key material obtained from a [`crate::keys::factory`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HsmKey {
    pub id: HsmKeyId,
    pub locator: Box<str>,
    pub bits: u32,
    pub algorithm: u8,
    pub repository: Box<str>,
    pub policy: Box<str>,
    pub role: KeyRole,
    /// Unset while the key sits unused in the pre-generated pool.
    pub inception: Option<UnixTime>,
    pub candidate_for_sharing: bool,
    pub revoke: bool,
    pub backed_up: bool,
    pub used_by_zones: Vec<ZoneId>,
}

//----------- Zone ------------------------------------------------------------------

/// A DNS zone under enforcement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: Box<str>,
    pub policy: Box<str>,
    /// The next time the scheduler should enforce this zone, or `None` if
    /// nothing is pending (equivalent to spec's `-1`).
    pub next_change: Option<UnixTime>,
    pub signconf_dirty: bool,
    /// Effective-TTL end dates for DS/DNSKEY/RRSIG, used by `getZoneTTL`.
    pub ds_ttl_end: Option<UnixTime>,
    pub dnskey_ttl_end: Option<UnixTime>,
    pub rrsig_ttl_end: Option<UnixTime>,
    pub roll_ksk_now: bool,
    pub roll_zsk_now: bool,
    pub roll_csk_now: bool,
}

impl Zone {
    pub fn new(id: ZoneId, name: impl Into<Box<str>>, policy: impl Into<Box<str>>) -> Self {
        Zone {
            id,
            name: name.into(),
            policy: policy.into(),
            next_change: None,
            signconf_dirty: false,
            ds_ttl_end: None,
            dnskey_ttl_end: None,
            rrsig_ttl_end: None,
            roll_ksk_now: false,
            roll_zsk_now: false,
            roll_csk_now: false,
        }
    }

    pub fn roll_now_for(&self, role: KeyRole) -> bool {
        match role {
            KeyRole::Ksk => self.roll_ksk_now,
            KeyRole::Zsk => self.roll_zsk_now,
            KeyRole::Csk => self.roll_csk_now,
        }
    }

    pub fn clear_roll_now_for(&mut self, role: KeyRole) {
        match role {
            KeyRole::Ksk => self.roll_ksk_now = false,
            KeyRole::Zsk => self.roll_zsk_now = false,
            KeyRole::Csk => self.roll_csk_now = false,
        }
    }
}

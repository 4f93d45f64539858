//! # Substrates — Typed 32-Byte Capability Grants
//!
//! A substrate is an opaque 32-byte value naming something a fuse is
//! allowed to touch inside a market: a token, a pool, a gauge, a validator,
//! a sub-account tag. The engine never interprets substrates beyond their
//! kind tag — meaning lives with the fuse that declared them.
//!
//! ## Encoding
//!
//! Byte 0 is the kind tag, bytes 1..32 are the kind-specific payload. One
//! set can therefore hold heterogeneous kinds without separate tables, and
//! `decode(encode(x)) == x` holds losslessly for every kind and payload,
//! including the zero and all-ones payload edge cases. Tag `0x00` is
//! reserved as invalid so that an accidental all-zero value never decodes.
//!
//! ## Grant Discipline
//!
//! Substrates are grant-only: a fuse must ask "is substrate S granted for
//! market M" before acting, and ungranted substrates fail the action. The
//! registry here is the source of truth for that question; the check
//! itself is wired through
//! [`ExecutionContext::require_granted`](crate::execute::ExecutionContext::require_granted).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::info;

use crate::config::{SUBSTRATE_LENGTH, SUBSTRATE_PAYLOAD_LENGTH};
use crate::types::{Address, MarketId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur when decoding or checking substrates.
#[derive(Debug, Error)]
pub enum SubstrateError {
    /// The kind tag byte does not name a known substrate kind.
    #[error("unknown substrate kind tag 0x{0:02x}")]
    UnknownTag(u8),

    /// The substrate has not been granted for the market.
    #[error("substrate {substrate} is not granted for {market}")]
    NotGranted {
        /// The market the action declared.
        market: MarketId,
        /// The offending substrate.
        substrate: Substrate,
    },

    /// A single grant call exceeded the configured substrate cap.
    #[error("grant of {len} substrates exceeds maximum {max}")]
    GrantTooLarge {
        /// Number of substrates in the grant.
        len: usize,
        /// The configured cap.
        max: usize,
    },
}

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// The recognized substrate kinds.
///
/// Adding a kind is backward compatible; removing or renumbering one is
/// not — granted sets persist raw encoded values.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum SubstrateKind {
    /// An asset (token) the market may hold.
    Asset = 1,
    /// A pool or position venue within the protocol.
    Pool = 2,
    /// A reward gauge attached to a pool.
    Gauge = 3,
    /// A staking validator identity.
    Validator = 4,
    /// An opaque sub-account tag within the external protocol.
    SubAccount = 5,
}

impl SubstrateKind {
    /// The wire tag for this kind.
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Resolves a wire tag back to a kind.
    pub fn from_tag(tag: u8) -> Result<Self, SubstrateError> {
        match tag {
            1 => Ok(SubstrateKind::Asset),
            2 => Ok(SubstrateKind::Pool),
            3 => Ok(SubstrateKind::Gauge),
            4 => Ok(SubstrateKind::Validator),
            5 => Ok(SubstrateKind::SubAccount),
            other => Err(SubstrateError::UnknownTag(other)),
        }
    }

    /// All kinds, in tag order. Handy for exhaustive round-trip tests.
    pub const ALL: [SubstrateKind; 5] = [
        SubstrateKind::Asset,
        SubstrateKind::Pool,
        SubstrateKind::Gauge,
        SubstrateKind::Validator,
        SubstrateKind::SubAccount,
    ];
}

impl fmt::Display for SubstrateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubstrateKind::Asset => write!(f, "Asset"),
            SubstrateKind::Pool => write!(f, "Pool"),
            SubstrateKind::Gauge => write!(f, "Gauge"),
            SubstrateKind::Validator => write!(f, "Validator"),
            SubstrateKind::SubAccount => write!(f, "SubAccount"),
        }
    }
}

// ---------------------------------------------------------------------------
// Substrate
// ---------------------------------------------------------------------------

/// The raw 32-byte encoded form stored in grant sets and ledger keys.
///
/// Serialized as a `0x`-prefixed hex string so it can key JSON maps.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Substrate([u8; SUBSTRATE_LENGTH]);

impl Substrate {
    /// Wraps raw bytes without validation. Decoding validates the tag.
    pub const fn from_raw(bytes: [u8; SUBSTRATE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Returns the raw byte representation.
    pub const fn as_bytes(&self) -> &[u8; SUBSTRATE_LENGTH] {
        &self.0
    }

    /// Decodes the tagged form back into kind + payload.
    ///
    /// # Errors
    ///
    /// Returns [`SubstrateError::UnknownTag`] for an unrecognized tag byte
    /// (including `0x00`).
    pub fn decode(&self) -> Result<TypedSubstrate, SubstrateError> {
        let kind = SubstrateKind::from_tag(self.0[0])?;
        let mut payload = [0u8; SUBSTRATE_PAYLOAD_LENGTH];
        payload.copy_from_slice(&self.0[1..]);
        Ok(TypedSubstrate { kind, payload })
    }

    /// Convenience constructor: an [`SubstrateKind::Asset`] substrate for a
    /// 20-byte address, left-aligned in the payload.
    pub fn asset(address: Address) -> Self {
        TypedSubstrate::from_address(SubstrateKind::Asset, address).encode()
    }

    /// Convenience constructor: a [`SubstrateKind::Pool`] substrate for a
    /// 20-byte address, left-aligned in the payload.
    pub fn pool(address: Address) -> Self {
        TypedSubstrate::from_address(SubstrateKind::Pool, address).encode()
    }
}

impl fmt::Display for Substrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Substrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok(typed) => write!(f, "Substrate({}, {self})", typed.kind),
            Err(_) => write!(f, "Substrate(invalid, {self})"),
        }
    }
}

impl Serialize for Substrate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Substrate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let stripped = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(stripped).map_err(D::Error::custom)?;
        if bytes.len() != SUBSTRATE_LENGTH {
            return Err(D::Error::custom(format!(
                "invalid substrate length: expected {SUBSTRATE_LENGTH} bytes, got {}",
                bytes.len()
            )));
        }
        let mut raw = [0u8; SUBSTRATE_LENGTH];
        raw.copy_from_slice(&bytes);
        Ok(Substrate(raw))
    }
}

/// The decoded form: kind tag plus raw payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypedSubstrate {
    /// What kind of thing the payload names.
    pub kind: SubstrateKind,
    /// Kind-specific payload bytes.
    pub payload: [u8; SUBSTRATE_PAYLOAD_LENGTH],
}

impl TypedSubstrate {
    /// Packs kind + payload into the 32-byte wire form.
    pub fn encode(&self) -> Substrate {
        let mut raw = [0u8; SUBSTRATE_LENGTH];
        raw[0] = self.kind.tag();
        raw[1..].copy_from_slice(&self.payload);
        Substrate(raw)
    }

    /// Builds a typed substrate whose payload is a 20-byte address,
    /// left-aligned and zero-padded.
    pub fn from_address(kind: SubstrateKind, address: Address) -> Self {
        let mut payload = [0u8; SUBSTRATE_PAYLOAD_LENGTH];
        payload[..address.as_bytes().len()].copy_from_slice(address.as_bytes());
        Self { kind, payload }
    }
}

// ---------------------------------------------------------------------------
// SubstrateRegistry
// ---------------------------------------------------------------------------

/// Per-market allow-sets of granted substrates.
///
/// Membership is the only structure: insertion order is irrelevant and a
/// substrate is either granted or it is not. The registry stores raw
/// encoded values, so a set freely mixes kinds.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubstrateRegistry {
    grants: BTreeMap<MarketId, BTreeSet<Substrate>>,
}

impl SubstrateRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds substrates to a market's allow-set. Already-granted values are
    /// ignored. Returns the number of newly granted substrates.
    pub fn grant(&mut self, market: MarketId, substrates: &[Substrate]) -> usize {
        let set = self.grants.entry(market).or_default();
        let mut added = 0;
        for substrate in substrates {
            if set.insert(*substrate) {
                added += 1;
            }
        }
        if added > 0 {
            info!(%market, added, "substrates granted");
        }
        added
    }

    /// Removes substrates from a market's allow-set. Absent values are
    /// ignored. Returns the number of substrates actually removed.
    pub fn revoke(&mut self, market: MarketId, substrates: &[Substrate]) -> usize {
        let Some(set) = self.grants.get_mut(&market) else {
            return 0;
        };
        let mut removed = 0;
        for substrate in substrates {
            if set.remove(substrate) {
                removed += 1;
            }
        }
        if set.is_empty() {
            self.grants.remove(&market);
        }
        if removed > 0 {
            info!(%market, removed, "substrates revoked");
        }
        removed
    }

    /// The pervasive read: is `substrate` granted for `market`?
    pub fn is_granted(&self, market: MarketId, substrate: &Substrate) -> bool {
        self.grants
            .get(&market)
            .map(|set| set.contains(substrate))
            .unwrap_or(false)
    }

    /// All substrates granted for a market, in encoded byte order.
    pub fn granted(&self, market: MarketId) -> Vec<Substrate> {
        self.grants
            .get(&market)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! # Identifiers
//!
//! String newtypes for every name the registry deals in. All of them are
//! `Ord` so they can key `BTreeMap`/`BTreeSet` collections deterministically.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier from a string.
            #[must_use]
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Get the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Check whether the identifier is empty.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of an entity class (e.g. `GOLD_VAULT`).
    ClassId
);

string_id!(
    /// A lifecycle state declared by a class (e.g. `ORIGINATED`).
    Phase
);

string_id!(
    /// Relationship type of an entanglement (e.g. `COLLATERAL_FOR`).
    RelType
);

string_id!(
    /// Opaque reference tying a worldline to its real-world anchor.
    AnchorRef
);

string_id!(
    /// Deduplication key of an ingested event.
    EventId
);

string_id!(
    /// Identifier of an event source (ledger, contract, publisher).
    SourceId
);

string_id!(
    /// Globally unique worldline identifier.
    ///
    /// Derived once from class, anchor and origin and never recomputed.
    WorldlineId
);

impl WorldlineId {
    /// Prefix carried by every derived worldline id.
    pub const PREFIX: &'static str = "wl-";

    /// Derive the worldline id for a class, anchor and origin coordinate.
    ///
    /// Fields are length-prefixed before hashing so that
    /// (`"AB"`, `"C"`) and (`"A"`, `"BC"`) never collide.
    #[must_use]
    pub fn derive(class: &ClassId, anchor: &AnchorRef, origin: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in [class.as_str(), anchor.as_str(), origin] {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        let hex = hasher.finalize().to_hex();
        Self(format!("{}{}", Self::PREFIX, &hex.as_str()[..32]))
    }
}

// =============================================================================
// DIGEST
// =============================================================================

/// A BLAKE3 content digest.
///
/// Serialized as a hex string for human-readable formats (JSON, TOML) and
/// as raw bytes for postcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// Compute the digest of a byte slice.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Lowercase hex rendering (64 characters).
    #[must_use]
    pub fn to_hex(&self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }

    /// Parse a 64-character hex digest.
    pub fn from_hex(s: &str) -> Option<Self> {
        blake3::Hash::from_hex(s).ok().map(|h| Self(*h.as_bytes()))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let hex = String::deserialize(deserializer)?;
            Self::from_hex(&hex).ok_or_else(|| D::Error::custom("invalid digest hex"))
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Self)
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

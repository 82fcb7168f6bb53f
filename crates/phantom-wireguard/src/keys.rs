//! Curve25519 keys as `wg` prints them.
//!
//! Every key is 32 bytes on the wire and 44 characters of standard base64
//! in config files and JSON.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as DalekPublic, StaticSecret};

use crate::error::{Result, WireGuardError};

/// Length of every key in bytes.
pub const KEY_SIZE: usize = 32;

fn exact(bytes: &[u8]) -> Result<[u8; KEY_SIZE]> {
    <[u8; KEY_SIZE]>::try_from(bytes).map_err(|_| WireGuardError::InvalidKeyLength(bytes.len()))
}

fn os_entropy() -> [u8; KEY_SIZE] {
    let mut bytes = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Byte access, base64 text form and serde for a 32-byte key newtype.
macro_rules! key_type {
    ($ty:ident) => {
        impl $ty {
            /// Wraps a slice that must hold exactly [`KEY_SIZE`] bytes.
            ///
            /// # Errors
            ///
            /// [`WireGuardError::InvalidKeyLength`] for any other length.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                exact(bytes).map(Self)
            }

            /// Raw key material.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.0
            }

            /// The 44-character form used in wg-quick files.
            #[must_use]
            pub fn to_base64(&self) -> String {
                STANDARD.encode(self.0)
            }

            /// Parses the wg-quick form. Surrounding whitespace is ignored.
            ///
            /// # Errors
            ///
            /// Fails on invalid base64 or a decoded length other than 32.
            pub fn from_base64(text: &str) -> Result<Self> {
                let decoded = STANDARD.decode(text.trim())?;
                Self::from_bytes(&decoded)
            }
        }

        impl FromStr for $ty {
            type Err = WireGuardError;

            fn from_str(text: &str) -> Result<Self> {
                Self::from_base64(text)
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, out: S) -> std::result::Result<S::Ok, S::Error> {
                out.serialize_str(&self.to_base64())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(input: D) -> std::result::Result<Self, D::Error> {
                let text = String::deserialize(input)?;
                Self::from_base64(&text).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Public half of a peer's identity. Safe to print.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

key_type!(PublicKey);

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.to_base64();
        write!(f, "PublicKey({}..)", text.get(..8).unwrap_or(&text))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// Secret half. `Debug` never shows the material and equality is
/// constant-time.
#[derive(Clone)]
pub struct PrivateKey([u8; KEY_SIZE]);

key_type!(PrivateKey);

impl PrivateKey {
    /// Fresh key from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_entropy(os_entropy())
    }

    /// Clamps raw entropy into a valid scalar, as `wg genkey` does.
    #[must_use]
    pub fn from_entropy(mut bytes: [u8; KEY_SIZE]) -> Self {
        bytes[0] &= 0b1111_1000;
        bytes[31] &= 0b0111_1111;
        bytes[31] |= 0b0100_0000;
        Self(bytes)
    }

    /// Same result as `wg pubkey`.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(DalekPublic::from(&secret).to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for PrivateKey {}

/// Optional symmetric key mixed into a peer's handshake. Unclamped.
#[derive(Clone)]
pub struct PresharedKey([u8; KEY_SIZE]);

key_type!(PresharedKey);

impl PresharedKey {
    /// Fresh key from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self(os_entropy())
    }

    /// Uses the bytes as-is.
    #[must_use]
    pub const fn from_entropy(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PresharedKey(<redacted>)")
    }
}

impl PartialEq for PresharedKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl Eq for PresharedKey {}

/// `wg genkey | tee /dev/stderr | wg pubkey` in one call.
#[must_use]
pub fn generate_keypair() -> (PrivateKey, PublicKey) {
    let private = PrivateKey::generate();
    let public = private.public_key();
    (private, public)
}

//! Entropy sources.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_core::{OsRng, RngCore};

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Source of random bytes for keys and secrets.
pub trait RandomSource: Send + Sync {
    /// Fills `dest` with random bytes.
    fn fill_bytes(&self, dest: &mut [u8]);
}

/// The operating system CSPRNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill_bytes(&self, dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }
}

/// Deterministic generator for reproducible tests.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    /// Creates a generator from a seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn fill_bytes(&self, dest: &mut [u8]) {
        self.rng.lock().fill_bytes(dest);
    }
}

/// Returns `N` random bytes.
pub fn random_bytes<const N: usize>(source: &dyn RandomSource) -> [u8; N] {
    let mut buf = [0u8; N];
    source.fill_bytes(&mut buf);
    buf
}

/// Returns a `[A-Za-z0-9]` string of length `len` without modulo bias.
pub fn alphanumeric(source: &dyn RandomSource, len: usize) -> String {
    // 248 is the largest multiple of 62 that fits in a byte.
    const LIMIT: u8 = 248;
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 64];
    while out.len() < len {
        source.fill_bytes(&mut buf);
        for &b in buf.iter().filter(|b| **b < LIMIT) {
            if out.len() == len {
                break;
            }
            out.push(char::from(ALPHANUMERIC[usize::from(b) % ALPHANUMERIC.len()]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alphanumeric_has_requested_shape() {
        let secret = alphanumeric(&OsRandom, 64);
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn seeded_source_is_reproducible() {
        let a = SeededRandom::new(7);
        let b = SeededRandom::new(7);
        assert_eq!(random_bytes::<32>(&a), random_bytes::<32>(&b));
        assert_eq!(alphanumeric(&a, 16), alphanumeric(&b, 16));
    }

    #[test]
    fn os_random_differs() {
        assert_ne!(random_bytes::<32>(&OsRandom), random_bytes::<32>(&OsRandom));
    }
}

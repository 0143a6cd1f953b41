//! Paillier: additively homomorphic encryption
//!
//! Plaintexts live in `Z_n`; signed fixed-point values are mapped into the
//! ring with `to_residue` / `from_residue` (negative values wrap to `n - |x|`).
//! Every operation returns a fresh integer, operands are never mutated.

use super::bigint_hex;
use crate::error::{DcpError, Result};
use crypto_bigint::{Encoding, U1024};
use crypto_primes::generate_prime_with_rng;
use num_bigint::{BigInt, BigUint, RandBigInt, Sign};
use num_integer::Integer;
use num_traits::{One, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};

/// Default bit length of each of the two primes
pub const DEFAULT_PRIME_BITS: usize = 512;

/// Largest supported prime length
pub const MAX_PRIME_BITS: usize = 1024;

/// Public half of a Paillier key (g = n + 1)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    #[serde(with = "bigint_hex")]
    pub n: BigUint,
    #[serde(with = "bigint_hex")]
    pub nn: BigUint,
}

/// Secret half of a Paillier key
#[derive(Debug, Clone)]
pub struct SecretKey {
    lambda: BigUint,
    mu: BigUint,
    pub public: PublicKey,
}

/// An encrypted value modulo n²
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext(#[serde(with = "bigint_hex")] pub BigUint);

/// Generate a keypair whose primes each have `prime_bits` bits
pub fn generate_keypair(prime_bits: usize) -> Result<SecretKey> {
    if !(64..=MAX_PRIME_BITS).contains(&prime_bits) {
        return Err(DcpError::Param(format!(
            "paillier prime length {} outside 64..={}",
            prime_bits, MAX_PRIME_BITS
        )));
    }
    loop {
        let p = generate_prime(prime_bits);
        let q = generate_prime(prime_bits);
        if p == q {
            continue;
        }
        let n = &p * &q;
        let p1 = &p - 1u32;
        let q1 = &q - 1u32;
        let phi = &p1 * &q1;
        if !n.gcd(&phi).is_one() {
            continue;
        }
        let lambda = p1.lcm(&q1);
        let mu = match lambda.modinv(&n) {
            Some(mu) => mu,
            None => continue,
        };
        let nn = &n * &n;
        return Ok(SecretKey {
            lambda,
            mu,
            public: PublicKey { n, nn },
        });
    }
}

impl PublicKey {
    /// Bit length of the modulus n
    pub fn bits(&self) -> u64 {
        self.n.bits()
    }

    /// Encrypt a plaintext already reduced into `Z_n`
    pub fn encrypt(&self, m: &BigUint) -> Ciphertext {
        let mut rng = rand::thread_rng();
        let r = loop {
            let r = rng.gen_biguint_range(&BigUint::one(), &self.n);
            if r.gcd(&self.n).is_one() {
                break r;
            }
        };
        let gm = (BigUint::one() + (m % &self.n) * &self.n) % &self.nn;
        let rn = r.modpow(&self.n, &self.nn);
        Ciphertext((gm * rn) % &self.nn)
    }

    /// Encrypt a signed integer
    pub fn encrypt_signed(&self, m: &BigInt) -> Ciphertext {
        self.encrypt(&self.to_residue(m))
    }

    /// Homomorphic addition of two ciphertexts
    pub fn add(&self, a: &Ciphertext, b: &Ciphertext) -> Ciphertext {
        Ciphertext((&a.0 * &b.0) % &self.nn)
    }

    /// Homomorphic addition of a signed plaintext
    pub fn add_plain(&self, c: &Ciphertext, m: &BigInt) -> Ciphertext {
        let gm = (BigUint::one() + self.to_residue(m) * &self.n) % &self.nn;
        Ciphertext((&c.0 * gm) % &self.nn)
    }

    /// Homomorphic multiplication by a signed scalar
    pub fn scalar_mul(&self, c: &Ciphertext, k: &BigInt) -> Result<Ciphertext> {
        let (sign, magnitude) = (k.sign(), k.magnitude());
        if sign == Sign::Minus {
            let inv = c
                .0
                .modinv(&self.nn)
                .ok_or_else(|| DcpError::Encoding("ciphertext not invertible".into()))?;
            Ok(Ciphertext(inv.modpow(magnitude, &self.nn)))
        } else {
            Ok(Ciphertext(c.0.modpow(magnitude, &self.nn)))
        }
    }

    /// Ciphertext of the negated plaintext
    pub fn negate(&self, c: &Ciphertext) -> Result<Ciphertext> {
        c.0.modinv(&self.nn)
            .map(Ciphertext)
            .ok_or_else(|| DcpError::Encoding("ciphertext not invertible".into()))
    }

    /// Sum a list of ciphertexts; the empty sum is an encryption of zero
    pub fn sum<'a, I>(&self, items: I) -> Ciphertext
    where
        I: IntoIterator<Item = &'a Ciphertext>,
    {
        items
            .into_iter()
            .fold(Ciphertext(BigUint::one()), |acc, c| self.add(&acc, c))
    }

    /// Map a signed integer into `Z_n`
    pub fn to_residue(&self, m: &BigInt) -> BigUint {
        let n = BigInt::from_biguint(Sign::Plus, self.n.clone());
        let r = m.mod_floor(&n);
        r.to_biguint().unwrap_or_default()
    }

    /// Interpret a residue in the upper half of `Z_n` as negative
    pub fn from_residue(&self, m: &BigUint) -> BigInt {
        let half = &self.n >> 1;
        let m = m % &self.n;
        if m > half {
            BigInt::from_biguint(Sign::Plus, m) - BigInt::from_biguint(Sign::Plus, self.n.clone())
        } else {
            BigInt::from_biguint(Sign::Plus, m)
        }
    }

    /// Draw a random mask in `[1, n/2)`
    pub fn random_mask(&self) -> BigInt {
        let mut rng = rand::thread_rng();
        let half = &self.n >> 1;
        BigInt::from_biguint(Sign::Plus, rng.gen_biguint_range(&BigUint::one(), &half))
    }

    /// Validate that a ciphertext belongs to `Z_{n²}`
    pub fn check(&self, c: &Ciphertext) -> Result<()> {
        if c.0.is_zero() || c.0 >= self.nn {
            return Err(DcpError::Encoding("ciphertext out of range".into()));
        }
        Ok(())
    }
}

impl SecretKey {
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Decrypt into `Z_n`
    pub fn decrypt(&self, c: &Ciphertext) -> Result<BigUint> {
        self.public.check(c)?;
        let n = &self.public.n;
        let x = c.0.modpow(&self.lambda, &self.public.nn);
        let l = (x - 1u32) / n;
        Ok((l * &self.mu) % n)
    }

    /// Decrypt and interpret as a signed integer
    pub fn decrypt_signed(&self, c: &Ciphertext) -> Result<BigInt> {
        let m = self.decrypt(c)?;
        Ok(self.public.from_residue(&m))
    }
}

/// Fixed-point codec with `10^accuracy` scale
#[derive(Debug, Clone)]
pub struct FixedPoint {
    accuracy: u32,
    scale: f64,
}

impl FixedPoint {
    pub fn new(accuracy: u32) -> Self {
        Self {
            accuracy,
            scale: 10f64.powi(accuracy as i32),
        }
    }

    pub fn accuracy(&self) -> u32 {
        self.accuracy
    }

    /// Encode `v · 10^(accuracy·power)`, rounding to the nearest integer
    pub fn encode(&self, v: f64, power: u32) -> Result<BigInt> {
        if !v.is_finite() {
            return Err(DcpError::Encoding(format!("non-finite value {}", v)));
        }
        let mut scaled = v;
        for _ in 0..power {
            scaled *= self.scale;
        }
        if scaled.abs() >= 1.0e36 {
            return Err(DcpError::Encoding(format!("value {} overflows fixed point", v)));
        }
        Ok(BigInt::from(scaled.round() as i128))
    }

    /// Decode an integer carrying `power` scale factors
    pub fn decode(&self, v: &BigInt, power: u32) -> f64 {
        let mut out = bigint_to_f64(v);
        for _ in 0..power {
            out /= self.scale;
        }
        out
    }
}

fn bigint_to_f64(v: &BigInt) -> f64 {
    v.to_f64().unwrap_or(f64::NAN)
}

/// Random prime of exactly `bits` bits
fn generate_prime(bits: usize) -> BigUint {
    let mut rng = rand::thread_rng();
    let p: U1024 = generate_prime_with_rng(&mut rng, Some(bits));
    BigUint::from_bytes_be(&p.to_be_bytes())
}

//! Pairing-based provable data possession over BN254
//!
//! The owner tags every slice replica at upload:
//! `σ_i = (H(i ‖ round) · u^{m_i})^sk` with `u = g1^randU`.
//! A challenge picks indices and coefficients `v_i` deterministically from
//! `sk` and the round, so the owner keeps no per-round state. The storage
//! node answers with `σ = Π σ_i^{v_i}` and `μ = Σ v_i·m_i`; the owner accepts
//! iff `e(σ, g2) == e(Π H(i ‖ round)^{v_i} · u^μ, pk)`.

use super::sha256;
use crate::error::{DcpError, Result};
use ark_bn254::{Bn254, Fq, Fr, G1Affine, G1Projective, G2Affine};
use ark_ec::{pairing::Pairing, AffineRepr, CurveGroup};
use ark_ff::{BigInteger, PrimeField, Zero};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::UniformRand;
use hkdf::Hkdf;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Upper bound on try-and-increment attempts when hashing to G1
pub const HASH_TO_CURVE_TRIES: u32 = 64;

/// Owner's pairing keypair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdpKeyPair {
    #[serde(with = "ark_hex")]
    pub secret: Fr,
    #[serde(with = "ark_hex")]
    pub public: G2Affine,
}

/// Per-file randomness; `u` is published, `rand_v` salts index sampling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileParams {
    #[serde(with = "ark_hex")]
    pub rand_u: Fr,
    #[serde(with = "ark_hex")]
    pub rand_v: Fr,
    #[serde(with = "ark_hex")]
    pub u: G1Affine,
}

/// A reproducible challenge for one round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdpChallenge {
    pub round: u64,
    /// Which precomputed tag set the prover must use
    pub tag_round: u64,
    pub indices: Vec<u64>,
    #[serde(with = "ark_hex")]
    pub coefficients: Vec<Fr>,
}

/// Aggregated answer of a storage node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdpProof {
    #[serde(with = "ark_hex")]
    pub sigma: G1Affine,
    #[serde(with = "ark_hex")]
    pub mu: Fr,
}

/// One challenged slice as seen by the prover
pub struct ProofItem<'a> {
    pub index: u64,
    pub tag: &'a G1Affine,
    pub content: &'a [u8],
}

/// Generate `(sk, pk = g2^sk)`
pub fn gen_key_pair() -> PdpKeyPair {
    let mut rng = rand::thread_rng();
    let secret = Fr::rand(&mut rng);
    let public = (G2Affine::generator() * secret).into_affine();
    PdpKeyPair { secret, public }
}

impl FileParams {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let rand_u = Fr::rand(&mut rng);
        let rand_v = Fr::rand(&mut rng);
        let u = (G1Affine::generator() * rand_u).into_affine();
        Self { rand_u, rand_v, u }
    }
}

/// Tag round used for challenge round `round`
pub fn tag_round_for(round: u64, tag_rounds: u64) -> u64 {
    round % tag_rounds.max(1)
}

/// Reduce slice content into the scalar field
pub fn content_scalar(content: &[u8]) -> Fr {
    Fr::from_le_bytes_mod_order(content)
}

/// `H(i ‖ round)` by try-and-increment on the x coordinate
pub fn hash_index(index: u64, round: u64) -> Result<G1Affine> {
    let mut buf = [0u8; 20];
    buf[..8].copy_from_slice(&index.to_be_bytes());
    buf[8..16].copy_from_slice(&round.to_be_bytes());
    for ctr in 0..HASH_TO_CURVE_TRIES {
        buf[16..].copy_from_slice(&ctr.to_be_bytes());
        let x = Fq::from_be_bytes_mod_order(&sha256(&buf));
        // G1 of BN254 has cofactor 1, every curve point is in the subgroup
        if let Some(point) = G1Affine::get_point_from_x_unchecked(x, false) {
            return Ok(point);
        }
    }
    Err(DcpError::Internal(format!(
        "hash to G1 exceeded {} tries for index {}",
        HASH_TO_CURVE_TRIES, index
    )))
}

/// Sigma tag of one slice replica for one tag round
pub fn gen_tag(
    keys: &PdpKeyPair,
    params: &FileParams,
    index: u64,
    tag_round: u64,
    content: &[u8],
) -> Result<G1Affine> {
    let m = content_scalar(content);
    let mut acc: G1Projective = hash_index(index, tag_round)?.into_group();
    acc += params.u * m;
    Ok((acc * keys.secret).into_affine())
}

fn fr_bytes(v: &Fr) -> Vec<u8> {
    v.into_bigint().to_bytes_be()
}

/// `v_i` from `HKDF(sk ‖ round ‖ i)`
fn coefficient(secret: &Fr, round: u64, index: u64) -> Result<Fr> {
    let mut ikm = fr_bytes(secret);
    ikm.extend_from_slice(&round.to_be_bytes());
    ikm.extend_from_slice(&index.to_be_bytes());
    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = [0u8; 48];
    hk.expand(b"dcp-pdp-coefficient", &mut okm)
        .map_err(|e| DcpError::Internal(format!("hkdf expand: {}", e)))?;
    Ok(Fr::from_le_bytes_mod_order(&okm))
}

/// Build the challenge for `round` over the indices a node holds
pub fn gen_challenge(
    keys: &PdpKeyPair,
    params: &FileParams,
    round: u64,
    tag_rounds: u64,
    candidates: &[u64],
    sample_count: usize,
) -> Result<PdpChallenge> {
    if candidates.is_empty() {
        return Err(DcpError::Param("no slice indices to challenge".into()));
    }
    let mut ikm = fr_bytes(&keys.secret);
    ikm.extend_from_slice(&fr_bytes(&params.rand_v));
    ikm.extend_from_slice(&round.to_be_bytes());
    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut seed = [0u8; 32];
    hk.expand(b"dcp-pdp-indices", &mut seed)
        .map_err(|e| DcpError::Internal(format!("hkdf expand: {}", e)))?;
    let mut rng = StdRng::from_seed(seed);

    let take = sample_count.clamp(1, candidates.len());
    let mut indices: Vec<u64> = candidates.choose_multiple(&mut rng, take).copied().collect();
    indices.sort_unstable();
    let coefficients = indices
        .iter()
        .map(|i| coefficient(&keys.secret, round, *i))
        .collect::<Result<Vec<_>>>()?;
    Ok(PdpChallenge {
        round,
        tag_round: tag_round_for(round, tag_rounds),
        indices,
        coefficients,
    })
}

/// Storage-node side: aggregate tags and contents
pub fn prove(challenge: &PdpChallenge, items: &[ProofItem<'_>]) -> Result<PdpProof> {
    if challenge.indices.len() != challenge.coefficients.len() {
        return Err(DcpError::Param("challenge indices and coefficients differ in length".into()));
    }
    let mut sigma = G1Projective::zero();
    let mut mu = Fr::zero();
    for (index, v) in challenge.indices.iter().zip(challenge.coefficients.iter()) {
        let item = items
            .iter()
            .find(|it| it.index == *index)
            .ok_or_else(|| DcpError::NotFound(format!("challenged slice index {}", index)))?;
        sigma += *item.tag * *v;
        mu += content_scalar(item.content) * v;
    }
    Ok(PdpProof {
        sigma: sigma.into_affine(),
        mu,
    })
}

/// Owner side: check the pairing equation
pub fn verify(
    public: &G2Affine,
    params: &FileParams,
    challenge: &PdpChallenge,
    proof: &PdpProof,
) -> Result<bool> {
    if challenge.indices.len() != challenge.coefficients.len() {
        return Ok(false);
    }
    let mut agg = G1Projective::zero();
    for (index, v) in challenge.indices.iter().zip(challenge.coefficients.iter()) {
        agg += hash_index(*index, challenge.tag_round)? * *v;
    }
    agg += params.u * proof.mu;
    let lhs = Bn254::pairing(proof.sigma, G2Affine::generator());
    let rhs = Bn254::pairing(agg.into_affine(), *public);
    Ok(lhs == rhs)
}

/// Hex encoding of a compressed arkworks value
pub fn to_hex<T: CanonicalSerialize>(v: &T) -> Result<String> {
    let mut buf = Vec::new();
    v.serialize_compressed(&mut buf)?;
    Ok(hex::encode(buf))
}

pub fn from_hex<T: CanonicalDeserialize>(s: &str) -> Result<T> {
    let bytes = hex::decode(s)?;
    Ok(T::deserialize_compressed(&bytes[..])?)
}

/// Serde adapter for arkworks values as compressed hex
pub mod ark_hex {
    use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
    use serde::{de::Error as _, ser::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<T: CanonicalSerialize, S: Serializer>(v: &T, s: S) -> Result<S::Ok, S::Error> {
        let text = super::to_hex(v).map_err(S::Error::custom)?;
        s.serialize_str(&text)
    }

    pub fn deserialize<'de, T: CanonicalDeserialize, D: Deserializer<'de>>(
        d: D,
    ) -> Result<T, D::Error> {
        let text = String::deserialize(d)?;
        super::from_hex(&text).map_err(D::Error::custom)
    }
}

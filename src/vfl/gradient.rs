//! Homomorphic gradient and cost arithmetic of one training round
//!
//! Per row `i` each party p contributes a residual part `a_p` and a cross
//! factor `w_p` such that
//!
//! - gradient of θ_p,j = (1/m) Σ (a_A + a_B)·X_p[i,j]
//! - cost = (1/m) Σ (Q_A + Q_B + w_A·w_B)
//!
//! | algorithm | party | a                 | w               | Q                         |
//! |-----------|-------|-------------------|-----------------|---------------------------|
//! | linear    | A     | u                 | u               | u²/2                      |
//! | linear    | B     | u − y             | u − y           | (u − y)²/2                |
//! | logistic  | A     | u/4               | u               | u²/8                      |
//! | logistic  | B     | ½ + u/4 − y       | u/4 − y'/2      | log2 − y'u/2 + u²/8       |
//!
//! where B holds the label, `y' = 2y − 1` and the logistic rows are the
//! second-order Taylor expansion of the sigmoid and log-loss around zero.
//! Values under encryption carry one fixed-point scale factor, products and
//! costs carry two.

use super::params::{Algorithm, RegMode};
use crate::crypto::paillier::{Ciphertext, FixedPoint, PublicKey, SecretKey};
use crate::error::{DcpError, Result};
use nalgebra::{DMatrix, DVector};
use num_bigint::{BigInt, BigUint, Sign};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Plaintext per-row quantities of one party for the current batch
#[derive(Debug, Clone)]
pub struct LocalPart {
    pub u: Vec<f64>,
    pub residual: Vec<f64>,
    pub cross: Vec<f64>,
    /// Σ Q_p plus `m` times this party's regularization term
    pub local_cost: f64,
}

/// Encrypted `LocalPart` as sent to the peer, under the sender's key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartBundle {
    pub enc_residual: Vec<Ciphertext>,
    pub enc_cross: Vec<Ciphertext>,
    pub enc_local_cost: Ciphertext,
}

/// Masks kept back while the peer decrypts
#[derive(Debug, Clone)]
pub struct Masks {
    pub grad: Vec<BigInt>,
    pub cost: BigInt,
}

/// Row range used in round `round`
pub fn batch_range(rows: usize, batch_size: usize, round: u64) -> Range<usize> {
    if batch_size == 0 || batch_size >= rows {
        return 0..rows;
    }
    let batches = rows.div_ceil(batch_size) as u64;
    let b = (round % batches) as usize;
    let start = b * batch_size;
    start..(start + batch_size).min(rows)
}

/// Penalty added to the cost, already multiplied by `m`
fn reg_cost(theta: &DVector<f64>, mode: RegMode, lambda: f64) -> f64 {
    let weights = theta.iter().skip(1);
    match mode {
        RegMode::None => 0.0,
        RegMode::Lasso => lambda * weights.map(|t| t.abs()).sum::<f64>(),
        RegMode::Ridge => lambda / 2.0 * weights.map(|t| t * t).sum::<f64>(),
    }
}

/// Compute this party's plaintext contributions
pub fn local_part(
    algorithm: Algorithm,
    x: &DMatrix<f64>,
    theta: &DVector<f64>,
    y: Option<&DVector<f64>>,
    reg_mode: RegMode,
    lambda: f64,
) -> Result<LocalPart> {
    if x.ncols() != theta.len() {
        return Err(DcpError::Internal(format!(
            "design matrix has {} columns, theta {}",
            x.ncols(),
            theta.len()
        )));
    }
    let u = x * theta;
    let m = u.len();
    let mut residual = Vec::with_capacity(m);
    let mut cross = Vec::with_capacity(m);
    let mut q = 0.0;
    match (algorithm, y) {
        (Algorithm::LinRegVL, None) => {
            for v in u.iter() {
                residual.push(*v);
                cross.push(*v);
                q += v * v / 2.0;
            }
        }
        (Algorithm::LinRegVL, Some(y)) => {
            for (v, t) in u.iter().zip(y.iter()) {
                let d = v - t;
                residual.push(d);
                cross.push(d);
                q += d * d / 2.0;
            }
        }
        (Algorithm::LogRegVL, None) => {
            for v in u.iter() {
                residual.push(v / 4.0);
                cross.push(*v);
                q += v * v / 8.0;
            }
        }
        (Algorithm::LogRegVL, Some(y)) => {
            for (v, t) in u.iter().zip(y.iter()) {
                let ys = 2.0 * t - 1.0;
                residual.push(0.5 + v / 4.0 - t);
                cross.push(v / 4.0 - ys / 2.0);
                q += std::f64::consts::LN_2 - ys * v / 2.0 + v * v / 8.0;
            }
        }
    }
    if let Some(y) = y {
        if y.len() != m {
            return Err(DcpError::Internal("label length differs from batch".into()));
        }
    }
    Ok(LocalPart {
        u: u.iter().copied().collect(),
        residual,
        cross,
        local_cost: q + reg_cost(theta, reg_mode, lambda),
    })
}

/// Encrypt a local part under the owner's own key
pub fn encrypt_part(pk: &PublicKey, fp: &FixedPoint, part: &LocalPart) -> Result<PartBundle> {
    let enc = |values: &[f64]| -> Result<Vec<Ciphertext>> {
        values
            .par_iter()
            .map(|v| Ok(pk.encrypt_signed(&fp.encode(*v, 1)?)))
            .collect()
    };
    Ok(PartBundle {
        enc_residual: enc(&part.residual)?,
        enc_cross: enc(&part.cross)?,
        enc_local_cost: pk.encrypt_signed(&fp.encode(part.local_cost, 2)?),
    })
}

fn check_bundle(peer_pk: &PublicKey, bundle: &PartBundle, m: usize) -> Result<()> {
    if bundle.enc_residual.len() != m || bundle.enc_cross.len() != m {
        return Err(DcpError::Encoding(format!(
            "peer part covers {} rows, batch has {}",
            bundle.enc_residual.len(),
            m
        )));
    }
    peer_pk.check(&bundle.enc_local_cost)
}

/// `Enc_peer(S²·Σ_i X[i,j](a_own + a_peer) + R_j)` for every own column j,
/// and the masked total cost `Enc_peer(S²·Σ(Q_A + Q_B + w_A w_B) + R_c)`.
pub fn masked_grad_and_cost(
    peer_pk: &PublicKey,
    fp: &FixedPoint,
    x: &DMatrix<f64>,
    own: &LocalPart,
    peer: &PartBundle,
) -> Result<(Vec<Ciphertext>, Ciphertext, Masks)> {
    let m = x.nrows();
    check_bundle(peer_pk, peer, m)?;

    // t_i = Enc(S·(a_peer + a_own)), with its negation for negative factors
    let totals = (0..m)
        .into_par_iter()
        .map(|i| {
            let t = peer_pk.add_plain(&peer.enc_residual[i], &fp.encode(own.residual[i], 1)?);
            let neg = peer_pk.negate(&t)?;
            Ok((t, neg))
        })
        .collect::<Result<Vec<_>>>()?;

    let grads = (0..x.ncols())
        .into_par_iter()
        .map(|j| {
            let mut acc = Ciphertext(BigUint::from(1u32));
            for (i, (t, neg)) in totals.iter().enumerate() {
                let k = fp.encode(x[(i, j)], 1)?;
                let term = match k.sign() {
                    Sign::Minus => peer_pk.scalar_mul(neg, &-k)?,
                    Sign::NoSign => continue,
                    Sign::Plus => peer_pk.scalar_mul(t, &k)?,
                };
                acc = peer_pk.add(&acc, &term);
            }
            Ok(acc)
        })
        .collect::<Result<Vec<_>>>()?;

    let cross_terms = (0..m)
        .into_par_iter()
        .map(|i| peer_pk.scalar_mul(&peer.enc_cross[i], &fp.encode(own.cross[i], 1)?))
        .collect::<Result<Vec<_>>>()?;
    let mut cost = peer_pk.add_plain(&peer.enc_local_cost, &fp.encode(own.local_cost, 2)?);
    cost = peer_pk.add(&cost, &peer_pk.sum(cross_terms.iter()));

    let grad_masks: Vec<BigInt> = grads.iter().map(|_| peer_pk.random_mask()).collect();
    let cost_mask = peer_pk.random_mask();
    let masked_grads = grads
        .iter()
        .zip(grad_masks.iter())
        .map(|(g, r)| peer_pk.add_plain(g, r))
        .collect();
    let masked_cost = peer_pk.add_plain(&cost, &cost_mask);
    Ok((
        masked_grads,
        masked_cost,
        Masks {
            grad: grad_masks,
            cost: cost_mask,
        },
    ))
}

/// Decrypt masked values the peer computed under our key
pub fn decrypt_masked(sk: &SecretKey, values: &[Ciphertext]) -> Result<Vec<BigUint>> {
    values.par_iter().map(|c| sk.decrypt(c)).collect()
}

/// Remove a mask and the fixed-point scale: `(v − R) / S² / m`
pub fn unmask(peer_pk: &PublicKey, fp: &FixedPoint, value: &BigUint, mask: &BigInt, m: usize) -> f64 {
    let raw = BigInt::from_biguint(Sign::Plus, value.clone()) - mask;
    let signed = peer_pk.from_residue(&peer_pk.to_residue(&raw));
    fp.decode(&signed, 2) / m.max(1) as f64
}

/// Gradient-descent step with the configured penalty; the bias is not penalised
pub fn update_theta(
    theta: &DVector<f64>,
    grad: &[f64],
    alpha: f64,
    lambda: f64,
    mode: RegMode,
    m: usize,
) -> Result<DVector<f64>> {
    if grad.len() != theta.len() {
        return Err(DcpError::Internal(format!(
            "gradient has {} entries, theta {}",
            grad.len(),
            theta.len()
        )));
    }
    let scale = lambda / m.max(1) as f64;
    let next = DVector::from_iterator(
        theta.len(),
        theta.iter().zip(grad.iter()).enumerate().map(|(j, (t, g))| {
            let penalty = if j == 0 {
                0.0
            } else {
                match mode {
                    RegMode::None => 0.0,
                    RegMode::Lasso if *t == 0.0 => 0.0,
                    RegMode::Lasso => scale * t.signum(),
                    RegMode::Ridge => scale * t,
                }
            };
            t - alpha * (g + penalty)
        }),
    );
    Ok(next)
}

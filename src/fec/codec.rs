//! Reed-Solomon Codec over GF(2^8)
//!
//! Systematic RS(n, n - roots) with `n <= 255`, field polynomial `0x11d`,
//! primitive element `α = 2` and first consecutive root `α^0`. Field
//! arithmetic comes from `reed_solomon_erasure::galois_8`; the errors and
//! erasures decoder (Berlekamp-Massey, Chien search, Forney) is built on top.
//!
//! # Codeword Layout
//!
//! ```text
//! | d[0] d[1] ... d[k-1] | p[0] ... p[roots-1] |
//!   degree n-1 ........................ degree 0
//! ```
//!
//! A codeword of `roots` parity symbols corrects `e` errors and `f`
//! erasures whenever `2e + f <= roots`.

use reed_solomon_erasure::galois_8::{add, div, exp, mul};
use thiserror::Error;

/// Field size minus one; also the longest codeword
pub const GF_ORDER: usize = 255;

/// Primitive element
const ALPHA: u8 = 2;

/// Decoder failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RsError {
    #[error("codeword length {len} invalid for {roots} roots")]
    InvalidLength { len: usize, roots: usize },

    #[error("erasure position {0} outside codeword")]
    InvalidErasure(usize),

    #[error("{erasures} erasures exceed {roots} roots")]
    TooManyErasures { erasures: usize, roots: usize },

    #[error("uncorrectable codeword")]
    Uncorrectable,
}

#[inline]
fn alpha_pow(power: usize) -> u8 {
    exp(ALPHA, power % GF_ORDER)
}

/// Evaluate a lowest-degree-first polynomial at `x`.
fn eval_low_first(poly: &[u8], x: u8) -> u8 {
    poly.iter().rev().fold(0u8, |acc, &c| add(mul(acc, x), c))
}

/// Reed-Solomon encoder/decoder for a fixed number of parity symbols
#[derive(Debug, Clone)]
pub struct RsCodec {
    roots: usize,
    /// Generator polynomial, highest degree first, monic
    generator: Vec<u8>,
}

impl RsCodec {
    /// Create a codec with `roots` parity symbols (1..=254).
    pub fn new(roots: usize) -> Result<Self, RsError> {
        if roots == 0 || roots >= GF_ORDER {
            return Err(RsError::InvalidLength {
                len: GF_ORDER,
                roots,
            });
        }

        // g(x) = (x - α^0)(x - α^1)...(x - α^(roots-1))
        let mut generator = vec![1u8];
        for i in 0..roots {
            let root = alpha_pow(i);
            let mut next = vec![0u8; generator.len() + 1];
            for (j, &coef) in generator.iter().enumerate() {
                next[j] = add(next[j], coef);
                next[j + 1] = add(next[j + 1], mul(coef, root));
            }
            generator = next;
        }

        Ok(Self { roots, generator })
    }

    pub fn roots(&self) -> usize {
        self.roots
    }

    /// Data symbols in a full-length codeword.
    pub fn data_symbols(&self) -> usize {
        GF_ORDER - self.roots
    }

    /// Compute `roots` parity symbols for `data`.
    pub fn encode(&self, data: &[u8], parity: &mut [u8]) -> Result<(), RsError> {
        if parity.len() != self.roots || data.len() + self.roots > GF_ORDER {
            return Err(RsError::InvalidLength {
                len: data.len() + parity.len(),
                roots: self.roots,
            });
        }

        parity.fill(0);
        for &symbol in data {
            let feedback = add(symbol, parity[0]);
            parity.copy_within(1.., 0);
            parity[self.roots - 1] = 0;
            if feedback != 0 {
                for (p, &g) in parity.iter_mut().zip(&self.generator[1..]) {
                    *p = add(*p, mul(feedback, g));
                }
            }
        }

        Ok(())
    }

    fn syndromes(&self, codeword: &[u8]) -> Vec<u8> {
        (0..self.roots)
            .map(|i| {
                let x = alpha_pow(i);
                codeword.iter().fold(0u8, |acc, &c| add(mul(acc, x), c))
            })
            .collect()
    }

    /// Correct `codeword` in place.
    ///
    /// `erasures` are known-bad symbol positions. Returns the number of
    /// symbols changed.
    pub fn decode(&self, codeword: &mut [u8], erasures: &[usize]) -> Result<usize, RsError> {
        let n = codeword.len();
        let nroots = self.roots;
        if n <= nroots || n > GF_ORDER {
            return Err(RsError::InvalidLength {
                len: n,
                roots: nroots,
            });
        }

        let mut erased: Vec<usize> = erasures.to_vec();
        erased.sort_unstable();
        erased.dedup();
        if let Some(&pos) = erased.iter().find(|&&p| p >= n) {
            return Err(RsError::InvalidErasure(pos));
        }
        if erased.len() > nroots {
            return Err(RsError::TooManyErasures {
                erasures: erased.len(),
                roots: nroots,
            });
        }

        let synd = self.syndromes(codeword);
        if synd.iter().all(|&s| s == 0) {
            return Ok(0);
        }

        // Erasure locator seeds the error locator
        let mut lambda = vec![0u8; nroots + 1];
        lambda[0] = 1;
        for (k, &pos) in erased.iter().enumerate() {
            let x = alpha_pow(n - 1 - pos);
            for j in (1..=k + 1).rev() {
                lambda[j] = add(lambda[j], mul(x, lambda[j - 1]));
            }
        }

        // Berlekamp-Massey
        let no_eras = erased.len();
        let mut b = lambda.clone();
        let mut el = no_eras;
        for r in (no_eras + 1)..=nroots {
            let discrepancy = (0..r).fold(0u8, |acc, i| add(acc, mul(lambda[i], synd[r - 1 - i])));

            if discrepancy == 0 {
                b.copy_within(0..nroots, 1);
                b[0] = 0;
                continue;
            }

            let mut t = lambda.clone();
            for i in 0..nroots {
                t[i + 1] = add(t[i + 1], mul(discrepancy, b[i]));
            }

            if 2 * el <= r + no_eras - 1 {
                el = r + no_eras - el;
                for (bi, &li) in b.iter_mut().zip(&lambda) {
                    *bi = div(li, discrepancy);
                }
            } else {
                b.copy_within(0..nroots, 1);
                b[0] = 0;
            }
            lambda = t;
        }

        let deg_lambda = match lambda.iter().rposition(|&c| c != 0) {
            Some(0) | None => return Err(RsError::Uncorrectable),
            Some(d) => d,
        };
        lambda.truncate(deg_lambda + 1);

        // Chien search: position j has locator α^(n-1-j)
        let error_positions: Vec<usize> = (0..n)
            .filter(|&j| {
                let x_inv = alpha_pow(GF_ORDER - (n - 1 - j) % GF_ORDER);
                eval_low_first(&lambda, x_inv) == 0
            })
            .collect();

        if error_positions.len() != deg_lambda {
            return Err(RsError::Uncorrectable);
        }

        // Ω(x) = S(x)Λ(x) mod x^roots
        let omega: Vec<u8> = (0..nroots)
            .map(|i| {
                (0..=i.min(deg_lambda))
                    .fold(0u8, |acc, k| add(acc, mul(lambda[k], synd[i - k])))
            })
            .collect();

        // Forney with first consecutive root α^0: e = X Ω(X⁻¹) / Λ'(X⁻¹)
        let mut corrected = 0;
        for &j in &error_positions {
            let x = alpha_pow(n - 1 - j);
            let x_inv = alpha_pow(GF_ORDER - (n - 1 - j) % GF_ORDER);

            let mut derivative = 0u8;
            for i in (1..=deg_lambda).step_by(2) {
                derivative = add(derivative, mul(lambda[i], exp(x_inv, i - 1)));
            }
            if derivative == 0 {
                return Err(RsError::Uncorrectable);
            }

            let magnitude = div(mul(x, eval_low_first(&omega, x_inv)), derivative);
            if magnitude != 0 {
                codeword[j] = add(codeword[j], magnitude);
                corrected += 1;
            }
        }

        if self.syndromes(codeword).iter().any(|&s| s != 0) {
            return Err(RsError::Uncorrectable);
        }

        Ok(corrected)
    }
}

//! Property-Based Tests for Reed-Solomon Recovery
//!
//! # Test Properties
//!
//! 1. **Correction Bound**: any `e` errors plus `f` erasures with
//!    `2e + f <= roots` decode back to the original codeword
//! 2. **Clean Codewords**: a valid codeword decodes with zero corrections
//! 3. **Interleave Coverage**: every covered block sits in exactly one
//!    round, at a codeword index below `rsn`

#![cfg(test)]

use proptest::prelude::*;

use super::codec::{RsCodec, GF_ORDER};

// =============================================================================
// Property Strategies
// =============================================================================

/// Parity symbols per codeword.
fn roots_strategy() -> impl Strategy<Value = usize> {
    2usize..=24
}

/// A roots count, a message, and corruption positions within the bound.
/// Returns (roots, data, error positions, erasure positions).
fn corruption_strategy() -> impl Strategy<Value = (usize, Vec<u8>, Vec<usize>, Vec<usize>)> {
    roots_strategy().prop_flat_map(|roots| {
        let data = prop::collection::vec(any::<u8>(), GF_ORDER - roots);
        (0..=roots / 2).prop_flat_map(move |errors| {
            let erasures = roots - 2 * errors;
            let positions = prop::sample::subsequence((0..GF_ORDER).collect::<Vec<_>>(), errors + erasures)
                .prop_shuffle();
            (Just(roots), data.clone(), positions).prop_map(move |(roots, data, positions)| {
                let (err, era) = positions.split_at(errors);
                (roots, data, err.to_vec(), era.to_vec())
            })
        })
    })
}

fn encode(codec: &RsCodec, data: &[u8]) -> Vec<u8> {
    let mut parity = vec![0u8; codec.roots()];
    codec.encode(data, &mut parity).unwrap();
    let mut codeword = data.to_vec();
    codeword.extend_from_slice(&parity);
    codeword
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: corruption within 2e + f <= roots is always repaired.
    #[test]
    fn prop_corrects_within_bound(
        (roots, data, errors, erasures) in corruption_strategy(),
        noise in 1u8..=255,
    ) {
        let codec = RsCodec::new(roots).unwrap();
        let original = encode(&codec, &data);

        let mut received = original.clone();
        for &pos in &errors {
            received[pos] ^= noise;
        }
        for &pos in &erasures {
            received[pos] = received[pos].wrapping_add(noise);
        }

        let corrected = codec.decode(&mut received, &erasures).unwrap();
        prop_assert_eq!(&received, &original);
        prop_assert!(corrected <= errors.len() + erasures.len());
    }

    /// Property: valid codewords are left untouched.
    #[test]
    fn prop_clean_codeword(
        roots in roots_strategy(),
        seed in any::<u64>(),
    ) {
        let codec = RsCodec::new(roots).unwrap();
        let data: Vec<u8> = (0..codec.data_symbols())
            .map(|i| (seed.rotate_left(i as u32 % 64) >> 3) as u8)
            .collect();
        let mut codeword = encode(&codec, &data);
        let original = codeword.clone();

        prop_assert_eq!(codec.decode(&mut codeword, &[]).unwrap(), 0);
        prop_assert_eq!(codeword, original);
    }
}

// =============================================================================
// Interleaving Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: block -> (round, index) -> block is the identity and the
    /// index always addresses a data symbol.
    #[test]
    fn prop_interleave_coverage(
        roots in 1u64..=32,
        blocks in 1u64..100_000,
        pick in any::<u64>(),
    ) {
        let rsn = GF_ORDER as u64 - roots;
        let rounds = blocks.div_ceil(rsn);
        let block = pick % blocks;

        let round = block % rounds;
        let index = block / rounds;

        prop_assert!(index < rsn);
        prop_assert_eq!(round + index * rounds, block);
    }
}

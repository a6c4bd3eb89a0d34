//! FEC Encoder
//!
//! Produces the parity area consumed by [`FecDecoder`](super::FecDecoder).

use super::codec::{RsCodec, GF_ORDER};
use crate::error::{Error, Result};

/// Computes interleaved parity over a region of blocks
#[derive(Debug, Clone)]
pub struct FecEncoder {
    codec: RsCodec,
    roots: usize,
    rsn: usize,
    block_size: usize,
}

impl FecEncoder {
    pub fn new(roots: u8, block_size: usize) -> Result<Self> {
        let codec = RsCodec::new(roots as usize)
            .map_err(|e| Error::invalid("fec_roots", e.to_string()))?;
        Ok(Self {
            codec,
            roots: roots as usize,
            rsn: GF_ORDER - roots as usize,
            block_size,
        })
    }

    /// Interleaving rounds needed for `blocks` blocks.
    pub fn rounds(&self, blocks: u64) -> u64 {
        blocks.div_ceil(self.rsn as u64)
    }

    /// Parity bytes produced for `blocks` blocks.
    pub fn parity_len(&self, blocks: u64) -> usize {
        self.rounds(blocks) as usize * self.block_size * self.roots
    }

    /// Encode `blocks` region blocks. `source` returns the contents of a
    /// region block, or `None` for blocks that read as zeros.
    pub fn encode<'a, F>(&self, blocks: u64, source: F) -> Result<Vec<u8>>
    where
        F: Fn(u64) -> Option<&'a [u8]>,
    {
        let rounds = self.rounds(blocks);
        let mut parity = vec![0u8; self.parity_len(blocks)];
        let mut symbols = vec![0u8; self.rsn];

        for round in 0..rounds {
            let columns: Vec<Option<&[u8]>> = (0..self.rsn as u64)
                .map(|i| {
                    let block = round + i * rounds;
                    if block < blocks {
                        source(block)
                    } else {
                        None
                    }
                })
                .collect();

            if let Some(short) = columns.iter().flatten().find(|c| c.len() != self.block_size) {
                return Err(Error::invalid(
                    "block",
                    format!("expected {} bytes, got {}", self.block_size, short.len()),
                ));
            }

            for j in 0..self.block_size {
                for (symbol, column) in symbols.iter_mut().zip(&columns) {
                    *symbol = column.map_or(0, |c| c[j]);
                }

                let index = round as usize * self.block_size + j;
                let out = &mut parity[index * self.roots..(index + 1) * self.roots];
                self.codec
                    .encode(&symbols, out)
                    .map_err(|e| Error::Internal(e.to_string()))?;
            }
        }

        Ok(parity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parity_layout() {
        let encoder = FecEncoder::new(2, 512).unwrap();
        assert_eq!(encoder.rounds(17), 1);
        assert_eq!(encoder.rounds(254), 2);
        assert_eq!(encoder.parity_len(17), 1024);
    }

    #[test]
    fn test_codewords_are_valid() {
        let encoder = FecEncoder::new(4, 512).unwrap();
        let blocks: Vec<Vec<u8>> = (0..3u8).map(|b| vec![b + 1; 512]).collect();
        let parity = encoder.encode(3, |b| blocks.get(b as usize).map(Vec::as_slice)).unwrap();

        // Codeword 7 of round 0: byte 7 of blocks 0..3, zeros, then parity
        let mut codeword = vec![0u8; GF_ORDER];
        for (i, block) in blocks.iter().enumerate() {
            codeword[i] = block[7];
        }
        codeword[GF_ORDER - 4..].copy_from_slice(&parity[7 * 4..8 * 4]);

        let codec = RsCodec::new(4).unwrap();
        let original = codeword.clone();
        codeword[1] ^= 0x33;
        codec.decode(&mut codeword, &[]).unwrap();
        assert_eq!(codeword, original);
    }

    #[test]
    fn test_rejects_short_blocks() {
        let encoder = FecEncoder::new(2, 512).unwrap();
        let short = vec![0u8; 100];
        assert!(encoder.encode(1, |_| Some(short.as_slice())).is_err());
    }
}

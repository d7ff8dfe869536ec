//! Residue tokenizer for ESM-2 style models.
//!
//! Single-letter residues map to fixed ids in the ESM-2 alphabet. Each sequence
//! is framed as `<cls> residues <eos>` and padded with `<pad>` up to the batch
//! width.
use std::collections::{HashMap, HashSet};

const ESM2_ALPHABET: [&str; 33] = [
    "<cls>", "<pad>", "<eos>", "<unk>", "L", "A", "G", "V", "S", "E", "R", "T", "I", "D", "P", "K",
    "Q", "N", "F", "Y", "M", "H", "W", "C", "X", "B", "U", "Z", "O", ".", "-", "<null_1>", "<mask>",
];

/// Token ids and attention mask for a batch, both `[batch, tokens]` row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBatch {
    pub ids: Vec<u32>,
    pub mask: Vec<i64>,
    pub batch: usize,
    pub tokens: usize,
}

#[derive(Debug, Clone)]
pub struct ResidueTokenizer {
    alphabet: &'static [&'static str],
    residue_ids: HashMap<u8, u32>,
    pub cls_token_id: u32,
    pub pad_token_id: u32,
    pub eos_token_id: u32,
    pub unk_token_id: u32,
    special_token_ids: HashSet<u32>,
}

impl ResidueTokenizer {
    pub fn esm2() -> Self {
        let mut residue_ids = HashMap::new();
        let mut special_token_ids = HashSet::new();
        for (id, token) in ESM2_ALPHABET.iter().enumerate() {
            let id = id as u32;
            match token.as_bytes() {
                [residue] => {
                    residue_ids.insert(*residue, id);
                }
                _ => {
                    special_token_ids.insert(id);
                }
            }
        }
        Self {
            alphabet: &ESM2_ALPHABET,
            residue_ids,
            cls_token_id: 0,
            pad_token_id: 1,
            eos_token_id: 2,
            unk_token_id: 3,
            special_token_ids,
        }
    }

    pub fn len(&self) -> usize {
        self.alphabet.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alphabet.is_empty()
    }

    pub fn token_to_id(&self, residue: u8) -> u32 {
        self.residue_ids
            .get(&residue.to_ascii_uppercase())
            .copied()
            .unwrap_or(self.unk_token_id)
    }

    pub fn id_to_token(&self, id: u32) -> &str {
        self.alphabet.get(id as usize).copied().unwrap_or("<unk>")
    }

    /// Encode into `width + 2` tokens per row, `width` growing to fit the longest
    /// sequence. Fixing the width keeps every micro-batch of one request the same shape.
    pub fn encode_batch<S: AsRef<str>>(&self, sequences: &[S], width: usize) -> EncodedBatch {
        let longest = sequences
            .iter()
            .map(|s| s.as_ref().len())
            .max()
            .unwrap_or(0);
        let tokens = longest.max(width) + 2;
        let mut ids = vec![self.pad_token_id; sequences.len() * tokens];
        let mut mask = vec![0i64; sequences.len() * tokens];

        for (row, seq) in sequences.iter().enumerate() {
            let seq = seq.as_ref().as_bytes();
            let start = row * tokens;
            ids[start] = self.cls_token_id;
            for (i, &residue) in seq.iter().enumerate() {
                ids[start + 1 + i] = self.token_to_id(residue);
            }
            ids[start + seq.len() + 1] = self.eos_token_id;
            mask[start..start + seq.len() + 2].fill(1);
        }

        EncodedBatch {
            ids,
            mask,
            batch: sequences.len(),
            tokens,
        }
    }

    /// Residue letters for `ids`, special tokens dropped.
    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter(|id| !self.special_token_ids.contains(id))
            .map(|&id| self.id_to_token(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_esm2_alphabet() {
        let tok = ResidueTokenizer::esm2();
        assert_eq!(tok.len(), 33);
        assert_eq!(tok.token_to_id(b'L'), 4);
        assert_eq!(tok.token_to_id(b'c'), 23);
        assert_eq!(tok.token_to_id(b'J'), tok.unk_token_id);
        assert_eq!(tok.id_to_token(32), "<mask>");
    }

    #[test]
    fn test_encode_batch_framing() {
        let tok = ResidueTokenizer::esm2();
        let batch = tok.encode_batch(&["LA", "G"], 0);
        assert_eq!(batch.tokens, 4);
        assert_eq!(batch.ids, vec![0, 4, 5, 2, 0, 6, 2, 1]);
        assert_eq!(batch.mask, vec![1, 1, 1, 1, 1, 1, 1, 0]);

        let wide = tok.encode_batch(&["G"], 3);
        assert_eq!(wide.ids, vec![0, 6, 2, 1, 1]);
    }

    #[test]
    fn test_decode_skips_special_tokens() {
        let tok = ResidueTokenizer::esm2();
        assert_eq!(tok.decode(&[0, 4, 5, 3, 2, 1, 1]), "LA");
    }
}

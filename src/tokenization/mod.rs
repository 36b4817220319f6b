use crate::config::{PaddingSide, TokenizerConfig};
use crate::error::{LoraForgeError, Result};

pub trait Tokenizer {
    /// Encode without adding any special tokens.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, tokens: &[u32], skip_special: bool) -> Result<String>;
    fn vocab_size(&self) -> usize;
    /// Look up a token string in the vocabulary, e.g. `</s>`.
    fn token_to_id(&self, token: &str) -> Option<u32>;
}

/// Byte-level tokenizer for tests: `<unk>`=0, `<s>`=1, `</s>`=2, byte b = b + 3.
#[derive(Default)]
pub struct NaiveTokenizer;

const NAIVE_SPECIALS: [&str; 3] = ["<unk>", "<s>", "</s>"];

impl NaiveTokenizer {
    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for NaiveTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(|b| b as u32 + 3).collect())
    }

    fn decode(&self, tokens: &[u32], skip_special: bool) -> Result<String> {
        let mut out = String::new();
        let mut bytes = Vec::new();
        for &t in tokens {
            match t {
                0..=2 => {
                    if !skip_special {
                        out.push_str(&String::from_utf8_lossy(&bytes));
                        bytes.clear();
                        out.push_str(NAIVE_SPECIALS[t as usize]);
                    }
                }
                3..=258 => bytes.push((t - 3) as u8),
                _ => {
                    return Err(LoraForgeError::TokenizerError(format!("token id {} out of range", t)));
                }
            }
        }
        out.push_str(&String::from_utf8_lossy(&bytes));
        Ok(out)
    }

    fn vocab_size(&self) -> usize {
        259
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        NAIVE_SPECIALS.iter().position(|s| *s == token).map(|i| i as u32)
    }
}

/// `tokenizer.json` loaded through the `tokenizers` crate.
pub struct HFTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HFTokenizer {
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        let tokenizer = tokenizers::Tokenizer::from_file(p)
            .map_err(|e| LoraForgeError::TokenizerError(
                format!("Failed to load tokenizer file: {}: {}", p.display(), e)
            ))?;
        Ok(Self { inner: tokenizer })
    }
}

impl Tokenizer for HFTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, false)
            .map_err(|e| LoraForgeError::TokenizerError(format!("Tokenizer encode failed: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32], skip_special: bool) -> Result<String> {
        self.inner.decode(tokens, skip_special)
            .map_err(|e| LoraForgeError::TokenizerError(format!("Tokenizer decode failed: {}", e)))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

/// Batch of encoded prompts, padded to a common length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedInput {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u32>>,
}

impl TokenizedInput {
    /// Look up a field by its tensor name.
    pub fn get(&self, name: &str) -> Option<&[Vec<u32>]> {
        match name {
            "input_ids" => Some(&self.input_ids),
            "attention_mask" => Some(&self.attention_mask),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Row `i` with padded positions removed.
    pub fn unpadded(&self, i: usize) -> Option<Vec<u32>> {
        let ids = self.input_ids.get(i)?;
        let mask = self.attention_mask.get(i)?;
        Some(ids.iter().zip(mask).filter(|(_, &m)| m != 0).map(|(&id, _)| id).collect())
    }
}

/// Turns prompts into model input according to a `TokenizerConfig`.
pub struct PromptEncoder {
    tokenizer: Box<dyn Tokenizer>,
    config: TokenizerConfig,
    bos_id: u32,
    eos_id: u32,
    pad_id: u32,
}

impl PromptEncoder {
    /// Special ids default to the tokenizer's `<s>` / `</s>`; the pad id falls back to EOS.
    pub fn new(tokenizer: Box<dyn Tokenizer>, config: TokenizerConfig) -> Result<Self> {
        let bos_id = tokenizer.token_to_id("<s>")
            .ok_or_else(|| LoraForgeError::TokenizerError("vocabulary has no <s> token".into()))?;
        let eos_id = tokenizer.token_to_id("</s>")
            .ok_or_else(|| LoraForgeError::TokenizerError("vocabulary has no </s> token".into()))?;
        Ok(Self { tokenizer, config, bos_id, eos_id, pad_id: eos_id })
    }

    pub fn with_pad_id(mut self, pad_id: u32) -> Self {
        self.pad_id = pad_id;
        self
    }

    pub fn config(&self) -> &TokenizerConfig {
        &self.config
    }

    pub fn bos_id(&self) -> u32 {
        self.bos_id
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn tokenizer(&self) -> &dyn Tokenizer {
        self.tokenizer.as_ref()
    }

    /// Encode one prompt with BOS/EOS as configured.
    pub fn encode(&self, prompt: &str) -> Result<Vec<u32>> {
        let body = self.tokenizer.encode(prompt)?;
        let mut ids = Vec::with_capacity(body.len() + 2);
        if self.config.add_bos_token {
            ids.push(self.bos_id);
        }
        ids.extend(body);
        if self.config.add_eos_token {
            ids.push(self.eos_id);
        }

        if ids.len() > self.config.model_max_length {
            return Err(LoraForgeError::SequenceLengthExceeded {
                max: self.config.model_max_length,
                actual: ids.len(),
            });
        }
        Ok(ids)
    }

    /// Encode several prompts and pad them to the longest on the configured side.
    pub fn encode_batch(&self, prompts: &[&str]) -> Result<TokenizedInput> {
        let encoded: Vec<Vec<u32>> = prompts.iter().map(|p| self.encode(p)).collect::<Result<_>>()?;
        let width = encoded.iter().map(Vec::len).max().unwrap_or(0);

        let mut input_ids = Vec::with_capacity(encoded.len());
        let mut attention_mask = Vec::with_capacity(encoded.len());
        for ids in encoded {
            let pad = width - ids.len();
            let (row, mask): (Vec<u32>, Vec<u32>) = match self.config.padding_side {
                PaddingSide::Left => (
                    std::iter::repeat(self.pad_id).take(pad).chain(ids.iter().copied()).collect(),
                    std::iter::repeat(0).take(pad).chain(std::iter::repeat(1).take(ids.len())).collect(),
                ),
                PaddingSide::Right => (
                    ids.iter().copied().chain(std::iter::repeat(self.pad_id).take(pad)).collect(),
                    std::iter::repeat(1).take(ids.len()).chain(std::iter::repeat(0).take(pad)).collect(),
                ),
            };
            input_ids.push(row);
            attention_mask.push(mask);
        }

        Ok(TokenizedInput { input_ids, attention_mask })
    }

    pub fn decode(&self, ids: &[u32], skip_special: bool) -> Result<String> {
        self.tokenizer.decode(ids, skip_special)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder(config: TokenizerConfig) -> PromptEncoder {
        PromptEncoder::new(Box::new(NaiveTokenizer::new()), config).unwrap()
    }

    #[test]
    fn test_naive_roundtrip_skips_specials() {
        let tok = NaiveTokenizer::new();
        let ids = tok.encode("héllo").unwrap();
        let mut with_specials = vec![1];
        with_specials.extend(&ids);
        with_specials.push(2);
        assert_eq!(tok.decode(&with_specials, true).unwrap(), "héllo");
        assert_eq!(tok.decode(&with_specials, false).unwrap(), "<s>héllo</s>");
    }

    #[test]
    fn test_encode_adds_bos_and_eos() {
        let enc = encoder(TokenizerConfig::default());
        assert_eq!(enc.encode("ab").unwrap(), vec![1, 97 + 3, 98 + 3, 2]);
        assert_eq!(enc.encode("").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_encode_respects_flags() {
        let enc = encoder(TokenizerConfig { add_eos_token: false, add_bos_token: false, ..TokenizerConfig::default() });
        assert_eq!(enc.encode("a").unwrap(), vec![100]);
    }

    #[test]
    fn test_too_long_prompt() {
        let enc = encoder(TokenizerConfig { model_max_length: 4, ..TokenizerConfig::default() });
        assert!(matches!(
            enc.encode("abc"),
            Err(LoraForgeError::SequenceLengthExceeded { max: 4, actual: 5 })
        ));
    }

    #[test]
    fn test_left_padding() {
        let enc = encoder(TokenizerConfig::default());
        let batch = enc.encode_batch(&["a", "abc"]).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.get("input_ids").unwrap()[0], vec![2, 2, 1, 100, 2]);
        assert_eq!(batch.get("attention_mask").unwrap()[0], vec![0, 0, 1, 1, 1]);
        assert_eq!(batch.unpadded(0).unwrap(), vec![1, 100, 2]);
        assert!(batch.get("token_type_ids").is_none());
    }

    #[test]
    fn test_right_padding() {
        let enc = encoder(TokenizerConfig { padding_side: PaddingSide::Right, ..TokenizerConfig::default() });
        let batch = enc.encode_batch(&["a", "abc"]).unwrap();
        assert_eq!(batch.attention_mask[0], vec![1, 1, 1, 0, 0]);
    }
}

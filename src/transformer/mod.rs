use crate::attention::{Attention, KVCache, RopeFreqs};
use crate::core::tensor::Tensor;
use crate::error::{LoraForgeError, Result};
use crate::nn::{Layer, Linear, RmsNorm};

/// SwiGLU MLP: `down(silu(gate(x)) * up(x))`.
pub struct FeedForward {
    pub gate_proj: Linear,
    pub up_proj: Linear,
    pub down_proj: Linear,
}

impl FeedForward {
    pub fn from_weights(gate_proj: Linear, up_proj: Linear, down_proj: Linear) -> Result<Self> {
        let hidden = up_proj.out_features();
        if gate_proj.out_features() != hidden || down_proj.in_features() != hidden {
            return Err(LoraForgeError::InvalidConfig(format!(
                "feed-forward widths disagree: gate {}, up {}, down in {}",
                gate_proj.out_features(), hidden, down_proj.in_features()
            )));
        }
        Ok(Self { gate_proj, up_proj, down_proj })
    }

    pub fn hidden_dim(&self) -> usize {
        self.up_proj.out_features()
    }
}

impl Layer for FeedForward {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(input)?.silu()?;
        let up = self.up_proj.forward(input)?;
        self.down_proj.forward(&gate.mul(&up)?)
    }
}

/// Pre-norm decoder block.
pub struct TransformerBlock {
    pub attention: Attention,
    pub feed_forward: FeedForward,
    pub attention_norm: RmsNorm,
    pub ffn_norm: RmsNorm,
}

impl TransformerBlock {
    pub fn from_weights(attention: Attention, feed_forward: FeedForward, attention_norm: RmsNorm, ffn_norm: RmsNorm) -> Self {
        Self { attention, feed_forward, attention_norm, ffn_norm }
    }

    pub fn forward_with_cache(&self, input: &Tensor, cache: &mut KVCache, layer_idx: usize, rope: &RopeFreqs) -> Result<Tensor> {
        let normed = self.attention_norm.forward(input)?;
        let attn_out = self.attention.forward_with_cache(&normed, cache, layer_idx, rope)?;
        let h = input.add(&attn_out)?;

        let normed = self.ffn_norm.forward(&h)?;
        let ff_out = self.feed_forward.forward(&normed)?;
        h.add(&ff_out)
    }

    /// Linear layer by its name inside the block, e.g. `attention.q_proj`.
    pub fn linear_mut(&mut self, name: &str) -> Option<&mut Linear> {
        match name {
            "attention.q_proj" => Some(&mut self.attention.q_proj),
            "attention.k_proj" => Some(&mut self.attention.k_proj),
            "attention.v_proj" => Some(&mut self.attention.v_proj),
            "attention.out_proj" => Some(&mut self.attention.out_proj),
            "feed_forward.gate_proj" => Some(&mut self.feed_forward.gate_proj),
            "feed_forward.up_proj" => Some(&mut self.feed_forward.up_proj),
            "feed_forward.down_proj" => Some(&mut self.feed_forward.down_proj),
            _ => None,
        }
    }

    /// All linear layers with their in-block names.
    pub fn linears(&self) -> [(&'static str, &Linear); 7] {
        [
            ("attention.q_proj", &self.attention.q_proj),
            ("attention.k_proj", &self.attention.k_proj),
            ("attention.v_proj", &self.attention.v_proj),
            ("attention.out_proj", &self.attention.out_proj),
            ("feed_forward.gate_proj", &self.feed_forward.gate_proj),
            ("feed_forward.up_proj", &self.feed_forward.up_proj),
            ("feed_forward.down_proj", &self.feed_forward.down_proj),
        ]
    }
}

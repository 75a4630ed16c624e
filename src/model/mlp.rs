//! Qwen3 MLP (SwiGLU feed-forward) implementation.
//!
//! Reference: <https://arxiv.org/abs/2002.05202>

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder, linear_no_bias};

/// Qwen3 MLP with SwiGLU activation.
///
/// Formula: `output = down_proj(silu(gate_proj(x)) * up_proj(x))`
///
/// Used by both the frozen target layers and the trainable draft layer, so
/// the forward pass only uses differentiable tensor ops.
#[derive(Debug, Clone)]
pub struct Qwen3Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    hidden_size: usize,
    intermediate_size: usize,
}

impl Qwen3Mlp {
    /// Creates a new Qwen3Mlp from a VarBuilder.
    ///
    /// # Arguments
    ///
    /// * `hidden_size` - Input/output dimension
    /// * `intermediate_size` - Intermediate (expanded) dimension
    /// * `vb` - VarBuilder for loading weights
    pub fn new(hidden_size: usize, intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        let gate_proj = linear_no_bias(hidden_size, intermediate_size, vb.pp("gate_proj"))?;
        let up_proj = linear_no_bias(hidden_size, intermediate_size, vb.pp("up_proj"))?;
        let down_proj = linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?;

        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
            hidden_size,
            intermediate_size,
        })
    }

    /// Returns the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Returns the intermediate size.
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size
    }

    /// Forward pass: `[..., hidden] -> [..., hidden]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?.silu()?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

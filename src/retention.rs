use candle_core::{bail, Result, Tensor, D};
use candle_nn::{Dropout, Linear, Module, RmsNorm, VarBuilder};

use crate::decay::{decay_rates, DecayMask};
use crate::model::RetNetConfig;
use crate::rope::Rotary;

/// Carried key-value summary for step-by-step decoding.
///
/// One state belongs to exactly one generation sequence and one retention
/// layer. It starts empty, is mutated in place by every recurrent call, and is
/// discarded when generation ends. Reusing a state across unrelated sequences
/// is undefined behavior: the carried accumulator would silently blend the
/// two contexts and no runtime check catches it.
#[derive(Debug, Default)]
pub struct RecurrentState {
    /// Per-head outer-product accumulator: (batch, heads, key_dim, value_dim).
    prev_kv: Option<Tensor>,
    /// Per-head running normalization: (batch, heads, 1, 1).
    prev_scale: Option<Tensor>,
    /// Absolute positions consumed so far, for the rotary phase.
    offset: usize,
}

impl RecurrentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of positions this state has already absorbed.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.prev_kv.is_none()
    }

    /// Clear the state so the same allocation-free handle can start a fresh
    /// sequence.
    pub fn reset(&mut self) {
        self.prev_kv = None;
        self.prev_scale = None;
        self.offset = 0;
    }
}

/// Which of the three equivalent retention formulations to run.
///
/// The choice is a performance decision, never a semantic one: parallel is the
/// chunkwise computation with a single chunk, recurrent is the chunkwise
/// computation with chunk length 1. Selection lives in one place (the model)
/// with a fixed precedence: a sequence longer than the configured block size
/// forces `Chunkwise`, otherwise a supplied state selects `Recurrent`,
/// otherwise `Parallel`.
#[derive(Debug)]
pub enum RetentionMode<'a> {
    Parallel,
    Chunkwise,
    Recurrent(&'a mut RecurrentState),
}

impl RetentionMode<'_> {
    fn name(&self) -> &'static str {
        match self {
            RetentionMode::Parallel => "parallel",
            RetentionMode::Chunkwise => "chunkwise",
            RetentionMode::Recurrent(_) => "recurrent",
        }
    }
}

/// Full-sequence retention: O(T^2), one decay-masked matrix product.
///
/// `inner_mask` must come from a [`DecayMask`] built for the sequence length;
/// it combines causal masking and decay weighting in a single matrix. Each row
/// of the masked similarity is normalized by its absolute sum clamped into
/// `[1, 5e4]`: the lower bound keeps sparse rows from blowing up, the upper
/// bound keeps over-confident rows from being amplified.
///
/// Input shapes (batch, heads, seq, dim); output (batch, heads, seq, value_dim).
pub fn parallel_retention(q: &Tensor, k: &Tensor, v: &Tensor, inner_mask: &Tensor) -> Result<Tensor> {
    let qk = q.matmul(&k.t()?)?;
    let qk = qk.broadcast_mul(&inner_mask.unsqueeze(0)?)?;
    let scale = qk.abs()?.sum_keepdim(D::Minus1)?.clamp(1f32, 5e4f32)?;
    let qk = qk.broadcast_div(&scale)?;
    qk.matmul(v)
}

/// Retention over one chunk with a carried state: O(1) per step.
///
/// This is both the recurrent strategy (chunk length 1, one call per generated
/// token, `state` owned by the caller and persisted across calls) and the
/// kernel that [`chunkwise_retention`] folds left-to-right over its chunks.
/// `masks` must be built for the chunk length `q.dim(2)`.
///
/// The state update follows the chunkwise recurrence
/// `kv <- kv * cross_decay + k^T v`, with the running scale recomputed as the
/// maximum absolute column sum clamped to at least 1. The intra-chunk and
/// carried contributions each keep their own normalization until the end,
/// where both are rescaled to their elementwise maximum and summed; skipping
/// that reconciliation makes long sequences drift away from the parallel
/// result.
pub fn recurrent_retention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    masks: &DecayMask,
    state: &mut RecurrentState,
) -> Result<Tensor> {
    let (batch, heads, seq_len, key_dim) = q.dims4()?;
    let value_dim = v.dim(D::Minus1)?;
    if seq_len != masks.len {
        bail!(
            "decay bundle built for length {} but chunk has length {}",
            masks.len,
            seq_len
        );
    }

    // Intra-chunk part, identical to the parallel formula except for the
    // missing upper clamp (the cross-chunk reconciliation below owns it).
    let qk = q.matmul(&k.t()?)?;
    let qk = qk.broadcast_mul(&masks.inner_mask.unsqueeze(0)?)?;
    let inner_scale = qk
        .abs()?
        .sum_keepdim(D::Minus1)?
        .clamp(1f32, f32::INFINITY)?;
    let inner_output = qk.broadcast_div(&inner_scale)?.matmul(v)?;

    // Each position's key is decayed individually before the outer product so
    // the summed accumulator carries the right per-position weight.
    let decayed_k = k.broadcast_mul(&masks.value_decay.unsqueeze(0)?)?;
    let kv = decayed_k
        .transpose(D::Minus2, D::Minus1)?
        .contiguous()?
        .matmul(v)?;

    let (prev_kv, prev_scale) = match (&state.prev_kv, &state.prev_scale) {
        (Some(kv), Some(scale)) => (kv.clone(), scale.clone()),
        _ => (
            Tensor::zeros((batch, heads, key_dim, value_dim), q.dtype(), q.device())?,
            Tensor::ones((batch, heads, 1, 1), q.dtype(), q.device())?,
        ),
    };

    // Carried contribution: decay-weighted queries against the state as it
    // stood *before* this chunk (causality across chunks).
    let carried = prev_kv.broadcast_div(&prev_scale)?;
    let cross_output = q
        .broadcast_mul(&masks.query_decay.unsqueeze(0)?)?
        .matmul(&carried)?;

    // Rescale both halves to the common maximum before summing.
    let all_scale = inner_scale.broadcast_maximum(&prev_scale)?;
    let inner_aligned = inner_output.broadcast_mul(&inner_scale.broadcast_div(&all_scale)?)?;
    let cross_aligned = cross_output.broadcast_mul(&prev_scale.broadcast_div(&all_scale)?)?;
    let output = inner_aligned.add(&cross_aligned)?;

    let new_kv = prev_kv
        .broadcast_mul(&masks.cross_decay.unsqueeze(0)?)?
        .add(&kv)?;
    let new_scale = new_kv
        .abs()?
        .sum_keepdim(D::Minus2)?
        .max_keepdim(D::Minus1)?
        .clamp(1f32, f32::INFINITY)?;

    state.prev_kv = Some(new_kv);
    state.prev_scale = Some(new_scale);
    state.offset += seq_len;

    Ok(output)
}

/// Hybrid retention: exact parallel computation inside fixed-size chunks,
/// recurrent state passing across them. O(T * chunk_len).
///
/// The sequence length must be divisible by `chunk_len`; anything else is a
/// precondition violation and fails fast rather than silently truncating.
/// `masks` must be built for `chunk_len`.
pub fn chunkwise_retention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    masks: &DecayMask,
    chunk_len: usize,
) -> Result<Tensor> {
    let (batch, heads, seq_len, key_dim) = q.dims4()?;
    let value_dim = v.dim(D::Minus1)?;
    if chunk_len == 0 || seq_len % chunk_len != 0 {
        bail!(
            "sequence length {} is not divisible by chunk length {}",
            seq_len,
            chunk_len
        );
    }
    let n_chunks = seq_len / chunk_len;

    let q = q.reshape((batch, heads, n_chunks, chunk_len, key_dim))?;
    let k = k.reshape((batch, heads, n_chunks, chunk_len, key_dim))?;
    let v = v.reshape((batch, heads, n_chunks, chunk_len, value_dim))?;

    let mut state = RecurrentState::new();
    let mut outputs = Vec::with_capacity(n_chunks);
    for i in 0..n_chunks {
        let qi = q.narrow(2, i, 1)?.squeeze(2)?.contiguous()?;
        let ki = k.narrow(2, i, 1)?.squeeze(2)?.contiguous()?;
        let vi = v.narrow(2, i, 1)?.squeeze(2)?.contiguous()?;
        outputs.push(recurrent_retention(&qi, &ki, &vi, masks, &mut state)?);
    }

    Tensor::cat(&outputs, 2)
}

/// Multi-scale retention layer: projections, rotation, strategy dispatch,
/// per-head normalization and gating.
#[derive(Debug)]
pub struct Retention {
    /// Fused query/key projection, split on the last dimension.
    to_qk: Linear,
    to_v: Linear,
    /// Gate projection of the raw input, passed through SiLU.
    to_g: Linear,
    to_out: Linear,
    /// Per-head RMS normalization over the value dimension.
    group_norm: RmsNorm,
    rotary: Rotary,
    resid_dropout: Dropout,
    gamma: Vec<f32>,
    n_embd: usize,
    n_heads: usize,
    key_dim: usize,
    value_dim: usize,
    block_size: usize,
    key_scaling: f64,
}

impl Retention {
    pub fn new(config: &RetNetConfig, vb: VarBuilder) -> Result<Self> {
        if config.n_embd % config.n_heads != 0 {
            bail!(
                "n_embd {} must be divisible by n_heads {}",
                config.n_embd,
                config.n_heads
            );
        }
        if config.value_embd % config.n_heads != 0 {
            bail!(
                "value_embd {} must be divisible by n_heads {}",
                config.value_embd,
                config.n_heads
            );
        }
        let key_dim = config.n_embd / config.n_heads;
        let value_dim = config.value_embd / config.n_heads;

        let to_qk = candle_nn::linear(config.n_embd, 2 * config.n_embd, vb.pp("to_qk"))?;
        let to_v = candle_nn::linear(config.n_embd, config.value_embd, vb.pp("to_v"))?;
        let to_g = candle_nn::linear(config.n_embd, config.value_embd, vb.pp("to_g"))?;
        let to_out = candle_nn::linear(config.value_embd, config.n_embd, vb.pp("to_out"))?;
        let group_norm = candle_nn::rms_norm(value_dim, 1e-5, vb.pp("group_norm"))?;
        let rotary = Rotary::new(key_dim)?;

        Ok(Self {
            to_qk,
            to_v,
            to_g,
            to_out,
            group_norm,
            rotary,
            resid_dropout: Dropout::new(config.dropout_rate),
            gamma: decay_rates(config.n_heads),
            n_embd: config.n_embd,
            n_heads: config.n_heads,
            key_dim,
            value_dim,
            block_size: config.block_size,
            key_scaling: (config.n_embd as f64).powf(-0.5),
        })
    }

    /// Fixed per-head decay rates, for callers building decay bundles of
    /// their own (tests, mostly).
    pub fn gamma(&self) -> &[f32] {
        &self.gamma
    }

    /// Forward pass: (batch, seq, n_embd) in, same shape out.
    pub fn forward(&self, x: &Tensor, mode: RetentionMode, train: bool) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        log::debug!("retention dispatch: mode={} seq_len={}", mode.name(), seq_len);

        let qk = self.to_qk.forward(x)?;
        let q = qk.narrow(D::Minus1, 0, self.n_embd)?;
        let k = qk.narrow(D::Minus1, self.n_embd, self.n_embd)?;
        let k = k.affine(self.key_scaling, 0.0)?;
        let v = self.to_v.forward(x)?;

        let q = q
            .reshape((batch, seq_len, self.n_heads, self.key_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batch, seq_len, self.n_heads, self.key_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batch, seq_len, self.n_heads, self.value_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        // Rotary phase is absolute: a recurrent step rotates by the number of
        // positions its state has already consumed.
        let pos_start = match &mode {
            RetentionMode::Recurrent(state) => state.offset(),
            _ => 0,
        };
        let (q, k) = self.rotary.apply(&q, &k, pos_start)?;

        let retained = match mode {
            RetentionMode::Parallel => {
                let masks = DecayMask::build(&self.gamma, seq_len, x.device())?;
                parallel_retention(&q, &k, &v, &masks.inner_mask)?
            }
            RetentionMode::Chunkwise => {
                let masks = DecayMask::build(&self.gamma, self.block_size, x.device())?;
                chunkwise_retention(&q, &k, &v, &masks, self.block_size)?
            }
            RetentionMode::Recurrent(state) => {
                let masks = DecayMask::build(&self.gamma, seq_len, x.device())?;
                recurrent_retention(&q, &k, &v, &masks, state)?
            }
        };

        // (B, H, T, value_dim) -> per-head RMS norm -> (B, T, H * value_dim).
        let y = retained.transpose(1, 2)?.contiguous()?;
        let y = self.group_norm.forward(&y)?;
        let y = y.reshape((batch, seq_len, self.n_heads * self.value_dim))?;

        let gate = candle_nn::ops::silu(&self.to_g.forward(x)?)?;
        let y = gate.mul(&y)?;
        let y = self.to_out.forward(&y)?;

        if train {
            self.resid_dropout.forward(&y, train)
        } else {
            Ok(y)
        }
    }
}

use candle_core::{bail, Result, Tensor};

/// Rotary position encoding for query/key tensors.
///
/// Angles are a function of *absolute* position: callers decoding token by
/// token must pass the number of positions already consumed as `pos_start` so
/// the rotary phase lines up with a single full-sequence call. Resetting the
/// phase every call would silently break the equivalence between the parallel
/// and recurrent retention modes.
#[derive(Debug, Clone)]
pub struct Rotary {
    head_dim: usize,
    theta: f64,
}

impl Rotary {
    pub fn new(head_dim: usize) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            bail!("rotary head_dim must be a positive even number, got {head_dim}");
        }
        Ok(Self {
            head_dim,
            theta: 10_000.0,
        })
    }

    /// Sine/cosine tables for positions `pos_start..pos_start + seq_len`,
    /// each shaped (seq_len, head_dim / 2).
    fn sin_cos(&self, pos_start: usize, seq_len: usize, like: &Tensor) -> Result<(Tensor, Tensor)> {
        let half = self.head_dim / 2;
        let mut sin_data = Vec::with_capacity(seq_len * half);
        let mut cos_data = Vec::with_capacity(seq_len * half);
        for pos in pos_start..pos_start + seq_len {
            for idx in 0..half {
                let inv_freq = self.theta.powf(-((2 * idx) as f64) / self.head_dim as f64);
                let angle = pos as f64 * inv_freq;
                sin_data.push(angle.sin() as f32);
                cos_data.push(angle.cos() as f32);
            }
        }
        let sin = Tensor::from_vec(sin_data, (seq_len, half), like.device())?;
        let cos = Tensor::from_vec(cos_data, (seq_len, half), like.device())?;
        Ok((sin, cos))
    }

    /// Rotate queries and keys in place-free fashion.
    ///
    /// Both tensors must be contiguous and shaped (batch, heads, seq, head_dim);
    /// consecutive feature pairs are treated as 2-D coordinates and rotated by
    /// the per-position angle. Queries and keys receive the identical rotation,
    /// which is what makes the similarity relative-position aware.
    pub fn apply(&self, q: &Tensor, k: &Tensor, pos_start: usize) -> Result<(Tensor, Tensor)> {
        let (batch, heads, seq_len, head_dim) = q.dims4()?;
        if k.dims4()? != (batch, heads, seq_len, head_dim) {
            bail!(
                "q/k shape mismatch: q={:?} k={:?}",
                q.shape().dims(),
                k.shape().dims()
            );
        }
        if head_dim != self.head_dim {
            bail!(
                "tensor head_dim {} does not match rotary head_dim {}",
                head_dim,
                self.head_dim
            );
        }

        let half = head_dim / 2;
        let (sin, cos) = self.sin_cos(pos_start, seq_len, q)?;
        let sin = sin.reshape((1, 1, seq_len, half))?;
        let cos = cos.reshape((1, 1, seq_len, half))?;

        let rotate_one = |tensor: &Tensor| -> Result<Tensor> {
            let pairs = tensor.reshape((batch, heads, seq_len, half, 2))?;
            let chunks = pairs.chunk(2, 4)?;
            let even = chunks[0].squeeze(4)?;
            let odd = chunks[1].squeeze(4)?;

            let rotated_even = even.broadcast_mul(&cos)?.sub(&odd.broadcast_mul(&sin)?)?;
            let rotated_odd = odd.broadcast_mul(&cos)?.add(&even.broadcast_mul(&sin)?)?;

            Tensor::cat(&[&rotated_even.unsqueeze(4)?, &rotated_odd.unsqueeze(4)?], 4)?
                .reshape((batch, heads, seq_len, head_dim))
        };

        Ok((rotate_one(q)?, rotate_one(k)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_rejects_odd_head_dim() {
        assert!(Rotary::new(7).is_err());
        assert!(Rotary::new(0).is_err());
        assert!(Rotary::new(8).is_ok());
    }

    #[test]
    fn test_position_zero_is_identity() {
        let device = Device::Cpu;
        let rotary = Rotary::new(4).unwrap();
        let q = Tensor::randn(0f32, 1f32, (1, 2, 1, 4), &device).unwrap();
        let k = Tensor::randn(0f32, 1f32, (1, 2, 1, 4), &device).unwrap();

        let (q_rot, k_rot) = rotary.apply(&q, &k, 0).unwrap();

        // cos(0) = 1, sin(0) = 0: the first position is untouched.
        let before = q.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let after = q_rot.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(k_rot.dims(), k.dims());
    }

    #[test]
    fn test_offset_matches_full_sequence() {
        let device = Device::Cpu;
        let rotary = Rotary::new(8).unwrap();
        let q = Tensor::randn(0f32, 1f32, (1, 1, 4, 8), &device).unwrap();
        let k = Tensor::randn(0f32, 1f32, (1, 1, 4, 8), &device).unwrap();

        let (q_full, _) = rotary.apply(&q, &k, 0).unwrap();

        // Rotating position 3 alone with pos_start = 3 must agree with the
        // same position inside a full-sequence call.
        let q3 = q.narrow(2, 3, 1).unwrap().contiguous().unwrap();
        let k3 = k.narrow(2, 3, 1).unwrap().contiguous().unwrap();
        let (q3_rot, _) = rotary.apply(&q3, &k3, 3).unwrap();

        let expected = q_full
            .narrow(2, 3, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let got = q3_rot.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in expected.iter().zip(got.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rotation_preserves_norm() {
        let device = Device::Cpu;
        let rotary = Rotary::new(6).unwrap();
        let q = Tensor::randn(0f32, 1f32, (2, 2, 5, 6), &device).unwrap();
        let k = Tensor::randn(0f32, 1f32, (2, 2, 5, 6), &device).unwrap();

        let (q_rot, _) = rotary.apply(&q, &k, 2).unwrap();

        let norm_before: f32 = q
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        let norm_after: f32 = q_rot
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((norm_before - norm_after).abs() / norm_before < 1e-4);
    }
}

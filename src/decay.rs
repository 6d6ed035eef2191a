use candle_core::{Device, Result, Tensor};

/// Per-head decay rates: `gamma[h] = ln(1 - 2^(-5 - h))`.
///
/// All rates are negative and `|gamma[h]|` strictly decreases with `h`, so
/// head 0 forgets fastest and later heads retain context longer. Computed
/// once at layer construction and passed by reference into every strategy.
pub fn decay_rates(n_heads: usize) -> Vec<f32> {
    (0..n_heads)
        .map(|h| (1.0 - 2f64.powi(-5 - h as i32)).ln() as f32)
        .collect()
}

/// The four decay tensors shared by the parallel, recurrent and chunkwise
/// retention strategies, all derived from the same `gamma` vector for a fixed
/// sequence (or chunk) length.
///
/// Parallel retention over a length-L sequence is the chunkwise computation
/// with a single chunk of length L, and recurrent retention is the chunkwise
/// computation with chunk length 1; this bundle is what makes the three modes
/// interchangeable.
#[derive(Debug, Clone)]
pub struct DecayMask {
    /// Intra-chunk causal decay weights, row-normalized: (heads, len, len).
    pub inner_mask: Tensor,
    /// Total decay across a full chunk, `exp(gamma_h * len)`: (heads, 1, 1).
    pub cross_decay: Tensor,
    /// Per-position decay applied to queries before combining with carried
    /// cross-chunk state: (heads, len, 1).
    pub query_decay: Tensor,
    /// Per-position decay applied to keys when folding a chunk's key-value
    /// outer product into the carried state, normalized so products with
    /// `query_decay` telescope to plain distance decay: (heads, len, 1).
    pub value_decay: Tensor,
    /// Chunk length this bundle was built for.
    pub len: usize,
}

impl DecayMask {
    /// Build the decay bundle for the given per-head rates and length.
    ///
    /// The unnormalized mask is `exp(gamma_h * (i - j))` for `j <= i` and 0
    /// above the diagonal. Each row is divided by `sqrt(sum(row))` clamped to
    /// at least 1, so a length-1 sequence stays finite instead of dividing by
    /// something tiny. `value_decay` is the last mask row divided by its sum,
    /// and `query_decay` is the position-from-start decay
    /// `exp(gamma_h * (i + 1))` times that same sum over the row scale: the
    /// sum factor cancels in the product, so a key at position `j` of one
    /// chunk reaching a query at position `i` of the next carries exactly
    /// `exp(gamma_h * (len + i - j))` over the query row's scale.
    pub fn build(gamma: &[f32], len: usize, device: &Device) -> Result<Self> {
        if len == 0 || gamma.is_empty() {
            candle_core::bail!("decay bundle requires at least one head and one position");
        }
        let n_heads = gamma.len();
        let mut inner = vec![0f32; n_heads * len * len];
        let mut cross = vec![0f32; n_heads];
        let mut query = vec![0f32; n_heads * len];
        let mut value = vec![0f32; n_heads * len];

        for (h, &g) in gamma.iter().enumerate() {
            let mut mask = vec![0f32; len * len];
            let mut scale = vec![0f32; len];
            for i in 0..len {
                let mut row_sum = 0f32;
                for j in 0..=i {
                    let w = (g * (i - j) as f32).exp();
                    mask[i * len + j] = w;
                    row_sum += w;
                }
                // The diagonal contributes exp(0) = 1, but the clamp is still
                // mandatory: it is what keeps degenerate lengths well-defined.
                scale[i] = row_sum.sqrt().max(1.0);
            }

            let base = h * len * len;
            for i in 0..len {
                for j in 0..=i {
                    inner[base + i * len + j] = mask[i * len + j] / scale[i];
                }
            }

            let last = len - 1;
            let last_row_sum: f32 = mask[last * len..(last + 1) * len].iter().sum();
            for j in 0..len {
                value[h * len + j] = mask[last * len + j] / last_row_sum;
            }
            for i in 0..len {
                query[h * len + i] = (g * (i + 1) as f32).exp() * last_row_sum / scale[i];
            }
            cross[h] = (g * len as f32).exp();
        }

        Ok(Self {
            inner_mask: Tensor::from_vec(inner, (n_heads, len, len), device)?,
            cross_decay: Tensor::from_vec(cross, (n_heads, 1, 1), device)?,
            query_decay: Tensor::from_vec(query, (n_heads, len, 1), device)?,
            value_decay: Tensor::from_vec(value, (n_heads, len, 1), device)?,
            len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_finite(t: &Tensor) -> bool {
        t.flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .all(|v| v.is_finite())
    }

    #[test]
    fn test_decay_rates_strictly_stronger_per_head() {
        let gamma = decay_rates(8);
        assert_eq!(gamma.len(), 8);
        for h in 0..7 {
            assert!(gamma[h] < 0.0);
            assert!(
                gamma[h].abs() > gamma[h + 1].abs(),
                "head {} should decay faster than head {}",
                h,
                h + 1
            );
        }
    }

    #[test]
    fn test_length_one_bundle_is_finite() {
        let device = Device::Cpu;
        let gamma = decay_rates(4);
        let masks = DecayMask::build(&gamma, 1, &device).unwrap();

        assert!(all_finite(&masks.inner_mask));
        assert!(all_finite(&masks.cross_decay));
        assert!(all_finite(&masks.query_decay));
        assert!(all_finite(&masks.value_decay));

        // A single position attends only to itself with full weight.
        let inner = masks.inner_mask.to_vec3::<f32>().unwrap();
        for head in &inner {
            assert!((head[0][0] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_inner_mask_is_causal() {
        let device = Device::Cpu;
        let gamma = decay_rates(2);
        let masks = DecayMask::build(&gamma, 5, &device).unwrap();
        let inner = masks.inner_mask.to_vec3::<f32>().unwrap();

        for head in &inner {
            for i in 0..5 {
                for j in (i + 1)..5 {
                    assert_eq!(head[i][j], 0.0);
                }
                assert!(head[i][i] > 0.0);
            }
        }
    }

    #[test]
    fn test_mask_decays_with_distance() {
        let device = Device::Cpu;
        let gamma = decay_rates(1);
        let masks = DecayMask::build(&gamma, 6, &device).unwrap();
        let inner = masks.inner_mask.to_vec3::<f32>().unwrap();

        // Within a row, weight must fall as the position difference grows.
        let row = &inner[0][5];
        for j in 0..5 {
            assert!(row[j] < row[j + 1]);
        }
    }

    #[test]
    fn test_cross_decay_matches_chunk_length() {
        let device = Device::Cpu;
        let gamma = decay_rates(3);
        let len = 4;
        let masks = DecayMask::build(&gamma, len, &device).unwrap();
        let cross = masks.cross_decay.flatten_all().unwrap().to_vec1::<f32>().unwrap();

        for (h, &c) in cross.iter().enumerate() {
            let expected = (gamma[h] * len as f32).exp();
            assert!((c - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_value_decay_is_normalized_last_row() {
        let device = Device::Cpu;
        let gamma = decay_rates(2);
        let len = 4;
        let masks = DecayMask::build(&gamma, len, &device).unwrap();
        let value = masks.value_decay.to_vec3::<f32>().unwrap();

        for (h, &g) in gamma.iter().enumerate() {
            let row_sum: f32 = (0..len).map(|d| (g * d as f32).exp()).sum();
            for j in 0..len {
                let expected = (g * (len - 1 - j) as f32).exp() / row_sum;
                assert!((value[h][j][0] - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_cross_chunk_weights_telescope() {
        let device = Device::Cpu;
        let gamma = decay_rates(2);
        let len = 4;
        let masks = DecayMask::build(&gamma, len, &device).unwrap();
        let query = masks.query_decay.to_vec3::<f32>().unwrap();
        let value = masks.value_decay.to_vec3::<f32>().unwrap();

        for (h, &g) in gamma.iter().enumerate() {
            for i in 0..len {
                let row_sum: f32 = (0..=i).map(|d| (g * d as f32).exp()).sum();
                let scale = row_sum.sqrt().max(1.0);
                for j in 0..len {
                    // A key at position j of one chunk is len + i - j steps
                    // behind a query at position i of the next chunk; the
                    // carried weight must be the plain distance decay over
                    // the query row's scale, with no leftover factors.
                    let expected = (g * (len + i - j) as f32).exp() / scale;
                    let got = query[h][i][0] * value[h][j][0];
                    assert!(
                        (got - expected).abs() < 1e-6,
                        "head {} query {} key {}: {} vs {}",
                        h,
                        i,
                        j,
                        got,
                        expected
                    );
                }
            }
        }
    }
}

//! Symmetric degree normalization and grouped summation.

use candle_core::{Tensor, D};

use crate::error::Result;

/// Per-edge weights `deg^{-1/2}[head] * deg^{-1/2}[tail]`.
///
/// Degree is the number of edges received by each entity within this edge
/// group, counted at `heads`. Entities with zero degree get weight `0.0`
/// instead of `inf`.
///
/// # Arguments
/// - `heads`: receiving entity per edge
/// - `tails`: sending entity per edge
/// - `num_entities`: size of the entity vocabulary
pub fn symmetric_norm(heads: &[u32], tails: &[u32], num_entities: usize) -> Vec<f32> {
    debug_assert_eq!(heads.len(), tails.len());

    let mut deg = vec![0f32; num_entities];
    for &h in heads {
        deg[h as usize] += 1.0;
    }

    let deg_inv: Vec<f32> = deg
        .iter()
        .map(|&d| {
            let v = d.powf(-0.5);
            if v.is_infinite() {
                0.0
            } else {
                v
            }
        })
        .collect();

    heads
        .iter()
        .zip(tails)
        .map(|(&h, &t)| deg_inv[h as usize] * deg_inv[t as usize])
        .collect()
}

/// Sum rows of `values` into `num_segments` buckets keyed by `index`.
///
/// Buckets that receive nothing stay zero.
///
/// # Arguments
/// - `values`: rows to aggregate (M x d)
/// - `index`: bucket per row (M), u32
/// - `num_segments`: number of output rows
///
/// # Returns
/// - Aggregated rows (num_segments x d)
pub fn segment_sum(values: &Tensor, index: &Tensor, num_segments: usize) -> Result<Tensor> {
    let d = values.dim(D::Minus1)?;
    let zeros = Tensor::zeros((num_segments, d), values.dtype(), values.device())?;
    if values.dim(0)? == 0 {
        return Ok(zeros);
    }
    Ok(zeros.index_add(index, values, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_unit_degree_gives_unit_weight() {
        // every entity receives exactly one edge
        let heads = [0, 1, 2];
        let tails = [1, 2, 0];
        let norm = symmetric_norm(&heads, &tails, 3);
        assert_eq!(norm, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_zero_degree_sender_gives_zero() {
        // entity 2 sends but never receives
        let heads = [0, 1];
        let tails = [2, 0];
        let norm = symmetric_norm(&heads, &tails, 3);
        assert_eq!(norm[0], 0.0);
        assert!(norm.iter().all(|w| w.is_finite()));
        assert_eq!(norm[1], 1.0);
    }

    #[test]
    fn test_shared_head_is_scaled() {
        let heads = [0, 0, 1, 1, 1, 1];
        let tails = [1, 1, 0, 0, 0, 0];
        let norm = symmetric_norm(&heads, &tails, 2);
        let expected = (1.0 / 2f32.sqrt()) * 0.5;
        for w in norm {
            assert!((w - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_segment_sum_accumulates() {
        let device = Device::Cpu;
        let values = Tensor::new(&[[1f32, 2.], [3., 4.], [5., 6.]], &device).unwrap();
        let index = Tensor::new(&[2u32, 0, 2], &device).unwrap();

        let out = segment_sum(&values, &index, 4).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![vec![3., 4.], vec![0., 0.], vec![6., 8.], vec![0., 0.]]
        );
    }

    #[test]
    fn test_segment_sum_empty_input() {
        let device = Device::Cpu;
        let values = Tensor::zeros((0, 3), candle_core::DType::F32, &device).unwrap();
        let index = Tensor::zeros(0, candle_core::DType::U32, &device).unwrap();

        let out = segment_sum(&values, &index, 2).unwrap();
        assert_eq!(out.dims(), &[2, 3]);
    }
}

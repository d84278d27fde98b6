//! OFT (Orthogonal Fine-Tuning) adapter math
//!
//! An OFT adapter stores one generator per block of output rows. The
//! generators are skew-symmetrised, their joint Frobenius norm is capped at
//! `alpha * out_dim`, and each block is mapped to an orthogonal matrix with the
//! Cayley transform `R = (I + Q)(I - Q)^-1`. The blended blocks are assembled
//! into an `out_dim x out_dim` block-diagonal matrix.

use candle_core::{DType, Device, Tensor};
use log::debug;

use super::cayley::{cayley_all, Block};
use super::error::{NetworkError, Result};
use super::layer::OutputDimension;
use super::module::{NetworkModule, NetworkWeights};

/// Added to both norms in the rescale so a zero generator stays zero.
pub const NORM_EPS: f64 = 1e-8;

/// Validate `(num_blocks, block_size, block_size)` against `out_dim`.
fn block_layout(block_params: &Tensor, out_dim: usize) -> Result<(usize, usize)> {
    let dims = block_params.dims();
    if dims.len() != 3 {
        return Err(NetworkError::shape("oft_blocks rank", &[3], &[dims.len()]));
    }
    let (num_blocks, block_size) = (dims[0], dims[1]);
    if dims[2] != block_size {
        return Err(NetworkError::shape(
            "oft_blocks",
            &[num_blocks, block_size, block_size],
            dims,
        ));
    }
    if num_blocks == 0 || num_blocks * block_size != out_dim {
        return Err(NetworkError::shape(
            "oft_blocks tiling of out_dim (num_blocks * block_size)",
            &[out_dim],
            &[num_blocks * block_size],
        ));
    }
    Ok((num_blocks, block_size))
}

/// Skew-symmetrised generator after the norm clamp, with the norms involved.
struct Generator {
    q: Tensor,
    norm: f64,
    clamped_norm: f64,
}

fn clamp_generator(block_params: &Tensor, constraint: f64) -> Result<Generator> {
    if !constraint.is_finite() {
        return Err(NetworkError::Configuration(format!(
            "norm constraint must be finite, got {}",
            constraint
        )));
    }

    let q = (block_params - block_params.transpose(1, 2)?)?;
    let norm = q
        .to_dtype(DType::F64)?
        .sqr()?
        .sum_all()?
        .sqrt()?
        .to_scalar::<f64>()?;
    let clamped_norm = norm.min(constraint);
    let factor = (clamped_norm + NORM_EPS) / (norm + NORM_EPS);

    if !norm.is_finite() || !factor.is_finite() {
        return Err(NetworkError::Configuration(format!(
            "generator is not finite after the norm clamp (norm {}, constraint {})",
            norm, constraint
        )));
    }
    if norm > constraint {
        debug!("OFT norm clamp active: {:.6} -> {:.6}", norm, clamped_norm);
    }

    Ok(Generator {
        q: q.affine(factor, 0.0)?,
        norm,
        clamped_norm,
    })
}

fn to_host_blocks(t: &Tensor) -> Result<Vec<Block>> {
    let nested = t.to_dtype(DType::F64)?.to_vec3::<f64>()?;
    Ok(nested.into_iter().map(Block::from_rows).collect())
}

fn stack_blocks(blocks: &[Block], dtype: DType, device: &Device) -> Result<Tensor> {
    let size = blocks.first().map(|b| b.size).unwrap_or(0);
    let data: Vec<f64> = blocks.iter().flat_map(|b| b.data.iter().copied()).collect();
    Ok(Tensor::from_vec(data, (blocks.len(), size, size), device)?.to_dtype(dtype)?)
}

fn block_diag(blocks: &[Block], out_dim: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0.0f64; out_dim * out_dim];
    let mut offset = 0;
    for block in blocks {
        let n = block.size;
        for i in 0..n {
            let row = (offset + i) * out_dim + offset;
            data[row..row + n].copy_from_slice(&block.data[i * n..(i + 1) * n]);
        }
        offset += n;
    }
    Ok(Tensor::from_vec(data, (out_dim, out_dim), device)?.to_dtype(dtype)?)
}

/// `multiplier * R + (1 - multiplier) * I`; the multiplier is not clamped.
fn blend_with_identity(rotation: &Block, multiplier: f64) -> Block {
    let n = rotation.size;
    let mut out = rotation.clone();
    for (idx, value) in out.data.iter_mut().enumerate() {
        let eye = if idx / n == idx % n { 1.0 } else { 0.0 };
        *value = multiplier * *value + (1.0 - multiplier) * eye;
    }
    out
}

fn rotation_with_constraint(
    block_params: &Tensor,
    constraint: f64,
    out_dim: usize,
    multiplier: f64,
) -> Result<Tensor> {
    block_layout(block_params, out_dim)?;
    let generator = clamp_generator(block_params, constraint)?;
    let rotations = cayley_all(&to_host_blocks(&generator.q)?)?;
    let weighted: Vec<Block> = rotations
        .iter()
        .map(|r| blend_with_identity(r, multiplier))
        .collect();
    block_diag(&weighted, out_dim, block_params.dtype(), block_params.device())
}

/// Block-diagonal OFT rotation for `block_params` of shape
/// `(num_blocks, block_size, block_size)`.
///
/// `alpha` is expected to be positive; it is not validated here beyond
/// rejecting values that make the clamped generator non-finite. The result has
/// shape `(out_dim, out_dim)` and the dtype and device of `block_params`.
pub fn compute_rotation(
    block_params: &Tensor,
    alpha: f64,
    out_dim: usize,
    multiplier: f64,
) -> Result<Tensor> {
    rotation_with_constraint(block_params, alpha * out_dim as f64, out_dim, multiplier)
}

/// Skew-symmetrised generator `Q` after the norm clamp and rescale.
pub fn constrained_generator(block_params: &Tensor, alpha: f64, out_dim: usize) -> Result<Tensor> {
    block_layout(block_params, out_dim)?;
    Ok(clamp_generator(block_params, alpha * out_dim as f64)?.q)
}

/// Per-block Cayley transform of a `(num_blocks, n, n)` generator stack,
/// before any multiplier blending.
pub fn cayley_blocks(q: &Tensor) -> Result<Tensor> {
    let blocks = to_host_blocks(q)?;
    let rotations = cayley_all(&blocks)?;
    stack_blocks(&rotations, q.dtype(), q.device())
}

/// Merge a rotation into a base weight of shape `(out_dim, in_dim)`.
///
/// NOTE: the adapter is documented as `W' = R * W0` (a matrix product), but
/// existing OFT files were produced against the elementwise form
/// `W' = W0 + R`, which is what is computed here. The rotation is fitted to
/// the base weight by keeping its first `in_dim` columns, or zero-padding
/// columns when `in_dim > out_dim`.
pub fn merge_into_weight(base_weight: &Tensor, rotation: &Tensor) -> Result<Tensor> {
    let base_dims = base_weight.dims();
    if base_dims.len() != 2 {
        return Err(NetworkError::shape("base weight rank", &[2], &[base_dims.len()]));
    }
    let (out_dim, in_dim) = (base_dims[0], base_dims[1]);

    let rot_dims = rotation.dims();
    if rot_dims.len() != 2 || rot_dims[0] != out_dim || rot_dims[1] != out_dim {
        return Err(NetworkError::shape("rotation", &[out_dim, out_dim], rot_dims));
    }

    let fitted = if in_dim <= out_dim {
        rotation.narrow(1, 0, in_dim)?
    } else {
        rotation.pad_with_zeros(1, 0, in_dim - out_dim)?
    };
    let fitted = fitted
        .to_device(base_weight.device())?
        .to_dtype(base_weight.dtype())?;

    Ok(base_weight.add(&fitted)?)
}

/// Read a scalar stored as a 0-d or single-element tensor.
fn scalar_value(t: &Tensor, name: &str) -> Result<f64> {
    let values = t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    match values.as_slice() {
        [v] => Ok(*v),
        _ => Err(NetworkError::Configuration(format!(
            "{} must be a scalar, got shape {:?}",
            name,
            t.dims()
        ))),
    }
}

/// An OFT adapter attached to one layer.
///
/// The generator stack and alpha are fixed for the adapter's lifetime; the
/// multiplier is supplied on each call.
#[derive(Debug, Clone)]
pub struct OftModule {
    name: String,
    oft_blocks: Tensor,
    alpha: f64,
    out_dim: usize,
    num_blocks: usize,
    block_size: usize,
    constraint: f64,
}

impl OftModule {
    pub fn new(weights: &NetworkWeights, layer: &dyn OutputDimension) -> Result<Self> {
        let oft_blocks = weights
            .get("oft_blocks")
            .ok_or_else(|| {
                NetworkError::Configuration(format!("{}: missing oft_blocks", weights.name))
            })?
            .clone();
        let alpha_tensor = weights.get("alpha").ok_or_else(|| {
            NetworkError::Configuration(format!("{}: missing alpha", weights.name))
        })?;
        let alpha = scalar_value(alpha_tensor, "alpha")?;
        if !alpha.is_finite() || alpha <= 0.0 {
            return Err(NetworkError::Configuration(format!(
                "{}: alpha must be positive, got {}",
                weights.name, alpha
            )));
        }

        let out_dim = layer.output_dimension();
        let (num_blocks, block_size) = block_layout(&oft_blocks, out_dim)?;
        let constraint = alpha * out_dim as f64;

        debug!(
            "Attached OFT adapter {}: {} blocks of {}x{}, constraint {:.4}",
            weights.name, num_blocks, block_size, block_size, constraint
        );

        Ok(Self {
            name: weights.name.clone(),
            oft_blocks,
            alpha,
            out_dim,
            num_blocks,
            block_size,
            constraint,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn constraint(&self) -> f64 {
        self.constraint
    }

    /// Raw and clamped generator norms.
    pub fn generator_norms(&self) -> Result<(f64, f64)> {
        let generator = clamp_generator(&self.oft_blocks, self.constraint)?;
        Ok((generator.norm, generator.clamped_norm))
    }
}

impl NetworkModule for OftModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_weight(&self, multiplier: f64) -> Result<Tensor> {
        rotation_with_constraint(&self.oft_blocks, self.constraint, self.out_dim, multiplier)
    }

    fn calc_updown(&self, orig_weight: &Tensor, multiplier: f64) -> Result<Tensor> {
        let dims = orig_weight.dims().to_vec();
        if dims.len() < 2 || dims[0] != self.out_dim {
            return Err(NetworkError::shape(
                "original weight leading dimension",
                &[self.out_dim],
                &dims,
            ));
        }

        let blocks = self
            .oft_blocks
            .to_device(orig_weight.device())?
            .to_dtype(orig_weight.dtype())?;
        let rotation = rotation_with_constraint(&blocks, self.constraint, self.out_dim, multiplier)?;

        // Convolution kernels are merged as (out, in * kh * kw)
        let flat_in: usize = dims[1..].iter().product();
        let base = orig_weight.reshape((self.out_dim, flat_in))?;
        let merged = merge_into_weight(&base, &rotation)?;
        Ok(merged.reshape(dims)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networks::layer::LayerInfo;
    use anyhow::Result;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn random_blocks(seed: u64, num_blocks: usize, block_size: usize, scale: f64) -> Result<Tensor> {
        let mut rng = StdRng::seed_from_u64(seed);
        let data: Vec<f64> = (0..num_blocks * block_size * block_size)
            .map(|_| rng.gen_range(-scale..scale))
            .collect();
        Ok(Tensor::from_vec(data, (num_blocks, block_size, block_size), &Device::Cpu)?)
    }

    fn identity(n: usize) -> Vec<Vec<f64>> {
        (0..n)
            .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect()
    }

    fn max_diff(a: &[Vec<f64>], b: &[Vec<f64>]) -> f64 {
        a.iter()
            .zip(b)
            .flat_map(|(ra, rb)| ra.iter().zip(rb).map(|(x, y)| (x - y).abs()))
            .fold(0.0, f64::max)
    }

    fn concrete_blocks() -> Result<Tensor> {
        let data = vec![0.0, 1.0, -1.0, 0.0, 0.0, 1.0, -1.0, 0.0];
        Ok(Tensor::from_vec(data, (2, 2, 2), &Device::Cpu)?)
    }

    #[test]
    fn test_zero_multiplier_is_identity() -> Result<()> {
        let blocks = random_blocks(7, 4, 8, 0.5)?;
        let r = compute_rotation(&blocks, 0.1, 32, 0.0)?.to_vec2::<f64>()?;
        assert!(max_diff(&r, &identity(32)) < 1e-12);
        Ok(())
    }

    #[test]
    fn test_unit_multiplier_is_pure_cayley() -> Result<()> {
        let blocks = random_blocks(11, 4, 8, 0.5)?;
        let q = constrained_generator(&blocks, 0.01, 32)?;
        let raw = cayley_blocks(&q)?.to_vec3::<f64>()?;

        let r = compute_rotation(&blocks, 0.01, 32, 1.0)?.to_vec2::<f64>()?;
        for (b, block) in raw.iter().enumerate() {
            for i in 0..8 {
                for j in 0..32 {
                    let expected = if j / 8 == b { block[i][j % 8] } else { 0.0 };
                    assert_eq!(r[b * 8 + i][j], expected);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_norm_clamp_bound() -> Result<()> {
        for (seed, alpha) in [(1u64, 0.001), (2, 0.01), (3, 0.1), (4, 10.0)] {
            let blocks = random_blocks(seed, 4, 8, 3.0)?;
            let q = constrained_generator(&blocks, alpha, 32)?;
            let norm = q.sqr()?.sum_all()?.sqrt()?.to_scalar::<f64>()?;
            assert!(norm <= alpha * 32.0 + 1e-6, "norm {} alpha {}", norm, alpha);
        }
        Ok(())
    }

    #[test]
    fn test_generator_is_antisymmetric() -> Result<()> {
        let blocks = random_blocks(5, 3, 4, 1.0)?;
        let q = constrained_generator(&blocks, 1.0, 12)?;
        let sum = (&q + q.transpose(1, 2)?)?.abs()?.max_all()?.to_scalar::<f64>()?;
        assert!(sum < 1e-12);
        Ok(())
    }

    #[test]
    fn test_cayley_blocks_are_orthogonal() -> Result<()> {
        for seed in 0..5u64 {
            let blocks = random_blocks(seed, 4, 8, 2.0)?.to_dtype(DType::F32)?;
            let q = constrained_generator(&blocks, 0.05, 32)?;
            let r = cayley_blocks(&q)?;
            let rrt = r.matmul(&r.transpose(1, 2)?.contiguous()?)?;
            let eye = Tensor::from_vec(
                identity(8).concat().iter().map(|v| *v as f32).collect::<Vec<_>>(),
                (1, 8, 8),
                &Device::Cpu,
            )?;
            let dev = rrt
                .broadcast_sub(&eye)?
                .abs()?
                .max_all()?
                .to_scalar::<f32>()?;
            assert!(dev < 1e-4, "seed {} deviation {}", seed, dev);
        }
        Ok(())
    }

    #[test]
    fn test_zero_adapter_is_identity() -> Result<()> {
        let blocks = Tensor::zeros((4, 8, 8), DType::F64, &Device::Cpu)?;
        for alpha in [0.0, 1e-3, 1.0, 100.0] {
            for multiplier in [0.0, 0.3, 1.0, 2.5] {
                let r = compute_rotation(&blocks, alpha, 32, multiplier)?.to_vec2::<f64>()?;
                assert!(max_diff(&r, &identity(32)) < 1e-12);
            }
        }
        Ok(())
    }

    #[test]
    fn test_output_shapes() -> Result<()> {
        let blocks = random_blocks(3, 4, 8, 0.1)?;
        let r = compute_rotation(&blocks, 0.1, 32, 0.8)?;
        assert_eq!(r.dims(), &[32, 32]);

        let base = Tensor::ones((32, 16), DType::F64, &Device::Cpu)?;
        let merged = merge_into_weight(&base, &r)?;
        assert_eq!(merged.dims(), &[32, 16]);
        Ok(())
    }

    #[test]
    fn test_concrete_two_block_rotation() -> Result<()> {
        // Each skew block is [[0, 2], [-2, 0]]; the stacked norm is exactly 4,
        // which equals alpha * out_dim, so the rescale leaves it unchanged.
        let r = compute_rotation(&concrete_blocks()?, 1.0, 4, 1.0)?.to_vec2::<f64>()?;
        let expected = vec![
            vec![-0.6, 0.8, 0.0, 0.0],
            vec![-0.8, -0.6, 0.0, 0.0],
            vec![0.0, 0.0, -0.6, 0.8],
            vec![0.0, 0.0, -0.8, -0.6],
        ];
        assert!(max_diff(&r, &expected) < 1e-6);

        let rt: Vec<Vec<f64>> = (0..4).map(|i| (0..4).map(|j| r[j][i]).collect()).collect();
        let rrt: Vec<Vec<f64>> = (0..4)
            .map(|i| (0..4).map(|j| (0..4).map(|k| r[i][k] * rt[k][j]).sum()).collect())
            .collect();
        assert!(max_diff(&rrt, &identity(4)) < 1e-6);
        Ok(())
    }

    #[test]
    fn test_concrete_rotation_with_active_clamp() -> Result<()> {
        // alpha 0.5 halves the stacked norm, leaving [[0, 1], [-1, 0]] per block
        let r = compute_rotation(&concrete_blocks()?, 0.5, 4, 1.0)?.to_vec2::<f64>()?;
        let expected = vec![
            vec![0.0, 1.0, 0.0, 0.0],
            vec![-1.0, 0.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 1.0],
            vec![0.0, 0.0, -1.0, 0.0],
        ];
        assert!(max_diff(&r, &expected) < 1e-6);
        Ok(())
    }

    #[test]
    fn test_singular_denominator_is_numerical_error() -> Result<()> {
        // Not skew-symmetric: Q = I makes (I - Q) singular in block 1
        let q = Tensor::from_vec(
            vec![0.0, 0.5, -0.5, 0.0, 1.0, 0.0, 0.0, 1.0],
            (2, 2, 2),
            &Device::Cpu,
        )?;
        match cayley_blocks(&q) {
            Err(NetworkError::Numerical { block, .. }) => assert_eq!(block, 1),
            other => panic!("expected numerical error, got {:?}", other.map(|t| t.dims().to_vec())),
        }
        Ok(())
    }

    #[test]
    fn test_non_finite_generator_is_rejected() -> Result<()> {
        let blocks = Tensor::from_vec(
            vec![0.0, f64::INFINITY, 0.0, 0.0],
            (1, 2, 2),
            &Device::Cpu,
        )?;
        assert!(matches!(
            compute_rotation(&blocks, 1.0, 2, 1.0),
            Err(NetworkError::Configuration(_))
        ));
        assert!(matches!(
            compute_rotation(&concrete_blocks()?, f64::NAN, 4, 1.0),
            Err(NetworkError::Configuration(_))
        ));
        Ok(())
    }

    #[test]
    fn test_multiplier_is_not_clamped() -> Result<()> {
        let blocks = concrete_blocks()?;
        let full = compute_rotation(&blocks, 1.0, 4, 1.0)?.to_vec2::<f64>()?;
        let eye = identity(4);
        for m in [2.0, -0.5, 1.5] {
            let r = compute_rotation(&blocks, 1.0, 4, m)?.to_vec2::<f64>()?;
            let expected: Vec<Vec<f64>> = full
                .iter()
                .zip(&eye)
                .map(|(rf, re)| rf.iter().zip(re).map(|(f, e)| m * f + (1.0 - m) * e).collect())
                .collect();
            assert!(max_diff(&r, &expected) < 1e-12, "multiplier {}", m);
        }
        Ok(())
    }

    #[test]
    fn test_merge_is_elementwise_add_not_matmul() -> Result<()> {
        let r = compute_rotation(&concrete_blocks()?, 1.0, 4, 1.0)?;
        let base = Tensor::from_vec((0..16).map(|v| v as f64).collect::<Vec<_>>(), (4, 4), &Device::Cpu)?;

        let merged = merge_into_weight(&base, &r)?.to_vec2::<f64>()?;
        let added = (&base + &r)?.to_vec2::<f64>()?;
        let multiplied = r.matmul(&base)?.to_vec2::<f64>()?;
        assert_eq!(merged, added);
        assert!(max_diff(&merged, &multiplied) > 1.0);
        Ok(())
    }

    #[test]
    fn test_merge_pads_wide_weights() -> Result<()> {
        let r = compute_rotation(&concrete_blocks()?, 1.0, 4, 1.0)?;
        let base = Tensor::zeros((4, 6), DType::F64, &Device::Cpu)?;
        let merged = merge_into_weight(&base, &r)?.to_vec2::<f64>()?;
        let rot = r.to_vec2::<f64>()?;
        for i in 0..4 {
            assert_eq!(&merged[i][..4], &rot[i][..]);
            assert_eq!(&merged[i][4..], &[0.0, 0.0]);
        }
        Ok(())
    }

    #[test]
    fn test_merge_shape_errors() -> Result<()> {
        let r = compute_rotation(&concrete_blocks()?, 1.0, 4, 1.0)?;

        let wrong_rows = Tensor::zeros((8, 4), DType::F64, &Device::Cpu)?;
        match merge_into_weight(&wrong_rows, &r) {
            Err(NetworkError::Shape { expected, actual, .. }) => {
                assert_eq!(expected, vec![8, 8]);
                assert_eq!(actual, vec![4, 4]);
            }
            other => panic!("expected shape error, got {:?}", other.map(|t| t.dims().to_vec())),
        }

        let base = Tensor::zeros((4, 4), DType::F64, &Device::Cpu)?;
        let non_square = Tensor::zeros((4, 3), DType::F64, &Device::Cpu)?;
        assert!(matches!(
            merge_into_weight(&base, &non_square),
            Err(NetworkError::Shape { .. })
        ));

        let conv = Tensor::zeros((4, 2, 3, 3), DType::F64, &Device::Cpu)?;
        assert!(matches!(merge_into_weight(&conv, &r), Err(NetworkError::Shape { .. })));
        Ok(())
    }

    #[test]
    fn test_block_layout_errors() -> Result<()> {
        let blocks = random_blocks(9, 3, 2, 1.0)?;
        assert!(matches!(
            compute_rotation(&blocks, 1.0, 8, 1.0),
            Err(NetworkError::Shape { .. })
        ));

        let non_square = Tensor::zeros((2, 2, 3), DType::F64, &Device::Cpu)?;
        assert!(matches!(
            compute_rotation(&non_square, 1.0, 4, 1.0),
            Err(NetworkError::Shape { .. })
        ));
        Ok(())
    }

    fn weights(alpha: Option<f64>) -> Result<NetworkWeights> {
        let mut w = HashMap::new();
        w.insert("oft_blocks".to_string(), concrete_blocks()?);
        if let Some(alpha) = alpha {
            w.insert("alpha".to_string(), Tensor::new(alpha, &Device::Cpu)?);
        }
        Ok(NetworkWeights::new("lora_unet_test", w))
    }

    #[test]
    fn test_module_matches_free_functions() -> Result<()> {
        let layer = LayerInfo::Linear { out_features: 4, in_features: 4 };
        let module = OftModule::new(&weights(Some(1.0))?, &layer)?;
        assert_eq!(module.num_blocks(), 2);
        assert_eq!(module.block_size(), 2);
        assert_eq!(module.constraint(), 4.0);

        let expected = compute_rotation(&concrete_blocks()?, 1.0, 4, 0.7)?.to_vec2::<f64>()?;
        assert_eq!(module.get_weight(0.7)?.to_vec2::<f64>()?, expected);

        let base = Tensor::ones((4, 4), DType::F64, &Device::Cpu)?;
        let updown = module.calc_updown(&base, 0.7)?;
        let direct = merge_into_weight(&base, &module.get_weight(0.7)?)?;
        assert_eq!(updown.to_vec2::<f64>()?, direct.to_vec2::<f64>()?);
        Ok(())
    }

    #[test]
    fn test_module_conv_weight_keeps_shape() -> Result<()> {
        let layer = LayerInfo::Conv { out_channels: 4, in_channels: 2, kernel: (3, 3) };
        let module = OftModule::new(&weights(Some(0.5))?, &layer)?;
        let base = Tensor::zeros((4, 2, 3, 3), DType::F32, &Device::Cpu)?;
        let merged = module.calc_updown(&base, 1.0)?;
        assert_eq!(merged.dims(), &[4, 2, 3, 3]);
        assert_eq!(merged.dtype(), DType::F32);

        // First kernel row picks up the first rotation columns
        let flat = merged.reshape((4, 18))?.to_vec2::<f32>()?;
        assert!((flat[0][1] - 1.0).abs() < 1e-6);
        assert!((flat[1][0] + 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_module_rejects_bad_alpha() -> Result<()> {
        let layer = LayerInfo::Linear { out_features: 4, in_features: 4 };
        assert!(matches!(
            OftModule::new(&weights(None)?, &layer),
            Err(NetworkError::Configuration(_))
        ));
        assert!(matches!(
            OftModule::new(&weights(Some(-1.0))?, &layer),
            Err(NetworkError::Configuration(_))
        ));
        assert!(matches!(
            OftModule::new(&weights(Some(0.0))?, &layer),
            Err(NetworkError::Configuration(_))
        ));
        Ok(())
    }

    #[test]
    fn test_module_rejects_mismatched_layer() -> Result<()> {
        let layer = LayerInfo::Linear { out_features: 6, in_features: 4 };
        assert!(matches!(
            OftModule::new(&weights(Some(1.0))?, &layer),
            Err(NetworkError::Shape { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_concurrent_calls_agree() -> Result<()> {
        let blocks = random_blocks(21, 4, 8, 0.3)?;
        let reference = compute_rotation(&blocks, 0.05, 32, 0.6)?.to_vec2::<f64>()?;
        let results = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| -> Result<Vec<Vec<f64>>> {
                        Ok(compute_rotation(&blocks, 0.05, 32, 0.6)?.to_vec2::<f64>()?)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("worker panicked"))
                .collect::<Result<Vec<_>>>()
        })?;
        for r in results {
            assert_eq!(r, reference);
        }
        Ok(())
    }
}

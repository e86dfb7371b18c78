//! Entity/relation composition operators.
//!
//! A composition operator `phi(e, r)` fuses an entity embedding with a
//! relation embedding into a single message vector. All operators take
//! `(M, d)` inputs; the relation side may also be a single `(1, d)` row
//! that is broadcast over every entity row (the self-loop case).
//!
//! | Operator | Formula | Origin |
//! |----------|---------|--------|
//! | `sub` | `e - r` | TransE |
//! | `mult` | `e * r` | DistMult |
//! | `corr` | `c[k] = sum_i e[i] r[(i + k) mod d]` | HolE |
//! | `rotate` | complex product of `(re, im)` halves | RotatE |
//!
//! # Reference
//!
//! Vashishth et al., "Composition-based Multi-Relational Graph Convolutional
//! Networks", ICLR 2020.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor, D};

use crate::error::{Error, Result};

/// Composition operator, fixed per model instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Composition {
    /// `e - r`
    Subtract,
    /// `e * r` (element-wise)
    Multiply,
    /// Circular correlation of `e` and `r`.
    CircularCorrelation,
    /// Complex rotation; first half of each vector is the real part.
    Rotate,
}

impl Composition {
    /// Canonical short name, as accepted by [`FromStr`].
    pub fn name(&self) -> &'static str {
        match self {
            Composition::Subtract => "sub",
            Composition::Multiply => "mult",
            Composition::CircularCorrelation => "corr",
            Composition::Rotate => "rotate",
        }
    }

    /// Apply the operator.
    ///
    /// `corr` builds its DFT tables on every call; layers that compose
    /// repeatedly hold a [`Composer`] instead.
    ///
    /// # Arguments
    /// - `ent`: entity embeddings (M x d)
    /// - `rel`: relation embeddings (M x d) or a single broadcast row (1 x d)
    ///
    /// # Returns
    /// - Composed messages (M x d)
    pub fn compose(&self, ent: &Tensor, rel: &Tensor) -> Result<Tensor> {
        let out = match self {
            Composition::Subtract => ent.broadcast_sub(rel)?,
            Composition::Multiply => ent.broadcast_mul(rel)?,
            Composition::CircularCorrelation => {
                DftBasis::new(ent.dim(D::Minus1)?, ent.device(), ent.dtype())?
                    .correlate(ent, rel)?
            }
            Composition::Rotate => rotate(ent, rel)?,
        };
        Ok(out)
    }
}

impl fmt::Display for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Composition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sub" | "subtract" => Ok(Composition::Subtract),
            "mult" | "multiply" => Ok(Composition::Multiply),
            "corr" | "ccorr" | "circular-correlation" => Ok(Composition::CircularCorrelation),
            "rotate" => Ok(Composition::Rotate),
            _ => Err(Error::UnsupportedOperator(s.to_string())),
        }
    }
}

/// Real DFT basis for one embedding width.
///
/// Holds `cos(2 pi j k / d)` and `sin(2 pi j k / d)` as (d x d) tables, so
/// circular correlation runs as six matmuls and its memory grows with
/// `M * d` rather than `M * d * d`.
#[derive(Debug, Clone)]
pub struct DftBasis {
    cos: Tensor,
    sin: Tensor,
    dim: usize,
}

impl DftBasis {
    pub fn new(dim: usize, device: &Device, dtype: DType) -> Result<Self> {
        let mut cos = Vec::with_capacity(dim * dim);
        let mut sin = Vec::with_capacity(dim * dim);
        for j in 0..dim {
            for k in 0..dim {
                let theta = std::f64::consts::TAU * ((j * k) % dim) as f64 / dim as f64;
                cos.push(theta.cos());
                sin.push(theta.sin());
            }
        }
        Ok(Self {
            cos: Tensor::from_vec(cos, (dim, dim), device)?.to_dtype(dtype)?,
            sin: Tensor::from_vec(sin, (dim, dim), device)?.to_dtype(dtype)?,
            dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `c[k] = sum_i e[i] r[(i + k) mod d]`, computed as
    /// `Re(ifft(conj(fft(e)) * fft(r)))`.
    pub fn correlate(&self, ent: &Tensor, rel: &Tensor) -> Result<Tensor> {
        for width in [ent.dim(D::Minus1)?, rel.dim(D::Minus1)?] {
            if width != self.dim {
                return Err(Error::DimensionMismatch {
                    expected: self.dim,
                    got: width,
                });
            }
        }

        // fft(x) = x C - i x S
        let e_cos = ent.broadcast_matmul(&self.cos)?;
        let e_sin = ent.broadcast_matmul(&self.sin)?;
        let r_cos = rel.broadcast_matmul(&self.cos)?;
        let r_sin = rel.broadcast_matmul(&self.sin)?;

        let re = e_cos
            .broadcast_mul(&r_cos)?
            .add(&e_sin.broadcast_mul(&r_sin)?)?;
        let im = e_sin
            .broadcast_mul(&r_cos)?
            .sub(&e_cos.broadcast_mul(&r_sin)?)?;

        let out = re
            .broadcast_matmul(&self.cos)?
            .sub(&im.broadcast_matmul(&self.sin)?)?;
        Ok(out.affine(1.0 / self.dim as f64, 0.0)?)
    }
}

/// A composition operator with its width-dependent tables prepared once.
#[derive(Debug, Clone)]
pub struct Composer {
    op: Composition,
    basis: Option<DftBasis>,
}

impl Composer {
    pub fn new(op: Composition, dim: usize, device: &Device, dtype: DType) -> Result<Self> {
        let basis = match op {
            Composition::CircularCorrelation => Some(DftBasis::new(dim, device, dtype)?),
            _ => None,
        };
        Ok(Self { op, basis })
    }

    pub fn op(&self) -> Composition {
        self.op
    }

    /// Same contract as [`Composition::compose`].
    pub fn compose(&self, ent: &Tensor, rel: &Tensor) -> Result<Tensor> {
        match &self.basis {
            Some(basis) => basis.correlate(ent, rel),
            None => self.op.compose(ent, rel),
        }
    }
}

/// Complex product `(h_re + i h_im)(r_re + i r_im)` on split halves.
fn rotate(ent: &Tensor, rel: &Tensor) -> Result<Tensor> {
    let d = ent.dim(D::Minus1)?;
    if d % 2 != 0 {
        return Err(Error::OddDimension(d));
    }
    let half = d / 2;

    let h_re = ent.narrow(D::Minus1, 0, half)?;
    let h_im = ent.narrow(D::Minus1, half, half)?;
    let r_re = rel.narrow(D::Minus1, 0, half)?;
    let r_im = rel.narrow(D::Minus1, half, half)?;

    let re = h_re.broadcast_mul(&r_re)?.sub(&h_im.broadcast_mul(&r_im)?)?;
    let im = h_re.broadcast_mul(&r_im)?.add(&h_im.broadcast_mul(&r_re)?)?;
    Ok(Tensor::cat(&[&re, &im], D::Minus1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustfft::num_complex::Complex;
    use rustfft::FftPlanner;

    const ALL: [Composition; 4] = [
        Composition::Subtract,
        Composition::Multiply,
        Composition::CircularCorrelation,
        Composition::Rotate,
    ];

    fn rows(t: &Tensor) -> Vec<Vec<f32>> {
        t.to_vec2::<f32>().unwrap()
    }

    #[test]
    fn test_output_shape_matches_input() {
        let device = Device::Cpu;
        let e = Tensor::randn(0f32, 1f32, (5, 8), &device).unwrap();
        let r = Tensor::randn(0f32, 1f32, (5, 8), &device).unwrap();

        for op in ALL {
            let out = op.compose(&e, &r).unwrap();
            assert_eq!(out.dims(), &[5, 8], "{op}");
        }
    }

    #[test]
    fn test_broadcast_single_relation_row() {
        let device = Device::Cpu;
        let e = Tensor::randn(0f32, 1f32, (4, 6), &device).unwrap();
        let r = Tensor::randn(0f32, 1f32, (1, 6), &device).unwrap();

        for op in ALL {
            let out = op.compose(&e, &r).unwrap();
            assert_eq!(out.dims(), &[4, 6], "{op}");
        }
    }

    #[test]
    fn test_sub_and_mult_with_zero_relation() {
        let device = Device::Cpu;
        let e = Tensor::randn(0f32, 1f32, (3, 4), &device).unwrap();
        let zero = Tensor::zeros((3, 4), DType::F32, &device).unwrap();

        let sub = Composition::Subtract.compose(&e, &zero).unwrap();
        assert_eq!(rows(&sub), rows(&e));

        let mult = Composition::Multiply.compose(&e, &zero).unwrap();
        for row in rows(&mult) {
            assert!(row.iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn test_rotate_zero_angle_is_identity() {
        let device = Device::Cpu;
        let e = Tensor::randn(0f32, 1f32, (3, 6), &device).unwrap();
        // cos 0 = 1 in the real half, sin 0 = 0 in the imaginary half
        let r = Tensor::new(&[[1f32, 1., 1., 0., 0., 0.]], &device).unwrap();

        let out = Composition::Rotate.compose(&e, &r).unwrap();
        for (a, b) in rows(&out).iter().flatten().zip(rows(&e).iter().flatten()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rotate_rejects_odd_dimension() {
        let device = Device::Cpu;
        let e = Tensor::zeros((2, 5), DType::F32, &device).unwrap();
        let err = Composition::Rotate.compose(&e, &e).unwrap_err();
        assert!(matches!(err, Error::OddDimension(5)));
    }

    #[test]
    fn test_corr_matches_frequency_domain() {
        let device = Device::Cpu;
        let a: Vec<f32> = vec![0.5, -1.0, 2.0, 0.25, 1.5, -0.75, 0.0, 3.0];
        let b: Vec<f32> = vec![1.0, 0.5, -0.5, 2.0, -1.0, 0.1, 0.7, -2.0];
        let n = a.len();

        let mut planner = FftPlanner::<f32>::new();
        let fwd = planner.plan_fft_forward(n);
        let inv = planner.plan_fft_inverse(n);

        let mut fa: Vec<Complex<f32>> = a.iter().map(|&x| Complex::new(x, 0.0)).collect();
        let mut fb: Vec<Complex<f32>> = b.iter().map(|&x| Complex::new(x, 0.0)).collect();
        fwd.process(&mut fa);
        fwd.process(&mut fb);
        let mut prod: Vec<Complex<f32>> = fa.iter().zip(&fb).map(|(x, y)| x.conj() * y).collect();
        inv.process(&mut prod);
        let expected: Vec<f32> = prod.iter().map(|c| c.re / n as f32).collect();

        let ea = Tensor::from_vec(a, (1, n), &device).unwrap();
        let eb = Tensor::from_vec(b, (1, n), &device).unwrap();
        let out = Composition::CircularCorrelation.compose(&ea, &eb).unwrap();

        for (got, want) in rows(&out)[0].iter().zip(&expected) {
            assert!((got - want).abs() < 1e-4, "{got} vs {want}");
        }
    }

    fn direct_correlation(e: &[f32], r: &[f32]) -> Vec<f32> {
        let d = e.len();
        (0..d)
            .map(|k| (0..d).map(|i| e[i] * r[(i + k) % d]).sum())
            .collect()
    }

    #[test]
    fn test_corr_wide_embeddings_many_rows() {
        let device = Device::Cpu;
        let (m, d) = (3000, 200);
        let e = Tensor::randn(0f32, 1f32, (m, d), &device).unwrap();
        let r = Tensor::randn(0f32, 1f32, (m, d), &device).unwrap();

        let composer = Composer::new(Composition::CircularCorrelation, d, &device, DType::F32).unwrap();
        let out = composer.compose(&e, &r).unwrap();
        assert_eq!(out.dims(), &[m, d]);

        let (es, rs, outs) = (rows(&e), rows(&r), rows(&out));
        for row in [0, 1234, m - 1] {
            let want = direct_correlation(&es[row], &rs[row]);
            for (got, want) in outs[row].iter().zip(&want) {
                assert!((got - want).abs() < 1e-2, "row {row}: {got} vs {want}");
            }
        }
    }

    #[test]
    fn test_corr_broadcast_row_matches_direct() {
        let device = Device::Cpu;
        let e = Tensor::randn(0f32, 1f32, (4, 10), &device).unwrap();
        let r = Tensor::randn(0f32, 1f32, (1, 10), &device).unwrap();

        let out = Composition::CircularCorrelation.compose(&e, &r).unwrap();
        let rs = rows(&r);
        for (row, got) in rows(&e).iter().zip(rows(&out)) {
            for (g, w) in got.iter().zip(direct_correlation(row, &rs[0])) {
                assert!((g - w).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_composer_rejects_other_width() {
        let device = Device::Cpu;
        let composer = Composer::new(Composition::CircularCorrelation, 8, &device, DType::F32).unwrap();
        let e = Tensor::zeros((2, 6), DType::F32, &device).unwrap();
        let err = composer.compose(&e, &e).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 8, got: 6 }));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("sub".parse::<Composition>().unwrap(), Composition::Subtract);
        assert_eq!("mult".parse::<Composition>().unwrap(), Composition::Multiply);
        assert_eq!(
            "corr".parse::<Composition>().unwrap(),
            Composition::CircularCorrelation
        );
        assert_eq!("RotatE".parse::<Composition>().unwrap(), Composition::Rotate);

        let err = "transh".parse::<Composition>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperator(ref s) if s == "transh"));
    }

    #[test]
    fn test_name_round_trips() {
        for op in ALL {
            assert_eq!(op.name().parse::<Composition>().unwrap(), op);
        }
    }
}

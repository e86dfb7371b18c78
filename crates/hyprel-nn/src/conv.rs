//! Composition-based convolution over hyper-relational edges.
//!
//! Each layer aggregates three edge groups with separate weight matrices:
//!
//! | Group | Weight | Normalized |
//! |-------|--------|------------|
//! | inward (forward edges, or qualifiers) | `W_in` | yes |
//! | outward (inverse edges, or qualifiers) | `W_out` | yes |
//! | self-loop | `W_loop` | no |
//!
//! ```text
//! h' = tanh(BN((drop(A_in) + drop(A_out) + A_loop) / 3))
//! A_g[v] = sum_{(v, u, r) in g} norm(v, u) * phi(h_u, z_r) W_g
//! z' = [z ; z_loop] W_rel          (self-loop row dropped from the output)
//! ```
//!
//! The propagation mode decides which edges form the inward and outward
//! groups and how messages are built; see [`crate::graph::plan_edges`].
//!
//! # References
//!
//! - Vashishth et al., "Composition-based Multi-Relational Graph Convolutional
//!   Networks", ICLR 2020.
//! - Galkin et al., "Message Passing for Hyper-Relational Knowledge Graphs",
//!   EMNLP 2020.

use candle_core::{ModuleT, Tensor, D};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, Dropout, Init, VarBuilder};

use crate::composition::{Composer, Composition};
use crate::error::{Error, Result};
use crate::graph::{GroupTensors, HyperRelGraph, MessageTensors, PooledTensors, Propagation};
use crate::norm::segment_sum;

/// Edge group a weight matrix applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeDirection {
    In,
    Out,
    Loop,
}

/// Hyperparameters shared by every layer of an encoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvConfig {
    pub composition: Composition,
    /// Dropout on the inward and outward aggregates.
    pub dropout: f32,
    /// Weight of the parent triple's relation under [`Propagation::Both`].
    pub alpha: f64,
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            composition: Composition::Multiply,
            dropout: 0.1,
            alpha: 0.8,
        }
    }
}

/// Replacement tables for the auxiliary qualifier-entity path.
///
/// Under [`Propagation::Both`], inward senders are read from `entities` and
/// the parent triple's relation from `relations`.
#[derive(Debug, Clone)]
pub struct AuxEmbeddings {
    /// Entity table (N x in_dim).
    pub entities: Tensor,
    /// Relation table indexed by forward relation id (>= R x in_dim).
    pub relations: Tensor,
}

/// Hyper-relational composition convolution.
pub struct HypRelConv {
    w_in: Tensor,
    w_out: Tensor,
    w_loop: Tensor,
    w_rel: Tensor,
    loop_rel: Tensor,
    phi: Composer,
    dropout: Dropout,
    bn: BatchNorm,
    config: ConvConfig,
    in_dim: usize,
    out_dim: usize,
}

impl HypRelConv {
    /// Create a new layer.
    ///
    /// # Arguments
    /// - `in_dim`: input embedding width
    /// - `out_dim`: output embedding width
    /// - `config`: composition operator, dropout and mixing coefficient
    /// - `vb`: variable builder for parameter initialization
    pub fn new(in_dim: usize, out_dim: usize, config: ConvConfig, vb: VarBuilder) -> Result<Self> {
        if config.composition == Composition::Rotate && in_dim % 2 != 0 {
            return Err(Error::OddDimension(in_dim));
        }

        // Xavier normal
        let xavier = Init::Randn {
            mean: 0.0,
            stdev: (2.0 / (in_dim + out_dim) as f64).sqrt(),
        };
        let w_in = vb.get_with_hints((in_dim, out_dim), "w_in", xavier)?;
        let w_out = vb.get_with_hints((in_dim, out_dim), "w_out", xavier)?;
        let w_loop = vb.get_with_hints((in_dim, out_dim), "w_loop", xavier)?;
        let w_rel = vb.get_with_hints((in_dim, out_dim), "w_rel", xavier)?;
        let loop_rel = vb.get_with_hints(
            (1, in_dim),
            "loop_rel",
            Init::Randn {
                mean: 0.0,
                stdev: (2.0 / (1 + in_dim) as f64).sqrt(),
            },
        )?;
        let bn = batch_norm(out_dim, BatchNormConfig::default(), vb.pp("bn"))?;
        let phi = Composer::new(config.composition, in_dim, vb.device(), vb.dtype())?;

        Ok(Self {
            w_in,
            w_out,
            w_loop,
            w_rel,
            loop_rel,
            phi,
            dropout: Dropout::new(config.dropout),
            bn,
            config,
            in_dim,
            out_dim,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    fn weight(&self, direction: EdgeDirection) -> &Tensor {
        match direction {
            EdgeDirection::In => &self.w_in,
            EdgeDirection::Out => &self.w_out,
            EdgeDirection::Loop => &self.w_loop,
        }
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// - `propagation`: which edges to aggregate over
    /// - `x`: entity embeddings (N x in_dim)
    /// - `graph`: static edge and qualifier arrays
    /// - `rel_embed`: relation embeddings (2R x in_dim)
    /// - `aux`: optional overrides for the auxiliary path
    /// - `train`: enables dropout and batch statistics
    ///
    /// # Returns
    /// - Entity embeddings (N x out_dim)
    /// - Relation embeddings (2R x out_dim)
    pub fn forward(
        &self,
        propagation: Propagation,
        x: &Tensor,
        graph: &HyperRelGraph,
        rel_embed: &Tensor,
        aux: Option<&AuxEmbeddings>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let n = x.dim(0)?;
        if n != graph.num_entities() {
            return Err(Error::DimensionMismatch {
                expected: graph.num_entities(),
                got: n,
            });
        }
        let num_rel_rows = rel_embed.dim(0)?;

        let rel_all = Tensor::cat(&[rel_embed, &self.loop_rel], 0)?;
        let plan = graph.plan_tensors(propagation, x.device())?;

        let in_agg = self.propagate(&plan.inward, EdgeDirection::In, x, &rel_all, aux)?;
        let out_agg = self.propagate(&plan.outward, EdgeDirection::Out, x, &rel_all, aux)?;
        let loop_rel = rel_all.narrow(0, num_rel_rows, 1)?;
        let loop_agg = self
            .phi
            .compose(x, &loop_rel)?
            .matmul(self.weight(EdgeDirection::Loop))?;

        let in_agg = self.dropout.forward(&in_agg, train)?;
        let out_agg = self.dropout.forward(&out_agg, train)?;
        let out = ((in_agg + out_agg)? + loop_agg)?.affine(1.0 / 3.0, 0.0)?;
        let out = self.bn.forward_t(&out, train)?.tanh()?;

        let rel_out = rel_all.matmul(&self.w_rel)?.narrow(0, 0, num_rel_rows)?;
        Ok((out, rel_out))
    }

    /// Message and aggregate pass over one edge group.
    fn propagate(
        &self,
        group: &GroupTensors,
        direction: EdgeDirection,
        x: &Tensor,
        rel_all: &Tensor,
        aux: Option<&AuxEmbeddings>,
    ) -> Result<Tensor> {
        let n = x.dim(0)?;
        if group.is_empty() {
            return Ok(Tensor::zeros((n, self.out_dim), x.dtype(), x.device())?);
        }

        let msg = match &group.message {
            MessageTensors::Direct => {
                let x_j = x.index_select(&group.tails, 0)?;
                self.phi.compose(&x_j, &rel_all.index_select(&group.relations, 0)?)?
            }
            MessageTensors::Pooled(pooled) => {
                pool_qualifiers(&self.phi, x, rel_all, pooled, group.len())?
            }
            MessageTensors::Interpolated { relations } => {
                let senders = match (direction, aux) {
                    (EdgeDirection::In, Some(aux)) => &aux.entities,
                    _ => x,
                };
                let x_j = senders.index_select(&group.tails, 0)?;
                let trip_table = aux.map(|a| &a.relations).unwrap_or(rel_all);
                let trip = self.phi.compose(&x_j, &trip_table.index_select(relations, 0)?)?;
                let qual = self
                    .phi
                    .compose(&x_j, &rel_all.index_select(&group.relations, 0)?)?;
                let alpha = self.config.alpha;
                (trip.affine(alpha, 0.0)? + qual.affine(1.0 - alpha, 0.0)?)?
            }
        };

        let msg = msg.matmul(self.weight(direction))?;
        let msg = msg.broadcast_mul(&group.norm.to_dtype(msg.dtype())?)?;
        segment_sum(&msg, &group.heads, n)
    }
}

/// Sum `phi(x[qv], rel[qr])` per parent triple.
///
/// Returns a (num_triples x d) tensor; triples without qualifiers get zero
/// rows.
pub fn pool_qualifiers(
    phi: &Composer,
    x: &Tensor,
    rel_all: &Tensor,
    pooled: &PooledTensors,
    num_triples: usize,
) -> Result<Tensor> {
    if pooled.is_empty() {
        let d = x.dim(D::Minus1)?;
        return Ok(Tensor::zeros((num_triples, d), x.dtype(), x.device())?);
    }

    let qe = x.index_select(&pooled.entities, 0)?;
    let msg = phi.compose(&qe, &rel_all.index_select(&pooled.relations, 0)?)?;
    segment_sum(&msg, &pooled.parents, num_triples)
}

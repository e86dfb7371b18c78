//! Stacked convolution layers over a shared graph.

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::conv::{AuxEmbeddings, ConvConfig, HypRelConv};
use crate::error::Result;
use crate::graph::{HyperRelGraph, Propagation};

/// N convolution layers applied in sequence, without skip connections.
pub struct HypRelEncoder {
    layers: Vec<HypRelConv>,
    graph: Arc<HyperRelGraph>,
}

impl HypRelEncoder {
    /// Create `num_layers` layers of width `dim`.
    ///
    /// Zero layers is allowed; the encoder then returns its inputs.
    pub fn new(
        graph: Arc<HyperRelGraph>,
        num_layers: usize,
        dim: usize,
        config: ConvConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let layers = (0..num_layers)
            .map(|i| HypRelConv::new(dim, dim, config, vb.pp(format!("layer{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers, graph })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn graph(&self) -> &HyperRelGraph {
        &self.graph
    }

    /// Run every layer with the same propagation mode.
    ///
    /// # Returns
    /// - Entity embeddings (N x dim)
    /// - Relation embeddings (2R x dim)
    pub fn forward(
        &self,
        propagation: Propagation,
        x: &Tensor,
        rel_embed: &Tensor,
        aux: Option<&AuxEmbeddings>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let mut x = x.clone();
        let mut r = rel_embed.clone();
        for layer in &self.layers {
            (x, r) = layer.forward(propagation, &x, &self.graph, &r, aux, train)?;
        }
        Ok((x, r))
    }
}

//! Message-passing layers for hyper-relational knowledge graphs.
//!
//! A hyper-relational fact is a triple with qualifier pairs attached:
//!
//! ```text
//! (Einstein, educated_at, ETH Zurich)
//!     academic_degree: BSc
//!     end_time:        1900
//! ```
//!
//! This crate holds the graph-side building blocks:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`composition`] | `phi(e, r)` operators: sub, mult, corr, rotate |
//! | [`norm`] | symmetric degree normalization, grouped sums |
//! | [`graph`] | forward/inverse edge and qualifier arrays, edge planning, cached device tensors |
//! | [`conv`] | [`HypRelConv`], one convolution layer |
//! | [`encoder`] | [`HypRelEncoder`], stacked layers sharing one graph |
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use hyprel_nn::{ConvConfig, HypRelEncoder, HyperRelGraph, Propagation, Statement};
//!
//! let graph = HyperRelGraph::from_statements(
//!     &[Statement::new(1, 1, 2).with_qualifier(2, 3)],
//!     4,
//!     3,
//! )?;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
//! let enc = HypRelEncoder::new(Arc::new(graph), 2, 32, ConvConfig::default(), vb)?;
//! let (x, r) = enc.forward(Propagation::Both, &x, &r, None, true)?;
//! ```

pub mod composition;
pub mod conv;
pub mod encoder;
pub mod error;
pub mod graph;
pub mod norm;

pub use composition::{Composer, Composition, DftBasis};
pub use conv::{pool_qualifiers, AuxEmbeddings, ConvConfig, EdgeDirection, HypRelConv};
pub use encoder::HypRelEncoder;
pub use error::{Error, Result};
pub use graph::{
    plan_edges, EdgeGroup, EdgePlan, GroupTensors, HyperRelGraph, Message, MessageTensors,
    PlanTensors, PooledTensors, Propagation, Statement,
};
pub use norm::{segment_sum, symmetric_norm};

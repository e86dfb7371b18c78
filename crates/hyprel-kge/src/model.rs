//! Encoder/decoder model for hyper-relational link prediction.
//!
//! ```text
//!              entities, relations
//!                      |
//!            triple encoder ("triple")
//!                      |
//!       +--------------+---------------+
//!       | sequential                   | parallel
//!       v                              v
//!  qualifier encoder        qualifier encoder on the initial
//!  on the triple output     entities, then [x_trip ; x_qual] W
//!                           -> dropout -> layer norm
//!       |                              |
//!       +--------------+---------------+
//!                      v
//!            transformer decoder -> sigmoid score per entity
//! ```
//!
//! With `ONLY-TRIPS` the qualifier encoder is skipped entirely.

use std::f64::consts::PI;
use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{layer_norm, Dropout, Init, LayerNorm, VarBuilder};
use hyprel_nn::{Composition, HypRelEncoder, HyperRelGraph, Propagation};
use tracing::debug;

use crate::config::ModelConfig;
use crate::decoder::{split_qualifier_ids, DecoderInput, TransformerDecoder};
use crate::error::{Error, Result};
use crate::sampler::Batch;

/// Anything the training loop can optimize and the evaluator can rank with.
pub trait LinkPredictor {
    /// Scalar training loss for one batch.
    fn batch_loss(&self, batch: &Batch, train: bool) -> Result<Tensor>;

    /// Row-major tail scores (rows x num_entities) in evaluation mode.
    fn predict(&self, batch: &Batch) -> Result<Vec<f32>>;
}

/// Decoder outputs for the main and auxiliary batches.
#[derive(Debug, Clone)]
pub struct Predictions {
    /// Tail scores (B x N).
    pub objects: Tensor,
    /// Qualifier-entity scores (B_aux x N).
    pub aux: Option<Tensor>,
}

/// Binary cross-entropy against a multi-hot target.
pub fn bce_loss(pred: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let p = pred.clamp(1e-7, 1.0 - 1e-7)?;
    let pos = labels.mul(&p.log()?)?;
    let neg = labels.affine(-1.0, 1.0)?.mul(&p.affine(-1.0, 1.0)?.log()?)?;
    Ok((pos + neg)?.mean_all()?.neg()?)
}

enum RelationTable {
    /// Forward and inverse rows (2R x d).
    Dense(Tensor),
    /// Phases (R x d/2); rows are `[cos, sin]`, inverse rows the conjugate.
    Rotation(Tensor),
}

impl RelationTable {
    fn materialize(&self) -> Result<Tensor> {
        match self {
            RelationTable::Dense(t) => Ok(t.clone()),
            RelationTable::Rotation(phases) => {
                let (re, im) = (phases.cos()?, phases.sin()?);
                let forward = Tensor::cat(&[&re, &im], 1)?;
                let inverse = Tensor::cat(&[&re, &im.neg()?], 1)?;
                Ok(Tensor::cat(&[&forward, &inverse], 0)?)
            }
        }
    }
}

struct ParallelFusion {
    matrix: Tensor,
    dropout: Dropout,
    norm: LayerNorm,
}

impl ParallelFusion {
    fn new(d: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let matrix = vb.get_with_hints(
            (2 * d, d),
            "matrix",
            Init::Randn {
                mean: 0.0,
                stdev: (2.0 / (3 * d) as f64).sqrt(),
            },
        )?;
        Ok(Self {
            matrix,
            dropout: Dropout::new(dropout),
            norm: layer_norm(d, 1e-5, vb.pp("norm"))?,
        })
    }

    fn forward(&self, trip: &Tensor, qual: &Tensor, train: bool) -> Result<Tensor> {
        let x = Tensor::cat(&[trip, qual], 1)?.matmul(&self.matrix)?;
        let x = self.dropout.forward(&x, train)?;
        Ok(self.norm.forward(&x)?)
    }
}

/// Hyper-relational encoder/decoder model.
pub struct HypRelModel {
    config: ModelConfig,
    entities: Tensor,
    relations: RelationTable,
    trip_encoder: HypRelEncoder,
    qual_encoder: HypRelEncoder,
    fusion: Option<ParallelFusion>,
    decoder: TransformerDecoder,
    device: Device,
}

impl HypRelModel {
    pub fn new(config: ModelConfig, graph: Arc<HyperRelGraph>, vb: VarBuilder) -> Result<Self> {
        if graph.num_entities() != config.num_entities {
            return Err(Error::Config(format!(
                "graph has {} entities, config declares {}",
                graph.num_entities(),
                config.num_entities
            )));
        }
        if graph.num_relations() != config.num_relations {
            return Err(Error::Config(format!(
                "graph has {} relations, config declares {}",
                graph.num_relations(),
                config.num_relations
            )));
        }

        let (n, r, d) = (config.num_entities, config.num_relations, config.embedding_dim);
        let entities = vb.get_with_hints(
            (n, d),
            "entities",
            Init::Randn {
                mean: 0.0,
                stdev: (2.0 / (n + d) as f64).sqrt(),
            },
        )?;
        let relations = match config.composition {
            Composition::Rotate => RelationTable::Rotation(vb.get_with_hints(
                (r, d / 2),
                "rotation_phases",
                Init::Uniform { lo: -PI, up: PI },
            )?),
            _ => RelationTable::Dense(vb.get_with_hints(
                (2 * r, d),
                "relations",
                Init::Randn {
                    mean: 0.0,
                    stdev: (2.0 / (2 * r + d) as f64).sqrt(),
                },
            )?),
        };

        let conv = config.conv();
        let trip_encoder =
            HypRelEncoder::new(graph.clone(), config.trip_layers, d, conv, vb.pp("trip_encoder"))?;
        let qual_encoder =
            HypRelEncoder::new(graph, config.qual_layers, d, conv, vb.pp("qual_encoder"))?;
        let fusion = if config.parallel && !config.only_trips {
            Some(ParallelFusion::new(d, config.parallel_dropout, vb.pp("parallel"))?)
        } else {
            None
        };
        let decoder = TransformerDecoder::new(config.decoder.clone(), vb.pp("decoder"))?;

        debug!(
            entities = n,
            relations = r,
            dim = d,
            composition = %config.composition,
            parallel = fusion.is_some(),
            only_trips = config.only_trips,
            "built hyper-relational model"
        );

        Ok(Self {
            config,
            entities,
            relations,
            trip_encoder,
            qual_encoder,
            fusion,
            decoder,
            device: vb.device().clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Run the encoders over the whole graph.
    ///
    /// # Returns
    /// - Entity embeddings (N x d)
    /// - Relation embeddings (2R x d)
    pub fn encode(&self, train: bool) -> Result<(Tensor, Tensor)> {
        let rel = self.relations.materialize()?;
        let (x1, r1) = self
            .trip_encoder
            .forward(Propagation::Triple, &self.entities, &rel, None, train)?;
        if self.config.only_trips {
            return Ok((x1, r1));
        }

        let prop = self.config.qual_propagation;
        let out = match &self.fusion {
            Some(fusion) => {
                let (xq, rq) = self
                    .qual_encoder
                    .forward(prop, &self.entities, &r1, None, train)?;
                (fusion.forward(&x1, &xq, train)?, rq)
            }
            None => self.qual_encoder.forward(prop, &x1, &r1, None, train)?,
        };
        Ok(out)
    }

    /// Score every entity for the main batch and, if present, its auxiliary batch.
    pub fn forward(&self, batch: &Batch, train: bool) -> Result<Predictions> {
        let (x, r) = self.encode(train)?;

        let b = batch.len();
        let subjects = Tensor::from_vec(batch.subjects(), b, &self.device)?;
        let relations = Tensor::from_vec(batch.relations(), b, &self.device)?;
        let objects = self.decode(&x, &r, &subjects, &relations, batch.qualifiers(), b, None, train)?;

        let aux = match &batch.aux {
            Some(aux) if !aux.is_empty() => {
                let m = aux.len();
                let p = aux.mask.len() / m;
                let subjects = Tensor::from_slice(&aux.subjects, m, &self.device)?;
                let relations = Tensor::from_slice(&aux.relations, m, &self.device)?;
                let tails = Tensor::from_slice(&aux.objects, m, &self.device)?;
                let tails = x.index_select(&tails, 0)?;
                let mask = Tensor::from_slice(&aux.mask, (m, p), &self.device)?.to_dtype(x.dtype())?;
                Some(self.decode(
                    &x,
                    &r,
                    &subjects,
                    &relations,
                    aux.qualifiers.clone(),
                    m,
                    Some((&tails, &mask)),
                    train,
                )?)
            }
            _ => None,
        };

        Ok(Predictions { objects, aux })
    }

    #[allow(clippy::too_many_arguments)]
    fn decode(
        &self,
        x: &Tensor,
        r: &Tensor,
        subjects: &Tensor,
        relations: &Tensor,
        qual_ids: Vec<u32>,
        b: usize,
        aux: Option<(&Tensor, &Tensor)>,
        train: bool,
    ) -> Result<Tensor> {
        let d = self.config.embedding_dim;
        let p = if b == 0 { 0 } else { qual_ids.len() / (2 * b).max(1) };

        let s_emb = x.index_select(subjects, 0)?;
        let r_emb = r.index_select(relations, 0)?;
        let (qr_ids, qe_ids) = split_qualifier_ids(&qual_ids, b, &self.device)?;
        let (qe_emb, qr_emb) = if p > 0 {
            (
                x.index_select(&qe_ids, 0)?.reshape((b, p, d))?,
                r.index_select(&qr_ids, 0)?.reshape((b, p, d))?,
            )
        } else {
            let empty = Tensor::zeros((b, 0, d), x.dtype(), &self.device)?;
            (empty.clone(), empty)
        };
        let qual_ids = Tensor::from_vec(qual_ids, (b, 2 * p), &self.device)?;

        let input = DecoderInput {
            subjects: &s_emb,
            relations: &r_emb,
            qual_entities: &qe_emb,
            qual_relations: &qr_emb,
            qual_ids: &qual_ids,
            tails: aux.map(|a| a.0),
            aux_mask: aux.map(|a| a.1),
        };
        self.decoder.forward(&input, x, train)
    }

    fn labels(&self, labels: &[f32], rows: usize, dtype: DType) -> Result<Tensor> {
        let n = self.config.num_entities;
        if labels.len() != rows * n {
            return Err(Error::Validation(format!(
                "expected {} label values for {rows} rows, got {}",
                rows * n,
                labels.len()
            )));
        }
        Ok(Tensor::from_slice(labels, (rows, n), &self.device)?.to_dtype(dtype)?)
    }
}

impl LinkPredictor for HypRelModel {
    fn batch_loss(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        let preds = self.forward(batch, train)?;
        let labels = self.labels(&batch.labels, batch.len(), preds.objects.dtype())?;
        let mut loss = bce_loss(&preds.objects, &labels)?;

        if let (Some(aux_pred), Some(aux)) = (&preds.aux, &batch.aux) {
            let aux_labels = self.labels(&aux.labels, aux.len(), aux_pred.dtype())?;
            loss = (loss + bce_loss(aux_pred, &aux_labels)?)?;
        }
        Ok(loss)
    }

    fn predict(&self, batch: &Batch) -> Result<Vec<f32>> {
        let preds = self.forward(batch, false)?;
        Ok(preds.objects.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
    }
}

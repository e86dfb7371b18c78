//! Link prediction over hyper-relational knowledge graphs.
//!
//! Builds on the message-passing layers of [`hyprel_nn`]:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`config`] | JSON run configuration and validation |
//! | [`data`] | CSV statement loading, [`Vocabulary`] |
//! | [`init`] | [`SeededVarMap`], reproducible parameter initialization |
//! | [`sampler`] | grouped, shuffled tail-prediction batches |
//! | [`decoder`] | [`TransformerDecoder`] scoring head |
//! | [`model`] | [`HypRelModel`], sequential/parallel encoder fusion, BCE loss |
//! | [`evaluation`] | filtered ranking, MRR, MR, Hits@k |
//! | [`training`] | epoch loop, early stopping, LR schedulers |
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use candle_core::DType;
//! use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
//! use hyprel_kge::{load_statements, Config, HypRelModel, TailSampler, TrainingLoop, Vocabulary};
//! use hyprel_nn::HyperRelGraph;
//!
//! let mut vocab = Vocabulary::new();
//! let train = load_statements("train.csv", &mut vocab)?;
//! let config = Config::from_path("config.json")?
//!     .with_vocabulary_size(vocab.num_entities(), vocab.num_relations());
//!
//! let mc = config.model_config()?;
//! let graph = Arc::new(HyperRelGraph::from_statements(&train, mc.num_entities, mc.num_relations)?);
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &config.device()?);
//! let model = HypRelModel::new(mc, graph, vb)?;
//!
//! let mut opt = AdamW::new(varmap.all_vars(), ParamsAdamW::default())?;
//! let mut sampler = TailSampler::new(&train, vocab.num_entities(), vocab.num_relations(), config.sampler_config()?)?;
//! let history = TrainingLoop::new(config.training_config()?)
//!     .run(&model, &mut opt, &varmap.all_vars(), &mut sampler, || Ok(Default::default()))?;
//! ```

pub mod config;
pub mod data;
pub mod decoder;
pub mod error;
pub mod evaluation;
pub mod init;
pub mod model;
pub mod sampler;
pub mod training;

pub use config::{Config, ModelConfig, ModelSection, TrainingSection};
pub use data::{load_statements, parse_statements, DatasetStats, Vocabulary, PAD};
pub use decoder::{split_qualifier_ids, DecoderConfig, DecoderInput, TransformerDecoder};
pub use error::{Error, Result};
pub use evaluation::{filtered_rank, Evaluator, RankMetrics};
pub use init::SeededVarMap;
pub use model::{bce_loss, HypRelModel, LinkPredictor, Predictions};
pub use sampler::{AuxBatch, Batch, BatchSource, SamplerConfig, TailSampler};
pub use training::{
    clip_grad_norm, no_improvement, ExponentialLr, LrScheduler, StepLr, TrainingConfig,
    TrainingHistory, TrainingLoop,
};

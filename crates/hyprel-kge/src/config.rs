//! Run configuration.
//!
//! Configuration files are JSON with upper-case keys:
//!
//! ```json
//! {
//!   "EMBEDDING_DIM": 200,
//!   "PARALLEL": false,
//!   "MODEL": { "OPN": "rotate", "TRIP_LAYERS": 2, "QUAL_LAYERS": 2 },
//!   "TRAINING": { "EPOCHS": 400, "EVAL_EVERY": 5, "EARLY_STOPPING": 10 }
//! }
//! ```
//!
//! Missing keys take their defaults. [`Config::model_config`] validates the
//! file once and produces the immutable [`ModelConfig`] the model is built
//! from.

use std::path::Path;

use candle_core::Device;
use hyprel_nn::{Composition, ConvConfig, Propagation};
use serde::{Deserialize, Serialize};

use crate::decoder::DecoderConfig;
use crate::error::{Error, Result};
use crate::sampler::SamplerConfig;
use crate::training::TrainingConfig;

fn default_device() -> String {
    "cpu".to_string()
}

fn default_true() -> bool {
    true
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "PARALLEL", default)]
    pub parallel: bool,
    #[serde(rename = "DEVICE", default = "default_device")]
    pub device: String,
    /// Filled from the vocabulary when left at 0.
    #[serde(rename = "NUM_ENTITIES", default)]
    pub num_entities: usize,
    #[serde(rename = "NUM_RELATIONS", default)]
    pub num_relations: usize,
    #[serde(rename = "EMBEDDING_DIM", default = "Config::default_embedding_dim")]
    pub embedding_dim: usize,
    #[serde(rename = "ALPHA", default = "Config::default_alpha")]
    pub alpha: f64,
    #[serde(rename = "ONLY-TRIPS", default)]
    pub only_trips: bool,
    /// Qualifier pairs kept per statement.
    #[serde(rename = "MAX_QPAIRS", default = "Config::default_max_qpairs")]
    pub max_qpairs: usize,
    #[serde(rename = "MODEL", default)]
    pub model: ModelSection,
    #[serde(rename = "TRAINING", default)]
    pub training: TrainingSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parallel: false,
            device: default_device(),
            num_entities: 0,
            num_relations: 0,
            embedding_dim: Self::default_embedding_dim(),
            alpha: Self::default_alpha(),
            only_trips: false,
            max_qpairs: Self::default_max_qpairs(),
            model: ModelSection::default(),
            training: TrainingSection::default(),
        }
    }
}

/// `MODEL` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSection {
    #[serde(rename = "SRC_MASK", default = "default_true")]
    pub src_mask: bool,
    #[serde(rename = "OPN", default = "ModelSection::default_opn")]
    pub opn: String,
    #[serde(rename = "TRIP_LAYERS", default = "ModelSection::default_layers")]
    pub trip_layers: usize,
    #[serde(rename = "QUAL_LAYERS", default = "ModelSection::default_layers")]
    pub qual_layers: usize,
    #[serde(rename = "QUAL_PROP", default = "ModelSection::default_qual_prop")]
    pub qual_prop: String,
    #[serde(rename = "PARALLEL_DROP", default = "ModelSection::default_drop")]
    pub parallel_drop: f32,
    #[serde(rename = "GCN_DROP", default = "ModelSection::default_drop")]
    pub gcn_drop: f32,
    #[serde(rename = "T_N_HEADS", default = "ModelSection::default_heads")]
    pub t_n_heads: usize,
    #[serde(rename = "T_HIDDEN", default = "ModelSection::default_hidden")]
    pub t_hidden: usize,
    #[serde(rename = "T_LAYERS", default = "ModelSection::default_layers")]
    pub t_layers: usize,
    #[serde(rename = "TRANSFORMER_DROP", default = "ModelSection::default_drop")]
    pub transformer_drop: f32,
    #[serde(rename = "HID_DROP", default = "ModelSection::default_hid_drop")]
    pub hid_drop: f32,
    #[serde(rename = "POSITIONAL", default = "default_true")]
    pub positional: bool,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            src_mask: true,
            opn: Self::default_opn(),
            trip_layers: Self::default_layers(),
            qual_layers: Self::default_layers(),
            qual_prop: Self::default_qual_prop(),
            parallel_drop: Self::default_drop(),
            gcn_drop: Self::default_drop(),
            t_n_heads: Self::default_heads(),
            t_hidden: Self::default_hidden(),
            t_layers: Self::default_layers(),
            transformer_drop: Self::default_drop(),
            hid_drop: Self::default_hid_drop(),
            positional: true,
        }
    }
}

impl ModelSection {
    fn default_opn() -> String {
        "rotate".to_string()
    }
    fn default_layers() -> usize {
        2
    }
    fn default_qual_prop() -> String {
        "qualifier".to_string()
    }
    fn default_drop() -> f32 {
        0.1
    }
    fn default_hid_drop() -> f32 {
        0.3
    }
    fn default_heads() -> usize {
        4
    }
    fn default_hidden() -> usize {
        512
    }
}

/// `TRAINING` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSection {
    #[serde(rename = "EPOCHS", default = "TrainingSection::default_epochs")]
    pub epochs: usize,
    #[serde(rename = "BATCH_SIZE", default = "TrainingSection::default_batch_size")]
    pub batch_size: usize,
    #[serde(rename = "LEARNING_RATE", default = "TrainingSection::default_lr")]
    pub learning_rate: f64,
    #[serde(rename = "WEIGHT_DECAY", default)]
    pub weight_decay: f64,
    #[serde(rename = "EVAL_EVERY", default = "TrainingSection::default_eval_every")]
    pub eval_every: usize,
    #[serde(rename = "GRAD_CLIPPING", default = "default_true")]
    pub grad_clipping: bool,
    /// Window of recent MRR values; `null` disables early stopping.
    #[serde(rename = "EARLY_STOPPING", default)]
    pub early_stopping: Option<usize>,
    #[serde(rename = "LABEL_SMOOTHING", default = "TrainingSection::default_smoothing")]
    pub label_smoothing: f32,
    #[serde(rename = "USE_INVERSE", default = "default_true")]
    pub use_inverse: bool,
    /// Also train on masked qualifier-entity prediction.
    #[serde(rename = "AUX_ENTITIES", default)]
    pub aux_entities: bool,
    /// Train and rank with the qualifier columns of each query; `false`
    /// strips them from both training and evaluation batches.
    #[serde(rename = "QUALIFIER_AWARE", default = "default_true")]
    pub qualifier_aware: bool,
    #[serde(rename = "SEED", default = "TrainingSection::default_seed")]
    pub seed: u64,
    /// Decay the learning rate every `LR_STEP` epochs.
    #[serde(rename = "LR_STEP", default)]
    pub lr_step: Option<usize>,
    #[serde(rename = "LR_GAMMA", default = "TrainingSection::default_gamma")]
    pub lr_gamma: f64,
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            epochs: Self::default_epochs(),
            batch_size: Self::default_batch_size(),
            learning_rate: Self::default_lr(),
            weight_decay: 0.0,
            eval_every: Self::default_eval_every(),
            grad_clipping: true,
            early_stopping: None,
            label_smoothing: Self::default_smoothing(),
            use_inverse: true,
            aux_entities: false,
            qualifier_aware: true,
            seed: Self::default_seed(),
            lr_step: None,
            lr_gamma: Self::default_gamma(),
        }
    }
}

impl TrainingSection {
    fn default_epochs() -> usize {
        400
    }
    fn default_batch_size() -> usize {
        128
    }
    fn default_lr() -> f64 {
        1e-4
    }
    fn default_eval_every() -> usize {
        5
    }
    fn default_smoothing() -> f32 {
        0.1
    }
    fn default_seed() -> u64 {
        42
    }
    fn default_gamma() -> f64 {
        0.95
    }
}

/// Validated, immutable model hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub num_entities: usize,
    pub num_relations: usize,
    pub embedding_dim: usize,
    pub composition: Composition,
    pub trip_layers: usize,
    pub qual_layers: usize,
    pub qual_propagation: Propagation,
    pub parallel: bool,
    pub parallel_dropout: f32,
    pub gcn_dropout: f32,
    pub alpha: f64,
    pub only_trips: bool,
    pub decoder: DecoderConfig,
}

impl ModelConfig {
    /// Per-layer settings shared by both encoders.
    pub fn conv(&self) -> ConvConfig {
        ConvConfig {
            composition: self.composition,
            dropout: self.gcn_dropout,
            alpha: self.alpha,
        }
    }
}

impl Config {
    fn default_embedding_dim() -> usize {
        200
    }
    fn default_alpha() -> f64 {
        0.8
    }
    fn default_max_qpairs() -> usize {
        6
    }

    /// Read a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Fill entity/relation counts, keeping explicit values.
    pub fn with_vocabulary_size(mut self, num_entities: usize, num_relations: usize) -> Self {
        if self.num_entities == 0 {
            self.num_entities = num_entities;
        }
        if self.num_relations == 0 {
            self.num_relations = num_relations;
        }
        self
    }

    /// Resolve `DEVICE` (`cpu`, `cuda`, `cuda:N`).
    pub fn device(&self) -> Result<Device> {
        let name = self.device.trim().to_ascii_lowercase();
        match name.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::new_cuda(0)?),
            other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
                Some(Ok(ordinal)) => Ok(Device::new_cuda(ordinal)?),
                _ => Err(Error::Config(format!("unknown device: {}", self.device))),
            },
        }
    }

    /// Validate and freeze the model hyperparameters.
    pub fn model_config(&self) -> Result<ModelConfig> {
        let composition: Composition = self.model.opn.parse()?;
        let qual_propagation: Propagation = self
            .model
            .qual_prop
            .parse()
            .map_err(|_| Error::Config(format!("unknown QUAL_PROP: {}", self.model.qual_prop)))?;

        if self.num_entities == 0 {
            return Err(Error::Config("NUM_ENTITIES must be positive".into()));
        }
        if self.num_relations == 0 {
            return Err(Error::Config("NUM_RELATIONS must be positive".into()));
        }
        if self.embedding_dim == 0 {
            return Err(Error::Config("EMBEDDING_DIM must be positive".into()));
        }
        if composition == Composition::Rotate && self.embedding_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "rotate needs an even EMBEDDING_DIM, got {}",
                self.embedding_dim
            )));
        }
        if qual_propagation == Propagation::Triple {
            return Err(Error::Config(
                "QUAL_PROP must be a qualifier-aware mode (qualifier or both)".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(Error::Config(format!("ALPHA must lie in [0, 1], got {}", self.alpha)));
        }
        for (name, p) in [
            ("PARALLEL_DROP", self.model.parallel_drop),
            ("GCN_DROP", self.model.gcn_drop),
            ("TRANSFORMER_DROP", self.model.transformer_drop),
            ("HID_DROP", self.model.hid_drop),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Config(format!("{name} must lie in [0, 1), got {p}")));
            }
        }
        if self.model.t_n_heads == 0 || self.embedding_dim % self.model.t_n_heads != 0 {
            return Err(Error::Config(format!(
                "EMBEDDING_DIM {} is not divisible by T_N_HEADS {}",
                self.embedding_dim, self.model.t_n_heads
            )));
        }

        Ok(ModelConfig {
            num_entities: self.num_entities,
            num_relations: self.num_relations,
            embedding_dim: self.embedding_dim,
            composition,
            trip_layers: self.model.trip_layers,
            qual_layers: self.model.qual_layers,
            qual_propagation,
            parallel: self.parallel,
            parallel_dropout: self.model.parallel_drop,
            gcn_dropout: self.model.gcn_drop,
            alpha: self.alpha,
            only_trips: self.only_trips,
            decoder: DecoderConfig {
                embedding_dim: self.embedding_dim,
                num_heads: self.model.t_n_heads,
                hidden_dim: self.model.t_hidden,
                num_layers: self.model.t_layers,
                dropout: self.model.transformer_drop,
                hidden_dropout: self.model.hid_drop,
                src_mask: self.model.src_mask,
                positional: self.model.positional,
                max_seq_len: 3 + 2 * self.max_qpairs,
            },
        })
    }

    /// Loop settings from the `TRAINING` section.
    pub fn training_config(&self) -> Result<TrainingConfig> {
        let t = &self.training;
        if t.eval_every == 0 {
            return Err(Error::Config("EVAL_EVERY must be positive".into()));
        }
        if t.early_stopping == Some(0) {
            return Err(Error::Config("EARLY_STOPPING window must be positive".into()));
        }
        Ok(TrainingConfig::default()
            .with_epochs(t.epochs)
            .with_eval_every(t.eval_every)
            .with_grad_clipping(t.grad_clipping)
            .with_early_stopping(t.early_stopping)
            .with_qualifier_aware(t.qualifier_aware))
    }

    /// Batching settings from the `TRAINING` section.
    pub fn sampler_config(&self) -> Result<SamplerConfig> {
        let t = &self.training;
        if t.batch_size == 0 {
            return Err(Error::Config("BATCH_SIZE must be positive".into()));
        }
        if !(0.0..1.0).contains(&t.label_smoothing) {
            return Err(Error::Config(format!(
                "LABEL_SMOOTHING must lie in [0, 1), got {}",
                t.label_smoothing
            )));
        }
        Ok(SamplerConfig {
            batch_size: t.batch_size,
            max_qpairs: self.max_qpairs,
            label_smoothing: t.label_smoothing,
            use_inverse: t.use_inverse,
            aux_entities: t.aux_entities,
            seed: t.seed,
        })
    }
}

//! Transformer scoring head over statement sequences.
//!
//! Each query is laid out as a sequence of embeddings
//!
//! ```text
//! [s, r, (o), qr_1, qe_1, qr_2, qe_2, ...]
//! ```
//!
//! and passed through post-norm transformer encoder layers. The main path
//! mean-pools the sequence and scores every entity by dot product; the
//! auxiliary path reads the hidden state at one masked qualifier-entity slot
//! instead. Scores are sigmoid-bounded.

use candle_core::{Device, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, Dropout, Embedding, LayerNorm, Linear, VarBuilder};

use crate::error::{Error, Result};

/// Additive attention bias for padded keys.
const MASK_BIAS: f64 = -1e9;

/// Decoder hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    pub embedding_dim: usize,
    pub num_heads: usize,
    /// Feed-forward width.
    pub hidden_dim: usize,
    pub num_layers: usize,
    /// Dropout inside the transformer layers.
    pub dropout: f32,
    /// Dropout before the final projection.
    pub hidden_dropout: f32,
    /// Mask qualifier positions whose id is 0.
    pub src_mask: bool,
    /// Add learned positional embeddings.
    pub positional: bool,
    /// Longest sequence accepted, including the object slot.
    pub max_seq_len: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 200,
            num_heads: 4,
            hidden_dim: 512,
            num_layers: 2,
            dropout: 0.1,
            hidden_dropout: 0.3,
            src_mask: true,
            positional: true,
            max_seq_len: 3 + 2 * 6,
        }
    }
}

/// Embeddings indexed for one batch of queries.
pub struct DecoderInput<'a> {
    /// Subject embeddings (B x d).
    pub subjects: &'a Tensor,
    /// Relation embeddings (B x d).
    pub relations: &'a Tensor,
    /// Qualifier entity embeddings (B x P x d).
    pub qual_entities: &'a Tensor,
    /// Qualifier relation embeddings (B x P x d).
    pub qual_relations: &'a Tensor,
    /// Qualifier id matrix, `[qr_1, qe_1, ...]` per row (B x 2P), u32.
    pub qual_ids: &'a Tensor,
    /// Object embeddings for the auxiliary path (B x d).
    pub tails: Option<&'a Tensor>,
    /// One-hot selector of the predicted qualifier slot (B x P).
    pub aux_mask: Option<&'a Tensor>,
}

/// Multi-head self-attention followed by a ReLU feed-forward block.
struct EncoderLayer {
    in_proj: Linear,
    out_proj: Linear,
    ff1: Linear,
    ff2: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
    dropout: Dropout,
    num_heads: usize,
}

impl EncoderLayer {
    fn new(d: usize, num_heads: usize, hidden: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            in_proj: linear(d, 3 * d, vb.pp("in_proj"))?,
            out_proj: linear(d, d, vb.pp("out_proj"))?,
            ff1: linear(d, hidden, vb.pp("ff1"))?,
            ff2: linear(hidden, d, vb.pp("ff2"))?,
            norm1: layer_norm(d, 1e-5, vb.pp("norm1"))?,
            norm2: layer_norm(d, 1e-5, vb.pp("norm2"))?,
            dropout: Dropout::new(dropout),
            num_heads,
        })
    }

    /// # Arguments
    /// - `x`: (B x L x d)
    /// - `bias`: additive key mask (B x 1 x 1 x L)
    fn forward(&self, x: &Tensor, bias: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let (b, l, d) = x.dims3()?;
        let dh = d / self.num_heads;

        let qkv = self.in_proj.forward(x)?;
        let split = |i: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(D::Minus1, i * d, d)?
                .reshape((b, l, self.num_heads, dh))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let (q, k, v) = (split(0)?, split(1)?, split(2)?);

        let scale = 1.0 / (dh as f64).sqrt();
        let mut scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        if let Some(bias) = bias {
            scores = scores.broadcast_add(bias)?;
        }
        let attn = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let attn = self.dropout.forward(&attn, train)?;
        let ctx = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, l, d))?;
        let ctx = self.out_proj.forward(&ctx)?;

        let x = self.norm1.forward(&(x + self.dropout.forward(&ctx, train)?)?)?;
        let ff = self.ff1.forward(&x)?.relu()?;
        let ff = self.ff2.forward(&self.dropout.forward(&ff, train)?)?;
        Ok(self.norm2.forward(&(x + self.dropout.forward(&ff, train)?)?)?)
    }
}

/// Transformer decoder scoring every entity as a tail candidate.
pub struct TransformerDecoder {
    layers: Vec<EncoderLayer>,
    positions: Option<Embedding>,
    fc: Linear,
    hidden_drop: Dropout,
    config: DecoderConfig,
}

impl TransformerDecoder {
    pub fn new(config: DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.embedding_dim;
        if config.num_heads == 0 || d % config.num_heads != 0 {
            return Err(Error::Config(format!(
                "embedding dimension {d} is not divisible by {} heads",
                config.num_heads
            )));
        }
        let layers = (0..config.num_layers)
            .map(|i| {
                EncoderLayer::new(
                    d,
                    config.num_heads,
                    config.hidden_dim,
                    config.dropout,
                    vb.pp(format!("layer{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let positions = if config.positional {
            Some(embedding(config.max_seq_len, d, vb.pp("positions"))?)
        } else {
            None
        };
        Ok(Self {
            layers,
            positions,
            fc: linear(d, d, vb.pp("fc"))?,
            hidden_drop: Dropout::new(config.hidden_dropout),
            config,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Score all entities.
    ///
    /// # Arguments
    /// - `input`: indexed embeddings for the batch
    /// - `entities`: full entity table (N x d)
    /// - `train`: enables dropout
    ///
    /// # Returns
    /// - Scores in (0, 1) (B x N)
    pub fn forward(&self, input: &DecoderInput<'_>, entities: &Tensor, train: bool) -> Result<Tensor> {
        let (b, d) = input.subjects.dims2()?;
        let p = input.qual_entities.dim(1)?;
        let device = input.subjects.device();

        let mut parts = vec![input.subjects.unsqueeze(1)?, input.relations.unsqueeze(1)?];
        if let Some(tails) = input.tails {
            parts.push(tails.unsqueeze(1)?);
        }
        let prefix = parts.len();
        if p > 0 {
            // [qr_1, qe_1, qr_2, qe_2, ...]
            let quals = Tensor::stack(&[input.qual_relations, input.qual_entities], 2)?
                .reshape((b, 2 * p, d))?;
            parts.push(quals);
        }
        let mut seq = Tensor::cat(&parts, 1)?;
        let len = prefix + 2 * p;

        if let Some(positions) = &self.positions {
            if len > self.config.max_seq_len {
                return Err(Error::Validation(format!(
                    "sequence of length {len} exceeds the positional table ({})",
                    self.config.max_seq_len
                )));
            }
            let ids = Tensor::arange(0u32, len as u32, device)?;
            seq = seq.broadcast_add(&positions.forward(&ids)?)?;
        }

        // 1.0 at padded qualifier positions (B x L)
        let padded = if self.config.src_mask && p > 0 {
            let pad = input.qual_ids.eq(&input.qual_ids.zeros_like()?)?.to_dtype(seq.dtype())?;
            let head = Tensor::zeros((b, prefix), seq.dtype(), device)?;
            Some(Tensor::cat(&[&head, &pad], 1)?)
        } else {
            None
        };
        let bias = match &padded {
            Some(pad) => Some(pad.affine(MASK_BIAS, 0.0)?.reshape((b, 1, 1, len))?),
            None => None,
        };

        let mut x = seq;
        for layer in &self.layers {
            x = layer.forward(&x, bias.as_ref(), train)?;
        }

        let pooled = match input.aux_mask {
            Some(mask) if p > 0 => {
                let zeros = Tensor::zeros((b, p), mask.dtype(), device)?;
                let slot = Tensor::stack(&[&zeros, mask], 2)?.reshape((b, 2 * p))?;
                let head = Tensor::zeros((b, prefix), mask.dtype(), device)?;
                let select = Tensor::cat(&[&head, &slot], 1)?.to_dtype(x.dtype())?;
                x.broadcast_mul(&select.unsqueeze(2)?)?.sum(1)?
            }
            _ => masked_mean(&x, padded.as_ref())?,
        };

        let h = self.fc.forward(&self.hidden_drop.forward(&pooled, train)?)?;
        let logits = h.matmul(&entities.t()?)?;
        Ok(candle_nn::ops::sigmoid(&logits)?)
    }
}

/// Mean over sequence positions, skipping padded ones.
fn masked_mean(x: &Tensor, padded: Option<&Tensor>) -> Result<Tensor> {
    match padded {
        None => Ok(x.mean(1)?),
        Some(pad) => {
            let keep = pad.affine(-1.0, 1.0)?;
            let total = x.broadcast_mul(&keep.unsqueeze(2)?)?.sum(1)?;
            let count = keep.sum_keepdim(1)?;
            Ok(total.broadcast_div(&count)?)
        }
    }
}

/// Qualifier id matrix `[qr, qe, ...]` split into relation and entity columns.
pub fn split_qualifier_ids(ids: &[u32], rows: usize, device: &Device) -> Result<(Tensor, Tensor)> {
    let width = if rows == 0 { 0 } else { ids.len() / rows };
    let p = width / 2;
    let mut rels = Vec::with_capacity(rows * p);
    let mut ents = Vec::with_capacity(rows * p);
    for row in ids.chunks(width.max(1)).take(rows) {
        for pair in row.chunks_exact(2) {
            rels.push(pair[0]);
            ents.push(pair[1]);
        }
    }
    Ok((
        Tensor::from_vec(rels, rows * p, device)?,
        Tensor::from_vec(ents, rows * p, device)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn small_config() -> DecoderConfig {
        DecoderConfig {
            embedding_dim: 8,
            num_heads: 2,
            hidden_dim: 16,
            num_layers: 1,
            dropout: 0.0,
            hidden_dropout: 0.0,
            src_mask: true,
            positional: true,
            max_seq_len: 7,
        }
    }

    fn inputs(b: usize, p: usize, device: &Device) -> (Tensor, Tensor, Tensor, Tensor) {
        (
            Tensor::randn(0f32, 1f32, (b, 8), device).unwrap(),
            Tensor::randn(0f32, 1f32, (b, 8), device).unwrap(),
            Tensor::randn(0f32, 1f32, (b, p, 8), device).unwrap(),
            Tensor::randn(0f32, 1f32, (b, p, 8), device).unwrap(),
        )
    }

    #[test]
    fn test_scores_are_probabilities() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let dec = TransformerDecoder::new(small_config(), vb).unwrap();

        let (s, r, qe, qr) = inputs(3, 2, &device);
        let ids = Tensor::new(&[[1u32, 2, 0, 0], [1, 3, 2, 4], [0, 0, 0, 0]], &device).unwrap();
        let entities = Tensor::randn(0f32, 1f32, (6, 8), &device).unwrap();

        let input = DecoderInput {
            subjects: &s,
            relations: &r,
            qual_entities: &qe,
            qual_relations: &qr,
            qual_ids: &ids,
            tails: None,
            aux_mask: None,
        };
        let scores = dec.forward(&input, &entities, false).unwrap();
        assert_eq!(scores.dims(), &[3, 6]);
        for row in scores.to_vec2::<f32>().unwrap() {
            assert!(row.iter().all(|&v| v > 0.0 && v < 1.0));
        }
    }

    #[test]
    fn test_aux_path_with_tail_and_mask() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let dec = TransformerDecoder::new(small_config(), vb).unwrap();

        let (s, r, qe, qr) = inputs(2, 2, &device);
        let o = Tensor::randn(0f32, 1f32, (2, 8), &device).unwrap();
        let ids = Tensor::new(&[[1u32, 0, 3, 4], [2, 3, 1, 0]], &device).unwrap();
        let mask = Tensor::new(&[[1f32, 0.], [0., 1.]], &device).unwrap();
        let entities = Tensor::randn(0f32, 1f32, (5, 8), &device).unwrap();

        let input = DecoderInput {
            subjects: &s,
            relations: &r,
            qual_entities: &qe,
            qual_relations: &qr,
            qual_ids: &ids,
            tails: Some(&o),
            aux_mask: Some(&mask),
        };
        let scores = dec.forward(&input, &entities, false).unwrap();
        assert_eq!(scores.dims(), &[2, 5]);
    }

    #[test]
    fn test_padded_qualifiers_do_not_change_scores() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let dec = TransformerDecoder::new(small_config(), vb).unwrap();

        let (s, r, qe, qr) = inputs(1, 2, &device);
        let (_, _, qe2, qr2) = inputs(1, 2, &device);
        let ids = Tensor::new(&[[0u32, 0, 0, 0]], &device).unwrap();
        let entities = Tensor::randn(0f32, 1f32, (4, 8), &device).unwrap();

        let score = |qe: &Tensor, qr: &Tensor| {
            let input = DecoderInput {
                subjects: &s,
                relations: &r,
                qual_entities: qe,
                qual_relations: qr,
                qual_ids: &ids,
                tails: None,
                aux_mask: None,
            };
            dec.forward(&input, &entities, false).unwrap().to_vec2::<f32>().unwrap()
        };
        let a = score(&qe, &qr);
        let b = score(&qe2, &qr2);
        for (x, y) in a[0].iter().zip(&b[0]) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = DecoderConfig {
            num_heads: 3,
            ..small_config()
        };
        assert!(matches!(TransformerDecoder::new(config, vb), Err(Error::Config(_))));
    }

    #[test]
    fn test_split_qualifier_ids() {
        let device = Device::Cpu;
        let (rels, ents) = split_qualifier_ids(&[1, 2, 3, 4, 5, 6, 0, 0], 2, &device).unwrap();
        assert_eq!(rels.to_vec1::<u32>().unwrap(), vec![1, 3, 5, 0]);
        assert_eq!(ents.to_vec1::<u32>().unwrap(), vec![2, 4, 6, 0]);
    }
}

//! Batch construction for tail prediction.
//!
//! Statements are grouped by their query `(s, r, qualifiers)`; every group
//! becomes one training row whose label is the multi-hot set of objects that
//! complete it. With `use_inverse`, the reciprocal query `(o, r + R,
//! qualifiers)` with label `s` is added as well.
//!
//! Optionally, auxiliary rows ask for a masked qualifier entity given the
//! full triple and the remaining qualifiers.

use std::collections::{BTreeMap, BTreeSet};

use hyprel_nn::Statement;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;

use crate::error::{Error, Result};

/// Batching settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    pub batch_size: usize,
    /// Qualifier pairs kept per row; extra pairs are dropped, missing ones padded.
    pub max_qpairs: usize,
    /// Labels become `(1 - eps) * y + 1 / N`.
    pub label_smoothing: f32,
    pub use_inverse: bool,
    pub aux_entities: bool,
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            max_qpairs: 6,
            label_smoothing: 0.1,
            use_inverse: true,
            aux_entities: false,
            seed: 42,
        }
    }
}

/// Qualifier-entity prediction rows.
#[derive(Debug, Clone, PartialEq)]
pub struct AuxBatch {
    pub subjects: Vec<u32>,
    pub relations: Vec<u32>,
    pub objects: Vec<u32>,
    /// Row-major `[qr_1, qe_1, ...]`, 2P per row; the masked slot's entity is 0.
    pub qualifiers: Vec<u32>,
    /// Row-major one-hot over the P qualifier slots.
    pub mask: Vec<f32>,
    /// Row-major multi-hot over entities.
    pub labels: Vec<f32>,
}

impl AuxBatch {
    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

/// One training batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Row-major `[s, r, qr_1, qe_1, ...]`.
    pub triples: Vec<u32>,
    /// Columns per row in `triples`.
    pub width: usize,
    /// Row-major multi-hot over entities.
    pub labels: Vec<f32>,
    pub num_entities: usize,
    pub aux: Option<AuxBatch>,
}

impl Batch {
    /// Query rows built from statements, without labels.
    pub fn from_statements(
        statements: &[Statement],
        max_qpairs: usize,
        num_entities: usize,
    ) -> Batch {
        let width = 2 + 2 * max_qpairs;
        let mut triples = Vec::with_capacity(statements.len() * width);
        for st in statements {
            triples.extend_from_slice(&[st.subject, st.relation]);
            triples.extend(padded_qualifiers(st, max_qpairs));
        }
        Batch {
            triples,
            width,
            labels: Vec::new(),
            num_entities,
            aux: None,
        }
    }

    /// Rows hold at least the `(s, r)` columns; a narrower width has none.
    pub fn len(&self) -> usize {
        if self.width < 2 {
            0
        } else {
            self.triples.len() / self.width
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rows(&self) -> impl Iterator<Item = &[u32]> {
        let rows: &[u32] = if self.width < 2 { &[] } else { &self.triples };
        rows.chunks_exact(self.width.max(2))
    }

    pub fn subjects(&self) -> Vec<u32> {
        self.rows().map(|row| row[0]).collect()
    }

    pub fn relations(&self) -> Vec<u32> {
        self.rows().map(|row| row[1]).collect()
    }

    /// Row-major `[qr_1, qe_1, ...]` columns.
    pub fn qualifiers(&self) -> Vec<u32> {
        self.rows().flat_map(|row| row[2..].iter().copied()).collect()
    }

    /// Keep only the `(s, r)` columns and drop the auxiliary rows.
    pub fn without_qualifiers(&self) -> Batch {
        Batch {
            triples: self.rows().flat_map(|row| row[..2].iter().copied()).collect(),
            width: 2,
            labels: self.labels.clone(),
            num_entities: self.num_entities,
            aux: None,
        }
    }
}

/// Produces the batches of one epoch.
pub trait BatchSource {
    fn batches(&mut self) -> Vec<Batch>;
}

impl BatchSource for Vec<Batch> {
    fn batches(&mut self) -> Vec<Batch> {
        self.clone()
    }
}

#[derive(Debug, Clone)]
struct AuxRow {
    subject: u32,
    relation: u32,
    object: u32,
    qualifiers: Vec<u32>,
    slot: usize,
    answers: Vec<u32>,
}

/// Shuffling tail-prediction sampler.
#[derive(Debug, Clone)]
pub struct TailSampler {
    queries: Vec<(Vec<u32>, Vec<u32>)>,
    aux_rows: Vec<AuxRow>,
    num_entities: usize,
    config: SamplerConfig,
    rng: XorShiftRng,
}

/// `[qr_1, qe_1, ...]` truncated or zero-padded to `max_qpairs` pairs.
fn padded_qualifiers(statement: &Statement, max_qpairs: usize) -> Vec<u32> {
    let mut out = Vec::with_capacity(2 * max_qpairs);
    for &(qr, qv) in statement.qualifiers.iter().filter(|q| q.0 != 0).take(max_qpairs) {
        out.push(qr);
        out.push(qv);
    }
    out.resize(2 * max_qpairs, 0);
    out
}

/// Reject ids that would index past the label or relation tables.
fn check_ids(statements: &[Statement], num_entities: usize, num_relations: usize) -> Result<()> {
    let (n, r) = (num_entities as u32, num_relations as u32);
    for (i, st) in statements.iter().enumerate() {
        let entities = [st.subject, st.object]
            .into_iter()
            .chain(st.qualifiers.iter().filter(|q| q.0 != 0).map(|q| q.1));
        if let Some(bad) = entities.into_iter().find(|&id| id >= n) {
            return Err(Error::Validation(format!(
                "statement {i}: entity id {bad} out of range for {num_entities} entities"
            )));
        }
        let relations = std::iter::once(st.relation).chain(st.qualifiers.iter().map(|q| q.0));
        if let Some(bad) = relations.into_iter().find(|&id| id >= r) {
            return Err(Error::Validation(format!(
                "statement {i}: relation id {bad} out of range for {num_relations} relations"
            )));
        }
    }
    Ok(())
}

impl TailSampler {
    /// Group statements into queries.
    ///
    /// Fails if a statement names an entity or relation outside the
    /// vocabulary sizes.
    pub fn new(
        statements: &[Statement],
        num_entities: usize,
        num_relations: usize,
        config: SamplerConfig,
    ) -> Result<Self> {
        check_ids(statements, num_entities, num_relations)?;

        let mut groups: BTreeMap<Vec<u32>, BTreeSet<u32>> = BTreeMap::new();
        let mut aux_groups: BTreeMap<(u32, u32, u32, Vec<u32>, usize), BTreeSet<u32>> =
            BTreeMap::new();

        for st in statements {
            let quals = padded_qualifiers(st, config.max_qpairs);

            let mut key = vec![st.subject, st.relation];
            key.extend_from_slice(&quals);
            groups.entry(key).or_default().insert(st.object);

            if config.use_inverse {
                let mut key = vec![st.object, st.relation + num_relations as u32];
                key.extend_from_slice(&quals);
                groups.entry(key).or_default().insert(st.subject);
            }

            if config.aux_entities {
                for slot in 0..config.max_qpairs {
                    let answer = quals[2 * slot + 1];
                    if quals[2 * slot] == 0 {
                        continue;
                    }
                    let mut masked = quals.clone();
                    masked[2 * slot + 1] = 0;
                    aux_groups
                        .entry((st.subject, st.relation, st.object, masked, slot))
                        .or_default()
                        .insert(answer);
                }
            }
        }

        let queries = groups
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().collect()))
            .collect();
        let aux_rows = aux_groups
            .into_iter()
            .map(|((subject, relation, object, qualifiers, slot), answers)| AuxRow {
                subject,
                relation,
                object,
                qualifiers,
                slot,
                answers: answers.into_iter().collect(),
            })
            .collect();

        let rng = XorShiftRng::seed_from_u64(config.seed);
        Ok(Self {
            queries,
            aux_rows,
            num_entities,
            config,
            rng,
        })
    }

    /// Distinct training queries.
    pub fn num_queries(&self) -> usize {
        self.queries.len()
    }

    pub fn num_aux_rows(&self) -> usize {
        self.aux_rows.len()
    }

    fn labels(&self, answers: &[u32]) -> Vec<f32> {
        let n = self.num_entities;
        let eps = self.config.label_smoothing;
        let mut y = vec![0f32; n];
        for &a in answers {
            y[a as usize] = 1.0;
        }
        if eps > 0.0 {
            for v in &mut y {
                *v = (1.0 - eps) * *v + 1.0 / n as f32;
            }
        }
        y
    }

    fn aux_batch(&self, rows: &[usize]) -> AuxBatch {
        let p = self.config.max_qpairs;
        let mut batch = AuxBatch {
            subjects: Vec::with_capacity(rows.len()),
            relations: Vec::with_capacity(rows.len()),
            objects: Vec::with_capacity(rows.len()),
            qualifiers: Vec::with_capacity(rows.len() * 2 * p),
            mask: Vec::with_capacity(rows.len() * p),
            labels: Vec::with_capacity(rows.len() * self.num_entities),
        };
        for &i in rows {
            let row = &self.aux_rows[i];
            batch.subjects.push(row.subject);
            batch.relations.push(row.relation);
            batch.objects.push(row.object);
            batch.qualifiers.extend_from_slice(&row.qualifiers);
            batch
                .mask
                .extend((0..p).map(|j| if j == row.slot { 1.0 } else { 0.0 }));
            batch.labels.extend(self.labels(&row.answers));
        }
        batch
    }
}

impl BatchSource for TailSampler {
    fn batches(&mut self) -> Vec<Batch> {
        let width = 2 + 2 * self.config.max_qpairs;
        let batch_size = self.config.batch_size.max(1);

        let mut order: Vec<usize> = (0..self.queries.len()).collect();
        order.shuffle(&mut self.rng);
        let mut aux_order: Vec<usize> = (0..self.aux_rows.len()).collect();
        aux_order.shuffle(&mut self.rng);

        let num_batches = order.len().div_ceil(batch_size);
        let aux_chunk = if num_batches == 0 {
            0
        } else {
            aux_order.len().div_ceil(num_batches)
        };

        order
            .chunks(batch_size)
            .enumerate()
            .map(|(b, chunk)| {
                let mut triples = Vec::with_capacity(chunk.len() * width);
                let mut labels = Vec::with_capacity(chunk.len() * self.num_entities);
                for &i in chunk {
                    let (key, answers) = &self.queries[i];
                    triples.extend_from_slice(key);
                    labels.extend(self.labels(answers));
                }
                let aux = if aux_chunk == 0 {
                    None
                } else {
                    let start = (b * aux_chunk).min(aux_order.len());
                    let end = ((b + 1) * aux_chunk).min(aux_order.len());
                    let rows = &aux_order[start..end];
                    (!rows.is_empty()).then(|| self.aux_batch(rows))
                };
                Batch {
                    triples,
                    width,
                    labels,
                    num_entities: self.num_entities,
                    aux,
                }
            })
            .collect()
    }
}

//! Rank-based evaluation for hyper-relational link prediction.
//!
//! Each evaluation statement `(s, r, o, quals)` becomes the query
//! `(s, r, quals, ?)`; all entities are scored and the rank of `o` is
//! recorded. With reciprocal queries enabled, `(o, r + R, quals, ?)` is ranked
//! against `s` as well.
//!
//! # Filtered vs Raw Metrics
//!
//! | Setting | Description | Use Case |
//! |---------|-------------|----------|
//! | Raw | All entities as negatives | Pessimistic estimate |
//! | Filtered | Remove known true statements | Standard benchmark |
//!
//! A known statement must match the query's qualifiers too: the same triple
//! under different qualifiers is a different fact. A model trained without
//! qualifiers is ranked on `(s, r, ?)` queries through
//! [`Evaluator::without_qualifiers`], which filters every known object of the
//! triple.
//!
//! # Standard Metrics
//!
//! | Metric | Range | Description |
//! |--------|-------|-------------|
//! | MRR | (0, 1] | Mean Reciprocal Rank: average of 1/rank |
//! | MR | [1, N] | Mean Rank |
//! | Hits@k | [0, 1] | Fraction with rank <= k, k in {1, 3, 5, 10} |

use std::collections::{HashMap, HashSet};

use hyprel_nn::Statement;

use crate::error::{Error, Result};
use crate::sampler::Batch;

/// Rank-based evaluation results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankMetrics {
    /// Mean Reciprocal Rank: E\[1/rank\]
    pub mrr: f64,
    /// Mean Rank: E\[rank\]
    pub mr: f64,
    /// Hits@1: P(rank = 1)
    pub hits_at_1: f64,
    /// Hits@3: P(rank <= 3)
    pub hits_at_3: f64,
    /// Hits@5: P(rank <= 5)
    pub hits_at_5: f64,
    /// Hits@10: P(rank <= 10)
    pub hits_at_10: f64,
    /// Number of ranked queries
    pub num_queries: usize,
}

impl RankMetrics {
    /// Compute metrics from a list of ranks.
    pub fn from_ranks(ranks: &[usize]) -> Self {
        if ranks.is_empty() {
            return Self::default();
        }

        let n = ranks.len() as f64;
        let hits = |k: usize| ranks.iter().filter(|&&r| r <= k).count() as f64 / n;

        Self {
            mrr: ranks.iter().map(|&r| 1.0 / r as f64).sum::<f64>() / n,
            mr: ranks.iter().map(|&r| r as f64).sum::<f64>() / n,
            hits_at_1: hits(1),
            hits_at_3: hits(3),
            hits_at_5: hits(5),
            hits_at_10: hits(10),
            num_queries: ranks.len(),
        }
    }

    /// Merge metrics from multiple evaluation runs, weighted by query count.
    pub fn merge(metrics: &[Self]) -> Self {
        let total: usize = metrics.iter().map(|m| m.num_queries).sum();
        if total == 0 {
            return Self::default();
        }
        let total_f = total as f64;
        let weighted = |f: fn(&Self) -> f64| {
            metrics
                .iter()
                .map(|m| f(m) * m.num_queries as f64)
                .sum::<f64>()
                / total_f
        };

        Self {
            mrr: weighted(|m| m.mrr),
            mr: weighted(|m| m.mr),
            hits_at_1: weighted(|m| m.hits_at_1),
            hits_at_3: weighted(|m| m.hits_at_3),
            hits_at_5: weighted(|m| m.hits_at_5),
            hits_at_10: weighted(|m| m.hits_at_10),
            num_queries: total,
        }
    }

    /// Format as summary string.
    pub fn summary(&self) -> String {
        format!(
            "MRR: {:.4} | MR: {:.1} | H@1: {:.3} | H@3: {:.3} | H@5: {:.3} | H@10: {:.3} (n={})",
            self.mrr,
            self.mr,
            self.hits_at_1,
            self.hits_at_3,
            self.hits_at_5,
            self.hits_at_10,
            self.num_queries
        )
    }
}

/// Rank of `target` among `scores`, skipping `filtered` candidates.
///
/// Ties count against the target (pessimistic).
pub fn filtered_rank(scores: &[f32], target: usize, filtered: Option<&HashSet<u32>>) -> usize {
    let target_score = scores[target];
    let mut rank = 1;
    for (j, &score) in scores.iter().enumerate() {
        if j == target || filtered.is_some_and(|f| f.contains(&(j as u32))) {
            continue;
        }
        if score >= target_score {
            rank += 1;
        }
    }
    rank
}

/// Filtered tail-ranking evaluator.
pub struct Evaluator {
    queries: Vec<(Vec<u32>, u32)>,
    known: HashMap<Vec<u32>, HashSet<u32>>,
    num_entities: usize,
    max_qpairs: usize,
    batch_size: usize,
}

impl Evaluator {
    /// # Arguments
    /// - `eval`: statements to rank
    /// - `known`: every true statement used for filtering (train, valid, test)
    /// - `num_entities`, `num_relations`: vocabulary sizes
    /// - `max_qpairs`: qualifier pairs per query, as in training
    /// - `reciprocal`: also rank subjects through the inverse relation
    pub fn new(
        eval: &[Statement],
        known: &[Statement],
        num_entities: usize,
        num_relations: usize,
        max_qpairs: usize,
        reciprocal: bool,
    ) -> Self {
        let key = |s: u32, r: u32, st: &Statement| {
            let mut k = vec![s, r];
            let mut quals: Vec<u32> = st
                .qualifiers
                .iter()
                .filter(|q| q.0 != 0)
                .take(max_qpairs)
                .flat_map(|&(qr, qv)| [qr, qv])
                .collect();
            quals.resize(2 * max_qpairs, 0);
            k.extend(quals);
            k
        };
        let inv = num_relations as u32;

        let mut filter: HashMap<Vec<u32>, HashSet<u32>> = HashMap::new();
        for st in known.iter().chain(eval) {
            filter
                .entry(key(st.subject, st.relation, st))
                .or_default()
                .insert(st.object);
            if reciprocal {
                filter
                    .entry(key(st.object, st.relation + inv, st))
                    .or_default()
                    .insert(st.subject);
            }
        }

        let mut queries = Vec::with_capacity(eval.len() * if reciprocal { 2 } else { 1 });
        for st in eval {
            queries.push((key(st.subject, st.relation, st), st.object));
            if reciprocal {
                queries.push((key(st.object, st.relation + inv, st), st.subject));
            }
        }

        Self {
            queries,
            known: filter,
            num_entities,
            max_qpairs,
            batch_size: 256,
        }
    }

    /// Rank `(s, r, ?)` queries, matching batches stripped of qualifiers
    /// during training.
    pub fn without_qualifiers(self) -> Self {
        let mut known: HashMap<Vec<u32>, HashSet<u32>> = HashMap::new();
        for (key, objects) in self.known {
            known.entry(key[..2].to_vec()).or_default().extend(objects);
        }
        Self {
            queries: self
                .queries
                .into_iter()
                .map(|(key, target)| (key[..2].to_vec(), target))
                .collect(),
            known,
            max_qpairs: 0,
            ..self
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn num_queries(&self) -> usize {
        self.queries.len()
    }

    /// Rank every query.
    ///
    /// `score` receives a batch without labels and returns row-major scores
    /// (rows x num_entities).
    pub fn evaluate<F>(&self, mut score: F) -> Result<RankMetrics>
    where
        F: FnMut(&Batch) -> Result<Vec<f32>>,
    {
        let width = 2 + 2 * self.max_qpairs;
        let mut ranks = Vec::with_capacity(self.queries.len());

        for chunk in self.queries.chunks(self.batch_size) {
            let batch = Batch {
                triples: chunk.iter().flat_map(|(k, _)| k.iter().copied()).collect(),
                width,
                labels: Vec::new(),
                num_entities: self.num_entities,
                aux: None,
            };
            let scores = score(&batch)?;
            if scores.len() != chunk.len() * self.num_entities {
                return Err(Error::Validation(format!(
                    "scorer returned {} values for {} queries over {} entities",
                    scores.len(),
                    chunk.len(),
                    self.num_entities
                )));
            }
            for ((key, target), row) in chunk.iter().zip(scores.chunks(self.num_entities)) {
                ranks.push(filtered_rank(row, *target as usize, self.known.get(key)));
            }
        }

        Ok(RankMetrics::from_ranks(&ranks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_metrics_from_ranks() {
        let ranks = vec![1, 2, 3, 10, 100];
        let metrics = RankMetrics::from_ranks(&ranks);

        // MRR = (1/1 + 1/2 + 1/3 + 1/10 + 1/100) / 5
        assert!((metrics.mrr - 0.3886).abs() < 0.001);
        // MR = (1 + 2 + 3 + 10 + 100) / 5 = 23.2
        assert!((metrics.mr - 23.2).abs() < 0.1);
        assert!((metrics.hits_at_1 - 0.2).abs() < 1e-6);
        assert!((metrics.hits_at_3 - 0.6).abs() < 1e-6);
        assert!((metrics.hits_at_5 - 0.6).abs() < 1e-6);
        assert!((metrics.hits_at_10 - 0.8).abs() < 1e-6);
        assert_eq!(metrics.num_queries, 5);
    }

    #[test]
    fn test_empty_ranks() {
        assert_eq!(RankMetrics::from_ranks(&[]), RankMetrics::default());
        assert_eq!(RankMetrics::merge(&[]), RankMetrics::default());
    }

    #[test]
    fn test_merge_weights_by_count() {
        let a = RankMetrics::from_ranks(&[1]);
        let b = RankMetrics::from_ranks(&[2, 2, 2]);
        let merged = RankMetrics::merge(&[a, b]);
        assert_eq!(merged.num_queries, 4);
        assert!((merged.mrr - (1.0 + 1.5) / 4.0).abs() < 1e-9);
        assert!((merged.hits_at_1 - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_filtered_rank() {
        let scores = [0.9, 0.8, 0.7, 0.95];
        // entity 3 outranks the target unless filtered
        assert_eq!(filtered_rank(&scores, 1, None), 3);
        let known: HashSet<u32> = [1, 3].into_iter().collect();
        assert_eq!(filtered_rank(&scores, 1, Some(&known)), 2);
        // ties count against the target
        assert_eq!(filtered_rank(&[0.5, 0.5, 0.5], 0, None), 3);
    }

    #[test]
    fn test_evaluator_filters_known_statements() {
        let known = vec![Statement::new(1, 1, 2)];
        let eval = vec![Statement::new(1, 1, 3)];
        let evaluator = Evaluator::new(&eval, &known, 4, 2, 1, false);
        assert_eq!(evaluator.num_queries(), 1);

        // entity 2 scores highest but is a known answer
        let metrics = evaluator
            .evaluate(|batch| {
                assert_eq!(batch.triples, vec![1, 1, 0, 0]);
                Ok(vec![0.1, 0.2, 0.9, 0.5])
            })
            .unwrap();
        assert_eq!(metrics.mrr, 1.0);
    }

    #[test]
    fn test_evaluator_keeps_qualified_facts_apart() {
        // the same triple under another qualifier is not filtered
        let known = vec![Statement::new(1, 1, 2).with_qualifier(1, 4)];
        let eval = vec![Statement::new(1, 1, 3)];
        let evaluator = Evaluator::new(&eval, &known, 5, 2, 1, false);
        let metrics = evaluator.evaluate(|_| Ok(vec![0.1, 0.2, 0.9, 0.5, 0.0])).unwrap();
        assert_eq!(metrics.mr, 2.0);
    }

    #[test]
    fn test_evaluator_without_qualifiers_ranks_triples() {
        let known = vec![Statement::new(1, 1, 2).with_qualifier(1, 4)];
        let eval = vec![Statement::new(1, 1, 3).with_qualifier(1, 3)];
        let evaluator = Evaluator::new(&eval, &known, 5, 2, 1, false).without_qualifiers();

        // same width as a training batch after `Batch::without_qualifiers`
        let metrics = evaluator
            .evaluate(|batch| {
                assert_eq!(batch.width, 2);
                assert_eq!(batch.triples, vec![1, 1]);
                Ok(vec![0.1, 0.2, 0.9, 0.5, 0.0])
            })
            .unwrap();
        // entity 2 completes the triple under another qualifier and is filtered
        assert_eq!(metrics.mrr, 1.0);
    }

    #[test]
    fn test_evaluator_reciprocal_queries() {
        let eval = vec![Statement::new(1, 1, 2)];
        let evaluator = Evaluator::new(&eval, &[], 3, 2, 0, true);
        assert_eq!(evaluator.num_queries(), 2);

        let mut seen = Vec::new();
        evaluator
            .evaluate(|batch| {
                seen = batch.triples.clone();
                Ok(vec![0.0; batch.len() * 3])
            })
            .unwrap();
        assert_eq!(seen, vec![1, 1, 2, 3]);
    }

    #[test]
    fn test_evaluator_rejects_short_scores() {
        let eval = vec![Statement::new(1, 1, 2)];
        let evaluator = Evaluator::new(&eval, &[], 3, 2, 0, false);
        assert!(matches!(evaluator.evaluate(|_| Ok(vec![0.0])), Err(Error::Validation(_))));
    }
}

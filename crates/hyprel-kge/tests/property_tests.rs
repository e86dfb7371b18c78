//! Property tests for ranking, early stopping, sampling and file loading.

use approx::assert_relative_eq;
use hyprel_kge::{
    filtered_rank, load_statements, no_improvement, BatchSource, Config, RankMetrics,
    SamplerConfig, TailSampler, Vocabulary,
};
use hyprel_nn::Statement;
use proptest::prelude::*;
use std::collections::HashSet;
use std::fs;

fn arb_statements() -> impl Strategy<Value = Vec<Statement>> {
    prop::collection::vec(
        (1u32..6, 1u32..4, 1u32..6, prop::option::of((1u32..4, 1u32..6))),
        1..20,
    )
    .prop_map(|rows| {
        rows.into_iter()
            .map(|(s, r, o, q)| match q {
                Some((qr, qv)) => Statement::new(s, r, o).with_qualifier(qr, qv),
                None => Statement::new(s, r, o),
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_rank_within_bounds(
        scores in prop::collection::vec(-10f32..10f32, 1..50),
        target in any::<prop::sample::Index>(),
    ) {
        let t = target.index(scores.len());
        let rank = filtered_rank(&scores, t, None);
        prop_assert!(rank >= 1 && rank <= scores.len());
    }

    #[test]
    fn prop_filtering_never_worsens_rank(
        scores in prop::collection::vec(-10f32..10f32, 2..50),
        target in any::<prop::sample::Index>(),
        filtered in prop::collection::hash_set(0u32..50, 0..10),
    ) {
        let t = target.index(scores.len());
        let raw = filtered_rank(&scores, t, None);
        let filt = filtered_rank(&scores, t, Some(&filtered));
        prop_assert!(filt <= raw);
    }

    #[test]
    fn prop_metrics_are_bounded(ranks in prop::collection::vec(1usize..100, 1..40)) {
        let m = RankMetrics::from_ranks(&ranks);
        prop_assert!(m.mrr > 0.0 && m.mrr <= 1.0);
        prop_assert!(m.mr >= 1.0);
        prop_assert!(m.hits_at_1 <= m.hits_at_3);
        prop_assert!(m.hits_at_3 <= m.hits_at_5);
        prop_assert!(m.hits_at_5 <= m.hits_at_10);
    }

    #[test]
    fn prop_increasing_mrr_never_stops(
        start in 0f64..0.5,
        steps in prop::collection::vec(0.001f64..0.1, 2..10),
        window in 2usize..5,
    ) {
        let mut v = start;
        let values: Vec<f64> = steps.iter().map(|s| { v += s; v }).collect();
        prop_assert!(!no_improvement(&values, window));
    }

    #[test]
    fn prop_every_query_appears_once_per_epoch(statements in arb_statements()) {
        let config = SamplerConfig {
            batch_size: 3,
            max_qpairs: 1,
            label_smoothing: 0.0,
            use_inverse: true,
            aux_entities: false,
            seed: 3,
        };
        let mut sampler = TailSampler::new(&statements, 6, 4, config).unwrap();
        let batches = sampler.batches();

        let rows: usize = batches.iter().map(|b| b.len()).sum();
        prop_assert_eq!(rows, sampler.num_queries());

        // every statement's object is a positive of its query
        let mut seen = HashSet::new();
        for b in &batches {
            for (key, labels) in b.triples.chunks(b.width).zip(b.labels.chunks(b.num_entities)) {
                prop_assert!(seen.insert(key.to_vec()));
                prop_assert!(labels.iter().any(|&y| y == 1.0));
            }
        }
    }
}

#[test]
fn test_metrics_merge_matches_pooled_ranks() {
    let a = [1, 4, 2];
    let b = [3, 1];
    let merged = RankMetrics::merge(&[RankMetrics::from_ranks(&a), RankMetrics::from_ranks(&b)]);
    let pooled = RankMetrics::from_ranks(&[1, 4, 2, 3, 1]);
    assert_relative_eq!(merged.mrr, pooled.mrr, epsilon = 1e-12);
    assert_relative_eq!(merged.mr, pooled.mr, epsilon = 1e-12);
    assert_relative_eq!(merged.hits_at_3, pooled.hits_at_3, epsilon = 1e-12);
}

#[test]
fn test_load_files_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("train.csv");
    let config = dir.path().join("config.json");
    fs::write(&data, "a,r,b,q,c\nb,r,c\n").unwrap();
    fs::write(&config, r#"{ "EMBEDDING_DIM": 32, "MODEL": { "OPN": "corr" } }"#).unwrap();

    let mut vocab = Vocabulary::new();
    let statements = load_statements(&data, &mut vocab).unwrap();
    assert_eq!(statements.len(), 2);
    assert_eq!(statements[0].qualifiers.len(), 1);

    let config = Config::from_path(&config)
        .unwrap()
        .with_vocabulary_size(vocab.num_entities(), vocab.num_relations());
    let mc = config.model_config().unwrap();
    assert_eq!(mc.num_entities, 4);
    assert_eq!(mc.num_relations, 3);
    assert_eq!(mc.embedding_dim, 32);
    assert_relative_eq!(mc.alpha, 0.8);
}

#[test]
fn test_missing_file_is_io_error() {
    let mut vocab = Vocabulary::new();
    let err = load_statements("does/not/exist.csv", &mut vocab).unwrap_err();
    assert!(matches!(err, hyprel_kge::Error::Io(_)));
}

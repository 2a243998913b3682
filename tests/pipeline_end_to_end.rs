mod support;

use std::sync::Arc;

use support::{world_pipeline, BrokenRetriever, WorldLlm, test_config};
use ufo_rs::dataset::{load_samples, save_samples};
use ufo_rs::retrieve::RetrieverRegistry;
use ufo_rs::scoring::{aggregate, tally_sources, AggregationMode};
use ufo_rs::types::{Sample, NOANS};
use ufo_rs::{FactError, Pipeline};

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn dataset() -> Vec<Sample> {
    vec![
        Sample::new("The sky is blue. Cats are false dogs.", vec![]),
        Sample::new("", vec![]),
        Sample::new("Unknown thing.", vec!["ref".into()]),
    ]
}

#[tokio::test]
async fn full_run_fills_every_source_in_claim_order() {
    let samples = world_pipeline().run(dataset()).await.unwrap();

    assert_eq!(samples.len(), 3);
    let claims: Vec<Vec<&str>> = samples
        .iter()
        .map(|s| s.output.iter().map(|c| c.claim.as_str()).collect())
        .collect();
    assert_eq!(
        claims,
        vec![vec!["The sky is blue", "Cats are false dogs"], vec![], vec!["Unknown thing"]]
    );

    for record in samples.iter().flat_map(|s| &s.output) {
        assert_eq!(record.queries(), [record.claim.clone()]);
        for source in ["A", "B"] {
            let track = record.track(source).unwrap();
            assert_eq!(track.sources.as_ref().unwrap().len(), 1);
            assert_eq!(track.extractions.as_ref().unwrap().len(), 1);
            assert_eq!(track.details.as_ref().unwrap().len(), 1);
        }
    }
    let unknown = samples[2].output[0].track("A").unwrap();
    assert_eq!(unknown.extractions.as_ref().unwrap()[0].answer, NOANS);
}

#[tokio::test]
async fn ordered_and_unordered_scores() {
    let samples = world_pipeline().run(dataset()).await.unwrap();

    let ab = aggregate(&samples, AggregationMode::Ordered, &names(&["A", "B"]));
    assert_eq!(ab.sample_scores, vec![0.5, 0.0, 1.0]);
    assert_eq!(ab.judgments[0][1].source, "A");
    assert_eq!(ab.judgments[2][0].source, "B");

    let ba = aggregate(&samples, AggregationMode::Ordered, &names(&["B", "A"]));
    assert_eq!(ba.sample_scores, vec![1.0, 0.0, 1.0]);

    // tie between A (false) and B (true) goes to the first pooled source
    let pooled_ab = aggregate(&samples, AggregationMode::Unordered, &names(&["A", "B"]));
    assert_eq!(pooled_ab.sample_scores, vec![0.5, 0.0, 1.0]);
    let pooled_ba = aggregate(&samples, AggregationMode::Unordered, &names(&["B", "A"]));
    assert_eq!(pooled_ba.sample_scores, vec![1.0, 0.0, 1.0]);

    let only_a = aggregate(&samples, AggregationMode::Ordered, &names(&["A"]));
    assert_eq!(only_a.sample_scores, vec![0.5, 0.0, 0.0]);
    assert_eq!(only_a.judgments[2][0].source, NOANS);

    let tally = tally_sources(&ab.judgments, &names(&["A", "B"]));
    assert_eq!(tally["A"], [1, 1]);
    assert_eq!(tally["B"], [0, 1]);
    assert_eq!(tally[NOANS], [0, 0]);
}

#[tokio::test]
async fn saved_output_scores_the_same() {
    let samples = world_pipeline().run(dataset()).await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.jsonl");
    save_samples(&path, &samples).unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let first: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
    let claim = &first["output"][0];
    for key in ["claim", "queries", "A_sources", "A_extractions", "A_details", "B_details"] {
        assert!(claim.get(key).is_some(), "missing {key}");
    }

    let reloaded = load_samples(&path, None).unwrap();
    let sources = names(&["A", "B"]);
    assert_eq!(
        aggregate(&reloaded, AggregationMode::Ordered, &sources),
        aggregate(&samples, AggregationMode::Ordered, &sources)
    );
}

#[tokio::test]
async fn source_failure_aborts_the_run() {
    let registry = RetrieverRegistry::new().register("broken", Arc::new(BrokenRetriever));
    let pipeline = Pipeline::new(WorldLlm::new(), registry, &test_config());
    let err = pipeline.run(dataset()).await.unwrap_err();
    assert!(matches!(err, FactError::Retrieval { ref source_name, .. } if source_name == "broken"));
}

//! Integration tests for the Canopy engine
//!
//! These exercise the full pipeline (extraction, tracking, indexing and
//! recommendation) through the public API against both storage backends.

use canopy::models::{PreferenceType, SimilarityAlgorithm};
use canopy::{
    BehaviorTracker, ContentRecord, CorpusIndex, EngineConfig, EngineStorage, FeatureExtractor,
    FileStorage, InteractionAction, InteractionEvent, MemoryStorage, RecommendationEngine,
    SimilarityEngine, Strategy,
};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_test::assert_ok;

fn corpus() -> Vec<ContentRecord> {
    let items = [
        ("Solar panels", "Solar panels reduce carbon emissions and protect biodiversity", "energy"),
        ("Wind farms", "Renewable wind energy cuts emissions and pollution", "energy"),
        ("Bakery", "Local bakery opens new store downtown", "food"),
        ("Recycling", "Recycling plastic waste protects the ocean and wildlife", "waste"),
        ("Market", "Farmers market sells fresh bread and pastries", "food"),
        ("Concert", "Jazz band plays downtown on Friday night", "music"),
        ("Forests", "Reforestation restores habitat for endangered species", "nature"),
        ("Transit", "Electric buses improve air quality in the city", "transport"),
        ("Football", "Local team wins the championship final", "sports"),
        ("Composting", "Compost kitchen scraps to cut waste and feed the garden", "waste"),
    ];
    items
        .iter()
        .enumerate()
        .map(|(i, (title, body, category))| {
            ContentRecord::new(i as u64 + 1, *title, *body).with_categories([*category])
        })
        .collect()
}

async fn analyze(store: &dyn EngineStorage, records: &[ContentRecord]) {
    let extractor = FeatureExtractor::default();
    let corpus = CorpusIndex::build(&extractor, records);
    for record in records {
        assert_ok!(store.upsert_features(extractor.extract(record, &corpus)).await);
    }
}

#[tokio::test]
async fn test_solar_bakery_scenario() {
    let store = MemoryStorage::new();
    analyze(&store, &corpus()).await;
    let engine = SimilarityEngine::default();

    let solar = store.get_features(1).await.unwrap().unwrap();
    let bakery = store.get_features(3).await.unwrap().unwrap();

    assert!(solar.environmental_score > bakery.environmental_score);
    assert_eq!(bakery.environmental_score, 0.0);
    assert!(engine.similarity(&solar, &bakery, SimilarityAlgorithm::Environmental) < 0.2);
    assert_eq!(engine.similarity(&solar, &solar, SimilarityAlgorithm::Cosine), 1.0);

    let by_id = engine
        .similarity_by_id(&store, 3, 1, SimilarityAlgorithm::Environmental)
        .await
        .unwrap();
    assert_eq!(by_id, engine.similarity(&bakery, &solar, SimilarityAlgorithm::Environmental));

    // Missing operands score 0 rather than failing
    let missing = engine
        .similarity_by_id(&store, 1, 999, SimilarityAlgorithm::Hybrid)
        .await
        .unwrap();
    assert_eq!(missing, 0.0);
}

#[tokio::test]
async fn test_single_record_reanalysis_keeps_keyword_weights() {
    let store = MemoryStorage::new();
    let records = corpus();
    analyze(&store, &records).await;
    let before = store.get_features(1).await.unwrap().unwrap();

    let extractor = FeatureExtractor::default();
    let stored = store.get_all_features().await.unwrap();
    let edited = records[0].clone().with_tags(["rooftop"]);
    let corpus = CorpusIndex::with_stored(&extractor, &stored, [&edited]);
    let after = extractor.extract(&edited, &corpus);

    assert!(after.content_vector.get("keyword_solar") > 0.0);
    assert_eq!(
        after.content_vector.get("keyword_panels"),
        before.content_vector.get("keyword_panels")
    );
    assert_eq!(after.content_vector.get("tag_rooftop"), 1.0);
}

#[tokio::test]
async fn test_batch_index_on_ten_items() {
    let store = MemoryStorage::new();
    analyze(&store, &corpus()).await;
    let engine = SimilarityEngine::default();

    let report = engine.build_index_batch(&store, Some(1000), false).await.unwrap();
    assert!(report.complete);
    assert_eq!(report.evaluated, 45);
    assert!(report.stored <= 45);
    assert_eq!(report.stored + report.below_threshold + report.skipped_existing, 45);
    assert!(store.load_index_checkpoint().await.unwrap().is_none());

    let mut pairs = HashSet::new();
    for id in 1..=10 {
        for edge in store.get_edges_for(id).await.unwrap() {
            assert!(edge.content_a < edge.content_b);
            assert!(edge.score > engine.config().index_threshold && edge.score <= 1.0);
            pairs.insert(edge.key());
        }
    }
    assert_eq!(pairs.len(), store.count_similarity_edges().await.unwrap());
    assert!(pairs.len() <= 45);

    // A second pass finds every stored pair already indexed
    let rerun = engine.build_index_batch(&store, Some(1000), false).await.unwrap();
    assert_eq!(rerun.stored, 0);
    assert_eq!(rerun.skipped_existing, report.stored);
    assert_eq!(store.count_similarity_edges().await.unwrap(), pairs.len());
}

#[tokio::test]
async fn test_resumable_index_matches_single_pass() {
    let single = MemoryStorage::new();
    analyze(&single, &corpus()).await;
    let engine = SimilarityEngine::default();
    engine.build_index_batch(&single, Some(1000), false).await.unwrap();

    let chunked = MemoryStorage::new();
    analyze(&chunked, &corpus()).await;
    let mut batches = 0;
    let mut evaluated = 0;
    loop {
        let report = engine.build_index_batch(&chunked, Some(7), false).await.unwrap();
        batches += 1;
        evaluated += report.evaluated;
        if report.complete {
            break;
        }
        assert!(report.next_cursor.is_some());
        assert!(batches < 20, "index build did not converge");
    }
    assert_eq!(evaluated, 45);
    assert_eq!(batches, 7);

    let mut single_edges = Vec::new();
    let mut chunked_edges = Vec::new();
    for id in 1..=10 {
        for edge in single.get_edges_for(id).await.unwrap() {
            single_edges.push((edge.key(), edge.score));
        }
        for edge in chunked.get_edges_for(id).await.unwrap() {
            chunked_edges.push((edge.key(), edge.score));
        }
    }
    single_edges.sort_by(|a, b| a.0.cmp(&b.0));
    single_edges.dedup();
    chunked_edges.sort_by(|a, b| a.0.cmp(&b.0));
    chunked_edges.dedup();
    assert_eq!(single_edges, chunked_edges);
}

#[tokio::test]
async fn test_invalidate_and_recompute_edge() {
    let store = MemoryStorage::new();
    analyze(&store, &corpus()).await;
    let engine = SimilarityEngine::default();
    engine.build_index_batch(&store, None, false).await.unwrap();

    let before = store.get_edges_for(1).await.unwrap().len();
    let removed = engine.invalidate_content(&store, 1).await.unwrap();
    assert_eq!(removed, before);
    assert!(store.get_edges_for(1).await.unwrap().is_empty());

    // Solar and wind share category and environmental signal
    let edge = engine.compute_edge(&store, 2, 1).await.unwrap();
    let edge = edge.expect("related items clear the index threshold");
    assert_eq!(edge.key(), (1, 2));

    let neighbors = engine.find_similar_indexed(&store, 1, 5, 0.0).await.unwrap();
    assert_eq!(neighbors.len(), 1);
    assert_eq!(neighbors[0].content_id, 2);
}

#[tokio::test]
async fn test_dwell_time_example() {
    let store = Arc::new(MemoryStorage::new());
    let record = ContentRecord::new(1, "Solar roofs", "Solar roofs for every home")
        .with_categories(["solar"]);
    analyze(store.as_ref(), &[record]).await;
    let tracker = BehaviorTracker::new(store.clone(), EngineConfig::default().tracker);

    for _ in 0..5 {
        let event = InteractionEvent::new(7, 1, InteractionAction::View).with_duration(60.0);
        assert!(tracker.record(event).await.unwrap().is_applied());
    }

    let preferences = tracker.get_preferences(7).await.unwrap();
    let solar = preferences
        .iter()
        .find(|p| p.preference_type == PreferenceType::Category && p.preference_value == "solar")
        .expect("solar preference recorded");
    let weights = &tracker.config().action_weights;
    assert!(solar.weight > weights.view);
    assert!(solar.weight < weights.comment);
    assert_eq!(solar.interaction_count, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_records_lose_no_updates() {
    let store = Arc::new(MemoryStorage::new());
    let record = ContentRecord::new(1, "Wind", "Wind turbines").with_categories(["energy"]);
    analyze(store.as_ref(), &[record]).await;
    let tracker = Arc::new(BehaviorTracker::new(store.clone(), EngineConfig::default().tracker));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            tracker
                .record(InteractionEvent::new(3, 1, InteractionAction::Click))
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_applied());
    }

    let preferences = tracker.get_preferences(3).await.unwrap();
    let energy = preferences
        .iter()
        .find(|p| p.preference_value == "energy")
        .unwrap();
    assert_eq!(energy.interaction_count, 50);
    assert!((energy.weight - 2.0).abs() < 1e-9);
    assert_eq!(store.get_interactions(None).await.unwrap().len(), 50);
}

#[tokio::test]
async fn test_fallback_matches_trending() {
    let store = Arc::new(MemoryStorage::new());
    analyze(store.as_ref(), &corpus()).await;
    for (user, content, action) in [
        (2, 3, InteractionAction::View),
        (3, 3, InteractionAction::Share),
        (2, 6, InteractionAction::Like),
        (4, 9, InteractionAction::View),
    ] {
        store
            .record_interaction(InteractionEvent::new(user, content, action))
            .await
            .unwrap();
    }
    let engine = RecommendationEngine::from_config(store, &EngineConfig::default());

    let personalized = engine
        .recommend(1, Some(Strategy::Personalized), Some(5), &[])
        .await
        .unwrap();
    let trending = engine
        .recommend(1, Some(Strategy::Trending), Some(5), &[])
        .await
        .unwrap();

    assert!(personalized.fallback_used);
    assert!(!personalized.recommendations.is_empty());
    assert_eq!(personalized.recommendations, trending.recommendations);
}

#[tokio::test]
async fn test_file_store_end_to_end() {
    let temp_dir = TempDir::new().unwrap();

    {
        let store: Arc<dyn EngineStorage> =
            Arc::new(FileStorage::new(temp_dir.path()).await.unwrap());
        analyze(store.as_ref(), &corpus()).await;
        let tracker = BehaviorTracker::new(store.clone(), EngineConfig::default().tracker);
        assert_ok!(
            tracker
                .record(InteractionEvent::new(1, 1, InteractionAction::Bookmark))
                .await
        );
        let engine = SimilarityEngine::default();
        let report = engine.build_index_batch(store.as_ref(), Some(20), false).await.unwrap();
        assert!(!report.complete);
    }

    // Reopen: state and the index checkpoint survive
    let store: Arc<dyn EngineStorage> = Arc::new(FileStorage::new(temp_dir.path()).await.unwrap());
    assert_eq!(store.get_all_features().await.unwrap().len(), 10);
    assert!(!store.get_preferences(1).await.unwrap().is_empty());
    assert!(store.load_index_checkpoint().await.unwrap().is_some());

    let engine = SimilarityEngine::default();
    let report = engine.build_index_batch(store.as_ref(), Some(100), false).await.unwrap();
    assert!(report.complete);
    assert_eq!(report.evaluated, 25);

    let recommender = RecommendationEngine::from_config(store, &EngineConfig::default());
    let set = recommender
        .recommend(1, Some(Strategy::Environmental), Some(3), &[])
        .await
        .unwrap();
    assert!(set.recommendations.len() <= 3);
    assert!(set.recommendations.iter().all(|r| r.content_id != 1));
}

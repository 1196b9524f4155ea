mod common;

use common::{
    pipeline, plan_json, search_result, test_config, FailingEngine, RoutedGenerator, StaticEngine,
};
use research_flow::agents::MessageType;
use research_flow::models::EngineId;
use research_flow::tools::{EngineSet, UnavailableGenerator};
use research_flow::ResearchError;
use std::sync::Arc;

#[tokio::test]
async fn photosynthesis_survives_missing_generation_and_sparse_engines() {
    let general = StaticEngine::new(vec![
        search_result(
            "Photosynthesis basics",
            "https://example.com/photosynthesis",
            "How plants turn light into sugar",
            0.8,
        ),
        search_result(
            "Light reactions explained",
            "https://www.example.org/light-reactions/",
            "A beginner guide to the light reactions",
            0.7,
        ),
    ]);
    let academic = StaticEngine::new(vec![search_result(
        "Chloroplast electron transport",
        "https://biology.mit.edu/chloroplast",
        "Electron transport in the thylakoid membrane",
        0.9,
    )]);
    let community = StaticEngine::empty();
    let video = StaticEngine::empty();
    let engines = EngineSet::new()
        .with(EngineId::General, general.clone())
        .with(EngineId::Academic, academic.clone())
        .with(EngineId::Community, community.clone())
        .with(EngineId::Video, video.clone());

    let config = test_config(3);
    let pipeline = pipeline(Arc::new(UnavailableGenerator), engines, &config);
    let report = pipeline.run("photosynthesis", None, None).await.unwrap();

    let plan = &report.plan;
    for engine in EngineId::MANDATORY {
        assert!(plan.count_for(engine) >= 5, "{} is short", engine);
    }
    assert_eq!(
        plan.engine_distribution.values().sum::<usize>(),
        plan.research_queries.len()
    );

    // fallback community and video queries still went out
    assert!(community.calls() >= 5);
    assert!(video.calls() >= 5);
    assert!(academic.calls() >= 1);

    assert_eq!(report.results.len(), 3);
    assert!(report.results.iter().any(|r| r.engine == EngineId::General));
    assert!(report.results.iter().all(|r| r.practical_weight.is_some()));
    assert!(!report.synthesis.key_insights.is_empty());

    for task in ["planner", "executor", "synthesizer", "extractor"] {
        assert!(report.task_times.contains_key(task), "missing time for {}", task);
    }

    let comms = pipeline.communication();
    assert!(comms.agent_health("general-search-agent").is_some());
    assert!(comms.agent_health("research-planner").is_some());
    let history = comms.message_history(Some(report.session_id.as_str()));
    assert!(history.iter().any(|m| m.message_type == MessageType::TaskAssignment));
    assert!(history.iter().any(|m| m.message_type == MessageType::Coordination));
}

#[tokio::test]
async fn all_engines_failing_is_a_coverage_error() {
    let general = FailingEngine::new();
    let mut engines = EngineSet::new().with(EngineId::General, general.clone());
    for engine in [
        EngineId::Academic,
        EngineId::Video,
        EngineId::Community,
        EngineId::Computational,
    ] {
        engines.insert(engine, FailingEngine::new());
    }

    let config = test_config(5);
    let pipeline = pipeline(Arc::new(UnavailableGenerator), engines, &config);
    let err = pipeline.run("photosynthesis", None, None).await.unwrap_err();

    assert!(err.is_coverage_failure(), "unexpected error: {}", err);
    assert!(matches!(err, ResearchError::CriticalEnginesUnavailable { .. }));
    assert!(general.calls() >= 3);
    assert!(pipeline.breakers().is_open("general"));
}

#[tokio::test]
async fn empty_engines_are_not_silently_accepted() {
    let mut engines = EngineSet::new();
    for engine in EngineId::ALL {
        engines.insert(engine, StaticEngine::empty());
    }

    let config = test_config(5);
    let pipeline = pipeline(Arc::new(UnavailableGenerator), engines, &config);
    let err = pipeline.run("photosynthesis", None, None).await.unwrap_err();

    assert!(matches!(
        err,
        ResearchError::InsufficientCoverage { total: 0, general: 0, minimum: 5 }
    ));
}

#[tokio::test]
async fn generated_plan_and_subtopics_flow_through() {
    let generator = RoutedGenerator {
        plan: plan_json("photosynthesis"),
        synthesis: "Key insights:\n- A practical guide to leaves\n- Chlorophyll absorbs light\nThemes:\n- Light reactions\n- Calvin cycle".to_string(),
        subtopics: r#"{"subtopics": [
            {"title": "Light reactions", "description": "Capturing light energy", "difficulty": "beginner"},
            {"title": "Calvin cycle", "prerequisites": ["Light reactions"], "keyTerms": ["rubisco"]}
        ]}"#
        .to_string(),
    };
    let engines = EngineSet::new()
        .with(
            EngineId::General,
            StaticEngine::new(vec![
                search_result("Light reactions explained", "https://a.com/light", "Photons split water", 0.8),
                search_result("The Calvin cycle step by step", "https://a.com/calvin", "Carbon fixation", 0.7),
            ]),
        )
        .with(
            EngineId::Community,
            StaticEngine::new(vec![search_result(
                "Calvin cycle tips",
                "https://forum.example.com/calvin",
                "Remember rubisco",
                0.6,
            )]),
        )
        .with(EngineId::Video, StaticEngine::empty())
        .with(EngineId::Academic, StaticEngine::empty());

    let config = test_config(3);
    let pipeline = pipeline(Arc::new(generator), engines, &config);
    let report = pipeline.run("photosynthesis", None, None).await.unwrap();

    assert_eq!(report.plan.research_strategy, "broad then deep");
    assert_eq!(report.plan.research_queries.len(), 16);
    assert_eq!(report.synthesis.key_insights[0], "A practical guide to leaves");
    assert_eq!(report.synthesis.content_themes, vec!["Light reactions", "Calvin cycle"]);

    let calvin = report
        .subtopics
        .flat
        .iter()
        .find(|s| s.title == "Calvin cycle")
        .unwrap();
    assert_eq!(calvin.parent_id.as_deref(), Some("light-reactions"));
    assert_eq!(calvin.level, 2);
    assert_eq!(calvin.metadata.key_terms, vec!["rubisco"]);
    assert_eq!(report.subtopics.hierarchy.len(), 1);
    assert_eq!(report.subtopics.hierarchy[0].description, "Capturing light energy");
}

#[tokio::test]
async fn blank_topic_is_rejected() {
    let config = test_config(5);
    let pipeline = pipeline(Arc::new(UnavailableGenerator), EngineSet::new(), &config);
    let err = pipeline.run("   ", None, None).await.unwrap_err();
    assert!(matches!(err, ResearchError::InvalidInput(_)));
}

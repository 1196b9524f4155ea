use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::agents::SystemHealth;

/// A named external search provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineId {
    General,
    Academic,
    Video,
    Community,
    Computational,
}

impl EngineId {
    pub const ALL: [EngineId; 5] = [
        EngineId::General,
        EngineId::Academic,
        EngineId::Video,
        EngineId::Community,
        EngineId::Computational,
    ];

    /// Engines every plan must carry at least the mandatory minimum of.
    pub const MANDATORY: [EngineId; 3] = [EngineId::General, EngineId::Community, EngineId::Video];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineId::General => "general",
            EngineId::Academic => "academic",
            EngineId::Video => "video",
            EngineId::Community => "community",
            EngineId::Computational => "computational",
        }
    }

    /// General search provides baseline coverage; everything else is enrichment.
    pub fn is_critical(&self) -> bool {
        matches!(self, EngineId::General)
    }

    pub fn agent_name(&self) -> String {
        format!("{}-search-agent", self.as_str())
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchQuery {
    pub query: String,
    pub engine: EngineId,
    pub reasoning: String,
}

impl ResearchQuery {
    pub fn new(query: impl Into<String>, engine: EngineId, reasoning: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            engine,
            reasoning: reasoning.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchPlan {
    pub research_queries: Vec<ResearchQuery>,
    pub research_strategy: String,
    pub expected_outcomes: Vec<String>,
    pub engine_distribution: BTreeMap<EngineId, usize>,
}

impl ResearchPlan {
    pub fn new(
        research_queries: Vec<ResearchQuery>,
        research_strategy: impl Into<String>,
        expected_outcomes: Vec<String>,
    ) -> Self {
        let engine_distribution = count_engines(&research_queries);
        Self {
            research_queries,
            research_strategy: research_strategy.into(),
            expected_outcomes,
            engine_distribution,
        }
    }

    pub fn count_for(&self, engine: EngineId) -> usize {
        self.research_queries
            .iter()
            .filter(|q| q.engine == engine)
            .count()
    }

    pub fn recompute_distribution(&mut self) {
        self.engine_distribution = count_engines(&self.research_queries);
    }
}

pub fn count_engines(queries: &[ResearchQuery]) -> BTreeMap<EngineId, usize> {
    let mut distribution = BTreeMap::new();
    for query in queries {
        *distribution.entry(query.engine).or_insert(0) += 1;
    }
    distribution
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub relevance_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResultWithEngine {
    #[serde(flatten)]
    pub result: SearchResult,
    pub engine: EngineId,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub practical_weight: Option<f64>,
}

impl SearchResultWithEngine {
    pub fn new(result: SearchResult, engine: EngineId, reasoning: impl Into<String>) -> Self {
        Self {
            result,
            engine,
            reasoning: reasoning.into(),
            practical_weight: None,
        }
    }

    /// Title and snippet joined, lowercased, for keyword matching.
    pub fn searchable_text(&self) -> String {
        format!("{} {}", self.result.title, self.result.snippet).to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisResult {
    pub key_insights: Vec<String>,
    pub content_themes: Vec<String>,
    pub source_quality: Rating,
    pub comprehensiveness: f64,
    pub practical_focus: Rating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Basic,
    Intermediate,
    Advanced,
}

/// Upstream classification of a topic consumed by planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicUnderstanding {
    pub definition: String,
    pub category: String,
    pub complexity: Complexity,
    #[serde(default)]
    pub recommended_engines: Vec<EngineId>,
    #[serde(default)]
    pub research_approach: String,
}

impl TopicUnderstanding {
    /// Keyword classification for callers that have no upstream understanding.
    pub fn infer(topic: &str) -> Self {
        let lower = topic.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        let mut recommended_engines = vec![EngineId::General, EngineId::Video, EngineId::Community];
        let category = if has(&["math", "equation", "calculus", "algebra", "statistics", "physics"]) {
            recommended_engines.push(EngineId::Computational);
            recommended_engines.push(EngineId::Academic);
            "mathematics"
        } else if has(&["biology", "chemistry", "synthesis", "cell", "gene", "quantum", "photo"]) {
            recommended_engines.push(EngineId::Academic);
            "science"
        } else if has(&["programming", "software", "rust", "python", "code", "algorithm"]) {
            "technology"
        } else {
            "general"
        };

        let complexity = if has(&["advanced", "theory", "quantum", "research"]) {
            Complexity::Advanced
        } else if has(&["intro", "basic", "beginner"]) {
            Complexity::Basic
        } else {
            Complexity::Intermediate
        };

        Self {
            definition: format!("Study of {}", topic.trim()),
            category: category.to_string(),
            complexity,
            recommended_engines,
            research_approach: "broad practical overview supported by specialized sources"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearnerLevel {
    Beginner,
    Intermediate,
    Advanced,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    #[serde(default)]
    pub level: Option<LearnerLevel>,
    #[serde(default)]
    pub focus_areas: Vec<String>,
    #[serde(default)]
    pub exclude_areas: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

impl Difficulty {
    pub fn harder(self) -> Self {
        match self {
            Difficulty::Beginner => Difficulty::Intermediate,
            _ => Difficulty::Advanced,
        }
    }

    pub fn easier(self) -> Self {
        match self {
            Difficulty::Advanced => Difficulty::Intermediate,
            _ => Difficulty::Beginner,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtopicMetadata {
    pub confidence: f64,
    pub difficulty: Difficulty,
    pub estimated_time_minutes: u32,
    pub prerequisites: Vec<String>,
    pub related_concepts: Vec<String>,
    pub source_agents: Vec<String>,
    pub key_terms: Vec<String>,
    pub practical_applications: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedSubtopic {
    pub id: String,
    pub title: String,
    pub description: String,
    pub level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ExtractedSubtopic>,
    pub metadata: SubtopicMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipKind {
    Prerequisite,
    Component,
    Related,
    Application,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRelationship {
    pub from: String,
    pub to: String,
    pub kind: RelationshipKind,
    pub strength: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageMetrics {
    pub academic: f64,
    pub practical: f64,
    pub foundational: f64,
    pub advanced: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub main_topic: String,
    pub hierarchy: Vec<ExtractedSubtopic>,
    pub flat: Vec<ExtractedSubtopic>,
    pub relationships: Vec<TopicRelationship>,
    pub cycles: Vec<Vec<String>>,
    pub coverage: CoverageMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchRequest {
    pub topic: String,
    #[serde(default)]
    pub understanding: Option<TopicUnderstanding>,
    #[serde(default)]
    pub user_context: Option<UserContext>,
}

/// Shared state threaded through the research graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchContext {
    pub topic: String,
    pub understanding: TopicUnderstanding,
    pub user_context: Option<UserContext>,
    pub plan: Option<ResearchPlan>,
    pub results: Vec<SearchResultWithEngine>,
    pub synthesis: Option<SynthesisResult>,
    pub subtopics: Option<ExtractionResult>,
}

impl ResearchContext {
    pub fn new(
        topic: impl Into<String>,
        understanding: TopicUnderstanding,
        user_context: Option<UserContext>,
    ) -> Self {
        Self {
            topic: topic.into(),
            understanding,
            user_context,
            plan: None,
            results: vec![],
            synthesis: None,
            subtopics: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchReport {
    pub session_id: String,
    pub topic: String,
    pub plan: ResearchPlan,
    pub results: Vec<SearchResultWithEngine>,
    pub synthesis: SynthesisResult,
    pub subtopics: ExtractionResult,
    pub system_health: SystemHealth,
    pub total_time_ms: u64,
    pub task_times: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_tracks_queries() {
        let mut plan = ResearchPlan::new(
            vec![
                ResearchQuery::new("a", EngineId::General, "r"),
                ResearchQuery::new("b", EngineId::General, "r"),
                ResearchQuery::new("c", EngineId::Video, "r"),
            ],
            "strategy",
            vec![],
        );
        assert_eq!(plan.engine_distribution.get(&EngineId::General), Some(&2));
        assert_eq!(plan.engine_distribution.get(&EngineId::Video), Some(&1));

        plan.research_queries
            .push(ResearchQuery::new("d", EngineId::Community, "r"));
        plan.recompute_distribution();
        assert_eq!(plan.engine_distribution.values().sum::<usize>(), 4);
    }

    #[test]
    fn plan_serializes_with_engine_keys() {
        let plan = ResearchPlan::new(
            vec![ResearchQuery::new("a", EngineId::Academic, "r")],
            "s",
            vec!["o".to_string()],
        );
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["engineDistribution"]["academic"], 1);
        assert_eq!(json["researchQueries"][0]["engine"], "academic");

        let back: ResearchPlan = serde_json::from_value(json).unwrap();
        assert_eq!(back.count_for(EngineId::Academic), 1);
    }

    #[test]
    fn search_result_flattens_base_fields() {
        let tagged = SearchResultWithEngine::new(
            SearchResult {
                id: "1".into(),
                title: "Title".into(),
                url: "https://example.com".into(),
                snippet: "Snippet".into(),
                relevance_score: 0.5,
            },
            EngineId::General,
            "why",
        );
        let json = serde_json::to_value(&tagged).unwrap();
        assert_eq!(json["relevanceScore"], 0.5);
        assert_eq!(json["engine"], "general");
        assert!(json.get("practicalWeight").is_none());
    }

    #[test]
    fn infer_recommends_academic_for_science() {
        let understanding = TopicUnderstanding::infer("photosynthesis");
        assert_eq!(understanding.category, "science");
        assert!(understanding.recommended_engines.contains(&EngineId::Academic));
    }
}

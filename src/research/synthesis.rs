use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::agents::{AgentCommunicationManager, MessageType, SYNTHESIS_AGENT};
use crate::config::{millis, SynthesisConfig};
use crate::models::{EngineId, Rating, SearchResultWithEngine, SynthesisResult};
use crate::research::text::{practical_match_count, token_set, tokenize};
use crate::tools::llm::generate_within;
use crate::tools::TextGenerator;

const CREDIBLE_DOMAINS: &[&str] = &[".edu", ".gov"];

pub fn engine_multiplier(engine: EngineId) -> f64 {
    match engine {
        EngineId::General => 1.3,
        EngineId::Community => 1.2,
        EngineId::Academic => 1.1,
        EngineId::Video | EngineId::Computational => 1.0,
    }
}

/// Relevance adjusted toward accessible, practical sources. Never above 1.0.
pub fn practical_weight(result: &SearchResultWithEngine) -> f64 {
    let matches = practical_match_count(&result.searchable_text()) as f64;
    let weight =
        result.result.relevance_score * engine_multiplier(result.engine) * (1.0 + 0.1 * matches);
    weight.clamp(0.0, 1.0)
}

pub fn apply_practical_weighting(results: &mut [SearchResultWithEngine]) {
    for result in results.iter_mut() {
        result.practical_weight = Some(practical_weight(result));
    }
}

fn weight_of(result: &SearchResultWithEngine) -> f64 {
    result
        .practical_weight
        .unwrap_or(result.result.relevance_score)
}

/// Results sorted by descending weight; ties keep their input order.
pub fn rank_by_weight(results: &[SearchResultWithEngine]) -> Vec<&SearchResultWithEngine> {
    let mut ranked: Vec<_> = results.iter().collect();
    ranked.sort_by(|a, b| {
        weight_of(b)
            .partial_cmp(&weight_of(a))
            .unwrap_or(Ordering::Equal)
    });
    ranked
}

fn fraction(results: &[SearchResultWithEngine], pred: impl Fn(&SearchResultWithEngine) -> bool) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().filter(|r| pred(r)).count() as f64 / results.len() as f64
}

fn is_credible(result: &SearchResultWithEngine) -> bool {
    let url = result.result.url.to_lowercase();
    result.engine == EngineId::Academic || CREDIBLE_DOMAINS.iter().any(|d| url.contains(d))
}

fn is_accessible(result: &SearchResultWithEngine) -> bool {
    matches!(result.engine, EngineId::General | EngineId::Community)
}

pub fn calculate_source_quality(results: &[SearchResultWithEngine]) -> Rating {
    if results.is_empty() {
        return Rating::Low;
    }
    let relevance =
        results.iter().map(|r| r.result.relevance_score).sum::<f64>() / results.len() as f64;
    let balance = (fraction(results, is_credible) + fraction(results, is_accessible)) / 2.0;

    if relevance > 0.7 && balance > 0.4 {
        Rating::High
    } else if relevance > 0.5 && balance > 0.25 {
        Rating::Medium
    } else {
        Rating::Low
    }
}

pub fn calculate_practical_comprehensiveness(results: &[SearchResultWithEngine]) -> f64 {
    let engines: HashSet<EngineId> = results.iter().map(|r| r.engine).collect();
    let diversity = engines.len() as f64 / EngineId::ALL.len() as f64;
    let volume = (results.len() as f64 / 20.0).min(1.0);
    let general = results
        .iter()
        .filter(|r| r.engine == EngineId::General)
        .count();
    let baseline = (general as f64 / 5.0).min(1.0);
    0.4 * diversity + 0.4 * volume + 0.2 * baseline
}

pub fn calculate_practical_focus(results: &[SearchResultWithEngine]) -> Rating {
    let accessible = fraction(results, is_accessible);
    let practical = fraction(results, |r| practical_match_count(&r.searchable_text()) > 0);
    let score = (accessible + practical) / 2.0;
    if score >= 0.6 {
        Rating::High
    } else if score >= 0.3 {
        Rating::Medium
    } else {
        Rating::Low
    }
}

/// Text of a bullet or numbered line, without its marker.
fn strip_bullet(line: &str) -> Option<&str> {
    let line = line.trim();
    for marker in ["- ", "* ", "• "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return Some(rest.trim());
        }
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return Some(rest.trim());
        }
    }
    None
}

fn clean(item: &str) -> String {
    item.trim_matches(|c: char| c == '*' || c == '_' || c.is_whitespace())
        .to_string()
}

/// Splits generation output into `(insights, themes)`.
///
/// Bullets under a heading mentioning "theme" are themes, every other
/// bullet is an insight.
pub fn parse_synthesis_text(text: &str) -> (Vec<String>, Vec<String>) {
    let mut insights = Vec::new();
    let mut themes = Vec::new();
    let mut in_themes = false;

    for line in text.lines() {
        match strip_bullet(line) {
            Some(item) => {
                let item = clean(item);
                if item.is_empty() {
                    continue;
                }
                if in_themes {
                    themes.push(item);
                } else {
                    insights.push(item);
                }
            }
            None => {
                let heading = line.trim().to_lowercase();
                if heading.is_empty() {
                    continue;
                }
                if heading.contains("theme") {
                    in_themes = true;
                } else if heading.contains("insight") {
                    in_themes = false;
                }
            }
        }
    }
    (insights, themes)
}

/// Practical-marker lines first, then the rest, capped at `max`.
fn select_insights(candidates: Vec<String>, max: usize) -> Vec<String> {
    let (practical, other): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|line| practical_match_count(&line.to_lowercase()) > 0);
    practical.into_iter().chain(other).take(max).collect()
}

fn fallback_insights(ranked: &[&SearchResultWithEngine], max: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    ranked
        .iter()
        .map(|r| r.result.title.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.to_lowercase()))
        .take(max)
        .collect()
}

/// Most frequent title terms outside the topic itself.
fn fallback_themes(topic: &str, ranked: &[&SearchResultWithEngine], max: usize) -> Vec<String> {
    let topic_terms = token_set(topic);
    let mut counts: HashMap<String, usize> = HashMap::new();
    for result in ranked {
        let terms: BTreeSet<String> = tokenize(&result.result.title).into_iter().collect();
        for term in terms {
            if !topic_terms.contains(&term) {
                *counts.entry(term).or_default() += 1;
            }
        }
    }
    let mut terms: Vec<(String, usize)> = counts.into_iter().collect();
    terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    terms.into_iter().take(max).map(|(t, _)| t).collect()
}

pub struct SynthesisModule {
    generator: Arc<dyn TextGenerator>,
    config: SynthesisConfig,
    comms: Option<Arc<AgentCommunicationManager>>,
}

impl SynthesisModule {
    pub fn new(generator: Arc<dyn TextGenerator>, config: SynthesisConfig) -> Self {
        Self {
            generator,
            config,
            comms: None,
        }
    }

    pub fn with_communication(mut self, comms: Arc<AgentCommunicationManager>) -> Self {
        self.comms = Some(comms);
        self
    }

    /// Weights `results` in place and summarizes them.
    ///
    /// Generation failure only costs the free-text part: insights and themes
    /// are then derived from the ranked results.
    #[instrument(skip(self, results), fields(results = results.len()))]
    pub async fn synthesize(
        &self,
        topic: &str,
        results: &mut [SearchResultWithEngine],
    ) -> SynthesisResult {
        let started = Instant::now();
        apply_practical_weighting(results);
        let ranked = rank_by_weight(results);
        let context: Vec<&SearchResultWithEngine> =
            ranked.iter().take(self.config.context_size).copied().collect();
        let max = self.config.max_insights;

        let prompt = self.build_prompt(topic, &context);
        let generated = generate_within(
            self.generator.as_ref(),
            &prompt,
            self.config.temperature,
            millis(self.config.generation_timeout_ms),
        )
        .await;

        let (mut insights, mut themes) = match &generated {
            Ok(text) => {
                let (insights, themes) = parse_synthesis_text(text);
                debug!(insights = insights.len(), themes = themes.len(), "Parsed synthesis output");
                (select_insights(insights, max), themes)
            }
            Err(e) => {
                warn!(error = %e, "Synthesis generation failed, deriving insights from results");
                (Vec::new(), Vec::new())
            }
        };
        if insights.is_empty() {
            insights = fallback_insights(&context, max);
        }
        if themes.is_empty() {
            themes = fallback_themes(topic, &context, max);
        }
        themes.truncate(max);

        let synthesis = SynthesisResult {
            key_insights: insights,
            content_themes: themes,
            source_quality: calculate_source_quality(results),
            comprehensiveness: calculate_practical_comprehensiveness(results),
            practical_focus: calculate_practical_focus(results),
        };
        info!(
            quality = ?synthesis.source_quality,
            focus = ?synthesis.practical_focus,
            comprehensiveness = synthesis.comprehensiveness,
            "Synthesis complete"
        );

        if let Some(comms) = &self.comms {
            let error = generated.as_ref().err().map(|e| e.to_string());
            // the stage always produces a result; generation errors are kept for inspection
            comms.record_agent_execution(
                SYNTHESIS_AGENT,
                true,
                started.elapsed(),
                synthesis.key_insights.len(),
                error.as_deref(),
            );
            comms.send_message(
                MessageType::TaskResult,
                serde_json::json!({
                    "stage": "synthesis",
                    "insights": synthesis.key_insights.len(),
                    "themes": synthesis.content_themes.len(),
                    "sourceQuality": synthesis.source_quality,
                }),
                Some(SYNTHESIS_AGENT),
                None,
            );
        }
        synthesis
    }

    fn build_prompt(&self, topic: &str, context: &[&SearchResultWithEngine]) -> String {
        let sources = context
            .iter()
            .enumerate()
            .map(|(i, r)| {
                format!(
                    "{}. [{}] {} | {} ({})",
                    i + 1,
                    r.engine,
                    r.result.title,
                    r.result.snippet,
                    r.result.url
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "You are synthesizing research about \"{topic}\" for a learner.\n\
             Sources:\n{sources}\n\n\
             Respond with two sections.\n\
             Key insights:\n- up to {max} practical, accessible insights as bullet points\n\
             Themes:\n- up to {max} short content themes as bullet points",
            max = self.config.max_insights
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::models::SearchResult;
    use crate::tools::UnavailableGenerator;
    use async_trait::async_trait;

    fn result(engine: EngineId, title: &str, url: &str, score: f64) -> SearchResultWithEngine {
        SearchResultWithEngine::new(
            SearchResult {
                id: title.to_string(),
                title: title.to_string(),
                url: url.to_string(),
                snippet: String::new(),
                relevance_score: score,
            },
            engine,
            "test",
        )
    }

    struct Canned(&'static str);

    #[async_trait]
    impl TextGenerator for Canned {
        async fn generate(&self, _prompt: &str, _temperature: f64) -> Result<String, GenerationError> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn weighting_boosts_practical_general_sources() {
        let mut results = vec![
            result(EngineId::General, "A beginner guide", "https://a.com", 0.5),
            result(EngineId::Video, "Lecture 4", "https://v.com", 0.9),
            result(EngineId::General, "Deep dive", "https://b.com", 0.9),
        ];
        apply_practical_weighting(&mut results);

        let first = results[0].practical_weight.unwrap();
        assert!((first - 0.5 * 1.3 * 1.2).abs() < 1e-9);
        assert_eq!(results[1].practical_weight, Some(0.9));
        assert_eq!(results[2].practical_weight, Some(1.0));

        let ranked = rank_by_weight(&results);
        assert_eq!(ranked[0].result.title, "Deep dive");
        assert_eq!(ranked[2].result.title, "A beginner guide");
    }

    #[test]
    fn comprehensiveness_grows_with_diversity_and_general_sources() {
        let base = vec![
            result(EngineId::General, "a", "https://a.com", 0.5),
            result(EngineId::General, "b", "https://b.com", 0.5),
            result(EngineId::Academic, "c", "https://c.edu", 0.5),
        ];
        let score = calculate_practical_comprehensiveness(&base);
        assert!((score - 0.30).abs() < 1e-9);

        let mut diverse = base.clone();
        diverse.push(result(EngineId::Video, "d", "https://d.com", 0.5));
        let mut more_general = base.clone();
        more_general.push(result(EngineId::General, "e", "https://e.com", 0.5));

        assert!(calculate_practical_comprehensiveness(&diverse) > score);
        assert!(calculate_practical_comprehensiveness(&more_general) > score);
        assert_eq!(calculate_practical_comprehensiveness(&[]), 0.0);
    }

    #[test]
    fn source_quality_blends_relevance_and_balance() {
        let academic = vec![result(EngineId::Academic, "paper", "https://mit.edu/p", 0.8)];
        assert_eq!(calculate_source_quality(&academic), Rating::High);

        let general = vec![result(EngineId::General, "post", "https://blog.com", 0.6)];
        assert_eq!(calculate_source_quality(&general), Rating::Medium);

        let weak = vec![result(EngineId::Video, "clip", "https://v.com", 0.9)];
        assert_eq!(calculate_source_quality(&weak), Rating::Low);
        assert_eq!(calculate_source_quality(&[]), Rating::Low);
    }

    #[test]
    fn practical_focus_thresholds() {
        let practical = vec![result(EngineId::Community, "Step by step tutorial", "https://r.com", 0.5)];
        assert_eq!(calculate_practical_focus(&practical), Rating::High);

        let mixed = vec![
            result(EngineId::General, "Overview", "https://a.com", 0.5),
            result(EngineId::Video, "Lecture", "https://v.com", 0.5),
        ];
        assert_eq!(calculate_practical_focus(&mixed), Rating::Low);

        let half = vec![result(EngineId::General, "Overview", "https://a.com", 0.5)];
        assert_eq!(calculate_practical_focus(&half), Rating::Medium);
    }

    #[test]
    fn parses_insight_and_theme_sections() {
        let text = "Key insights:\n\
                    1. Chlorophyll absorbs red and blue light\n\
                    2. **A practical example: leaves in shade**\n\
                    Themes:\n\
                    - Light reactions\n\
                    * Calvin cycle\n";
        let (insights, themes) = parse_synthesis_text(text);
        assert_eq!(insights.len(), 2);
        assert_eq!(insights[1], "A practical example: leaves in shade");
        assert_eq!(themes, vec!["Light reactions", "Calvin cycle"]);

        let selected = select_insights(insights, 5);
        assert_eq!(selected[0], "A practical example: leaves in shade");
    }

    #[tokio::test]
    async fn synthesis_uses_generated_sections() {
        let module = SynthesisModule::new(
            Arc::new(Canned("Insights:\n- How to grow plants indoors\n- Light matters\nThemes:\n- Energy")),
            SynthesisConfig::default(),
        );
        let mut results = vec![result(EngineId::General, "Photosynthesis basics", "https://a.com", 0.7)];

        let synthesis = module.synthesize("photosynthesis", &mut results).await;
        assert_eq!(synthesis.key_insights[0], "How to grow plants indoors");
        assert_eq!(synthesis.content_themes, vec!["Energy"]);
        assert!(results[0].practical_weight.is_some());
    }

    #[tokio::test]
    async fn synthesis_survives_unavailable_generation() {
        let module = SynthesisModule::new(Arc::new(UnavailableGenerator), SynthesisConfig::default());
        let mut results = vec![
            result(EngineId::General, "Photosynthesis light reactions", "https://a.com", 0.9),
            result(EngineId::Academic, "Light reactions in chloroplasts", "https://b.edu", 0.6),
        ];

        let synthesis = module.synthesize("photosynthesis", &mut results).await;
        assert_eq!(synthesis.key_insights.len(), 2);
        assert_eq!(synthesis.content_themes[0], "light");
        assert!(!synthesis.content_themes.contains(&"photosynthesis".to_string()));
    }
}

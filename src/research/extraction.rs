use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::agents::{AgentCommunicationManager, MessageType, EXTRACTION_AGENT};
use crate::config::{millis, ExtractionConfig};
use crate::error::{ResearchError, Result};
use crate::models::{
    CoverageMetrics, Difficulty, EngineId, ExtractedSubtopic, ExtractionResult, LearnerLevel,
    RelationshipKind, SearchResultWithEngine, SubtopicMetadata, SynthesisResult,
    TopicRelationship, UserContext,
};
use crate::research::text::{jaccard, normalize_title, practical_match_count, slugify, token_set, tokenize};
use crate::tools::llm::generate_structured_within;
use crate::tools::TextGenerator;

const FOUNDATIONAL_MARKERS: &[&str] = &[
    "basics", "introduction", "intro", "fundamentals", "overview", "beginner", "principles",
];
const ADVANCED_MARKERS: &[&str] = &[
    "advanced", "mechanism", "mechanisms", "kinetics", "molecular", "quantum", "theory",
    "research", "optimization",
];
const APPLICATION_MARKERS: &[&str] = &[
    "application", "applications", "uses", "use", "practice", "industry", "real-world", "examples",
];

const MAX_CANDIDATES: usize = 40;
const MAX_TITLE_WORDS: usize = 8;
const AI_PREREQUISITE_STRENGTH: f64 = 0.9;
const RELATED_THRESHOLD: f64 = 0.2;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiSubtopic {
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    difficulty: Option<Difficulty>,
    #[serde(default)]
    key_terms: Vec<String>,
    #[serde(default)]
    prerequisites: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AiExtraction {
    subtopics: Vec<AiSubtopic>,
}

#[derive(Debug, Clone)]
struct Candidate {
    title: String,
    description: Option<String>,
    /// Title terms outside the main topic, in title order.
    terms: Vec<String>,
    tokens: HashSet<String>,
    /// `tokens` without foundational markers; used for graph comparison.
    core: HashSet<String>,
    from_theme: bool,
    from_ai: bool,
    difficulty_hint: Option<Difficulty>,
    key_terms: Vec<String>,
    prerequisite_titles: Vec<String>,
}

fn has_marker(tokens: &HashSet<String>, markers: &[&str]) -> bool {
    tokens.iter().any(|t| markers.contains(&t.as_str()))
}

impl Candidate {
    fn new(title: &str, topic_terms: &HashSet<String>) -> Option<Self> {
        let title = title.trim().trim_end_matches(['.', ':', ';']).trim();
        let mut seen = HashSet::new();
        let terms: Vec<String> = tokenize(title)
            .into_iter()
            .filter(|t| !topic_terms.contains(t) && seen.insert(t.clone()))
            .collect();
        if terms.is_empty() {
            return None;
        }
        let tokens: HashSet<String> = terms.iter().cloned().collect();
        let core = tokens
            .iter()
            .filter(|t| !FOUNDATIONAL_MARKERS.contains(&t.as_str()))
            .cloned()
            .collect();
        Some(Self {
            title: title.to_string(),
            description: None,
            terms,
            tokens,
            core,
            from_theme: false,
            from_ai: false,
            difficulty_hint: None,
            key_terms: Vec::new(),
            prerequisite_titles: Vec::new(),
        })
    }

    fn is_foundational(&self) -> bool {
        has_marker(&self.tokens, FOUNDATIONAL_MARKERS)
    }

    fn is_advanced(&self) -> bool {
        has_marker(&self.tokens, ADVANCED_MARKERS)
    }

    fn is_application(&self) -> bool {
        has_marker(&self.tokens, APPLICATION_MARKERS)
    }
}

/// Directed edge between candidate indices. For hierarchical kinds `from`
/// comes first in a learning order.
#[derive(Debug, Clone, Copy)]
struct Edge {
    from: usize,
    to: usize,
    kind: RelationshipKind,
    strength: f64,
}

impl Edge {
    fn is_hierarchical(&self) -> bool {
        matches!(
            self.kind,
            RelationshipKind::Prerequisite | RelationshipKind::Component
        )
    }
}

/// Heuristic directed relationship `a -> b`, if any.
fn relate(a: &Candidate, b: &Candidate) -> Option<(RelationshipKind, f64)> {
    if !a.core.is_empty() && a.core.len() < b.core.len() && a.core.is_subset(&b.core) {
        return Some((RelationshipKind::Component, 0.8));
    }
    if a.is_foundational() && !b.is_foundational() {
        if a.core.is_empty() {
            return Some((RelationshipKind::Prerequisite, 0.5));
        }
        if !a.core.is_disjoint(&b.core) {
            return Some((RelationshipKind::Prerequisite, 0.7));
        }
    }
    if b.is_application() && !a.is_application() && !a.core.is_disjoint(&b.core) {
        return Some((RelationshipKind::Application, 0.6));
    }
    None
}

/// Candidates in an arena with index-pair edges.
#[derive(Debug)]
struct ConceptGraph {
    nodes: Vec<Candidate>,
    edges: Vec<Edge>,
}

impl ConceptGraph {
    fn build(nodes: Vec<Candidate>) -> Self {
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, c)| (normalize_title(&c.title), i))
            .collect();
        let mut edges = Vec::new();
        let mut linked: HashSet<(usize, usize)> = HashSet::new();

        for (to, b) in nodes.iter().enumerate() {
            for title in &b.prerequisite_titles {
                if let Some(&from) = index.get(&normalize_title(title)) {
                    if from != to && linked.insert((from, to)) {
                        edges.push(Edge {
                            from,
                            to,
                            kind: RelationshipKind::Prerequisite,
                            strength: AI_PREREQUISITE_STRENGTH,
                        });
                    }
                }
            }
        }

        for (from, a) in nodes.iter().enumerate() {
            for (to, b) in nodes.iter().enumerate() {
                if from == to || linked.contains(&(from, to)) {
                    continue;
                }
                if let Some((kind, strength)) = relate(a, b) {
                    linked.insert((from, to));
                    edges.push(Edge {
                        from,
                        to,
                        kind,
                        strength,
                    });
                }
            }
        }

        for i in 0..nodes.len() {
            for j in (i + 1)..nodes.len() {
                if linked.contains(&(i, j)) || linked.contains(&(j, i)) {
                    continue;
                }
                let similarity = jaccard(&nodes[i].core, &nodes[j].core);
                if similarity >= RELATED_THRESHOLD {
                    edges.push(Edge {
                        from: i,
                        to: j,
                        kind: RelationshipKind::Related,
                        strength: similarity,
                    });
                }
            }
        }

        Self { nodes, edges }
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Strongly connected groups of two or more nodes (or a self-loop)
    /// over hierarchical edges, each in index order.
    fn cyclic_components(&self) -> Vec<Vec<usize>> {
        let n = self.len();
        let mut reach = vec![vec![false; n]; n];
        for edge in self.edges.iter().filter(|e| e.is_hierarchical()) {
            reach[edge.from][edge.to] = true;
        }
        for k in 0..n {
            for i in 0..n {
                if !reach[i][k] {
                    continue;
                }
                for j in 0..n {
                    if reach[k][j] {
                        reach[i][j] = true;
                    }
                }
            }
        }

        let mut assigned = vec![false; n];
        let mut components = Vec::new();
        for i in 0..n {
            if assigned[i] || !reach[i][i] {
                continue;
            }
            let members: Vec<usize> = (i..n).filter(|&j| reach[i][j] && reach[j][i]).collect();
            for &m in &members {
                assigned[m] = true;
            }
            components.push(members);
        }
        components
    }

    /// Kahn's algorithm over `edges`; ready nodes are taken lowest index first.
    fn topological_order(&self, edges: &[Edge]) -> Vec<usize> {
        let n = self.len();
        let mut indegree = vec![0usize; n];
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); n];
        for edge in edges {
            indegree[edge.to] += 1;
            outgoing[edge.from].push(edge.to);
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &target in &outgoing[next] {
                indegree[target] -= 1;
                if indegree[target] == 0 {
                    ready.insert(target);
                }
            }
        }
        order
    }
}

/// Per-candidate scoring before filtering.
#[derive(Debug, Clone)]
struct Scored {
    confidence: f64,
    difficulty: Difficulty,
    supporting: Vec<usize>,
    engines: BTreeSet<EngineId>,
}

fn estimated_minutes(difficulty: Difficulty) -> u32 {
    match difficulty {
        Difficulty::Beginner => 15,
        Difficulty::Intermediate => 25,
        Difficulty::Advanced => 40,
    }
}

/// Difficulty relative to the learner: steps up for beginners, down for
/// advanced learners, leaving the matching end of the scale alone.
fn adjust_for_level(base: Difficulty, level: Option<LearnerLevel>) -> Difficulty {
    match level {
        Some(LearnerLevel::Beginner) if base != Difficulty::Beginner => base.harder(),
        Some(LearnerLevel::Advanced) if base != Difficulty::Advanced => base.easier(),
        _ => base,
    }
}

fn matches_area(candidate: &Candidate, area: &str) -> bool {
    let area = area.trim().to_lowercase();
    if area.is_empty() {
        return false;
    }
    if candidate.title.to_lowercase().contains(&area) {
        return true;
    }
    let area_tokens = token_set(&area);
    !area_tokens.is_empty() && area_tokens.is_subset(&token_set(&candidate.title))
}

fn shorten(text: &str) -> String {
    let head = text.split(':').next().unwrap_or(text);
    head.split_whitespace()
        .take(MAX_TITLE_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_sentence(text: &str) -> Option<String> {
    let sentence = text.split(". ").next()?.trim();
    if sentence.is_empty() {
        None
    } else {
        Some(sentence.trim_end_matches('.').to_string())
    }
}

fn coverage(nodes: &[ExtractedSubtopic]) -> CoverageMetrics {
    if nodes.is_empty() {
        return CoverageMetrics::default();
    }
    let academic_agent = EngineId::Academic.agent_name();
    let share = |pred: &dyn Fn(&ExtractedSubtopic) -> bool| {
        nodes.iter().filter(|n| pred(n)).count() as f64 / nodes.len() as f64
    };
    CoverageMetrics {
        academic: share(&|n| n.metadata.source_agents.contains(&academic_agent)),
        practical: share(&|n| {
            !n.metadata.practical_applications.is_empty()
                || practical_match_count(&n.title.to_lowercase()) > 0
        }),
        foundational: share(&|n| n.metadata.difficulty == Difficulty::Beginner),
        advanced: share(&|n| n.metadata.difficulty == Difficulty::Advanced),
    }
}

/// Slug ids, suffixed when two titles slug the same.
fn assign_ids(nodes: &[Candidate]) -> Vec<String> {
    let mut used: HashMap<String, usize> = HashMap::new();
    nodes
        .iter()
        .map(|c| {
            let slug = slugify(&c.title);
            let count = used.entry(slug.clone()).or_default();
            *count += 1;
            if *count == 1 {
                slug
            } else {
                format!("{}-{}", slug, count)
            }
        })
        .collect()
}

/// Final tree state after filtering.
struct Assembly<'a> {
    graph: &'a ConceptGraph,
    ids: Vec<String>,
    order: Vec<usize>,
    kept: Vec<bool>,
    parent: Vec<Option<usize>>,
    nodes: HashMap<usize, ExtractedSubtopic>,
}

impl Assembly<'_> {
    fn children_of(&self, i: usize) -> Vec<usize> {
        self.order
            .iter()
            .copied()
            .filter(|&j| self.kept[j] && self.parent[j] == Some(i))
            .collect()
    }

    fn subtree(&self, i: usize) -> Option<ExtractedSubtopic> {
        let mut node = self.nodes.get(&i)?.clone();
        node.children = self
            .children_of(i)
            .into_iter()
            .filter_map(|c| self.subtree(c))
            .collect();
        Some(node)
    }

    fn hierarchy(&self) -> Vec<ExtractedSubtopic> {
        self.order
            .iter()
            .filter(|&&i| self.kept[i] && self.parent[i].is_none())
            .filter_map(|&i| self.subtree(i))
            .collect()
    }

    fn flat(&self) -> Vec<ExtractedSubtopic> {
        self.order
            .iter()
            .filter_map(|i| self.nodes.get(i).cloned())
            .collect()
    }

    fn relationships(&self) -> Vec<TopicRelationship> {
        self.graph
            .edges
            .iter()
            .filter(|e| self.kept[e.from] && self.kept[e.to])
            .map(|e| TopicRelationship {
                from: self.ids[e.from].clone(),
                to: self.ids[e.to].clone(),
                kind: e.kind,
                strength: e.strength,
            })
            .collect()
    }
}

pub struct SubtopicExtractor {
    generator: Arc<dyn TextGenerator>,
    config: ExtractionConfig,
    comms: Option<Arc<AgentCommunicationManager>>,
}

impl SubtopicExtractor {
    pub fn new(generator: Arc<dyn TextGenerator>, config: ExtractionConfig) -> Self {
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

    /// Builds the subtopic tree for `main_topic`.
    ///
    /// Nodes hang under their strongest prerequisite or component parent,
    /// never deeper than `max_depth`. Prerequisite cycles are reported in
    /// [`ExtractionResult::cycles`] and their edges left out of the tree.
    #[instrument(skip(self, results, synthesis, user_context), fields(results = results.len()))]
    pub async fn extract(
        &self,
        main_topic: &str,
        results: &[SearchResultWithEngine],
        synthesis: &SynthesisResult,
        user_context: Option<&UserContext>,
    ) -> Result<ExtractionResult> {
        let main_topic = main_topic.trim();
        if main_topic.is_empty() {
            return Err(ResearchError::InvalidInput("main topic is empty".to_string()));
        }
        let started = Instant::now();

        let prompt = self.build_prompt(main_topic, results, synthesis);
        let ai = generate_structured_within::<AiExtraction>(
            self.generator.as_ref(),
            &prompt,
            self.config.temperature,
            millis(self.config.generation_timeout_ms),
        )
        .await;
        let ai_error = ai.as_ref().err().map(|e| e.to_string());
        let ai = match ai {
            Ok(extraction) => extraction.subtopics,
            Err(e) => {
                warn!(error = %e, "Subtopic generation failed, using synthesis themes");
                Vec::new()
            }
        };

        let candidates = self.collect_candidates(main_topic, synthesis, ai, user_context);
        debug!(candidates = candidates.len(), "Collected subtopic candidates");
        let graph = ConceptGraph::build(candidates);
        let extraction = self.assemble(main_topic, &graph, results, user_context);

        info!(
            subtopics = extraction.flat.len(),
            roots = extraction.hierarchy.len(),
            cycles = extraction.cycles.len(),
            "Subtopic extraction complete"
        );
        if let Some(comms) = &self.comms {
            comms.record_agent_execution(
                EXTRACTION_AGENT,
                true,
                started.elapsed(),
                extraction.flat.len(),
                ai_error.as_deref(),
            );
            comms.send_message(
                MessageType::TaskResult,
                serde_json::json!({
                    "stage": "extraction",
                    "subtopics": extraction.flat.len(),
                    "cycles": extraction.cycles.len(),
                }),
                Some(EXTRACTION_AGENT),
                None,
            );
        }
        Ok(extraction)
    }

    fn collect_candidates(
        &self,
        main_topic: &str,
        synthesis: &SynthesisResult,
        ai: Vec<AiSubtopic>,
        user_context: Option<&UserContext>,
    ) -> Vec<Candidate> {
        let topic_terms = token_set(main_topic);
        let main_key = normalize_title(main_topic);
        let excluded = |c: &Candidate| {
            user_context.map_or(false, |ctx| {
                ctx.exclude_areas.iter().any(|area| matches_area(c, area))
            })
        };

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut admit = |candidate: Candidate| -> Option<usize> {
            let key = normalize_title(&candidate.title);
            if key == main_key || excluded(&candidate) {
                return None;
            }
            if let Some(&existing) = index.get(&key) {
                return Some(existing);
            }
            if candidates.len() >= MAX_CANDIDATES {
                return None;
            }
            index.insert(key, candidates.len());
            candidates.push(candidate);
            Some(candidates.len() - 1)
        };

        let mut admitted_themes = Vec::new();
        for theme in &synthesis.content_themes {
            if let Some(c) = Candidate::new(theme, &topic_terms) {
                admitted_themes.extend(admit(c));
            }
        }

        let mut ai_updates = Vec::new();
        let no_ai = ai.is_empty();
        for subtopic in ai {
            if let Some(c) = Candidate::new(&subtopic.title, &topic_terms) {
                if let Some(i) = admit(c) {
                    ai_updates.push((i, subtopic));
                }
            }
        }

        if no_ai {
            for insight in &synthesis.key_insights {
                if let Some(c) = Candidate::new(&shorten(insight), &topic_terms) {
                    admit(c);
                }
            }
        }

        for i in admitted_themes {
            candidates[i].from_theme = true;
        }
        for (i, subtopic) in ai_updates {
            let candidate = &mut candidates[i];
            candidate.from_ai = true;
            candidate.description = subtopic.description.filter(|d| !d.trim().is_empty());
            candidate.difficulty_hint = subtopic.difficulty;
            candidate.key_terms = subtopic.key_terms;
            candidate.prerequisite_titles = subtopic.prerequisites;
        }
        candidates
    }

    fn score(
        &self,
        candidate: &Candidate,
        results: &[SearchResultWithEngine],
        result_tokens: &[HashSet<String>],
        user_context: Option<&UserContext>,
    ) -> Scored {
        let supporting: Vec<usize> = result_tokens
            .iter()
            .enumerate()
            .filter(|(_, tokens)| {
                let overlap = candidate.tokens.intersection(tokens).count();
                overlap * 2 >= candidate.tokens.len()
            })
            .map(|(i, _)| i)
            .collect();
        let engines: BTreeSet<EngineId> = supporting.iter().map(|&i| results[i].engine).collect();

        let support = (supporting.len() as f64 / 3.0).min(1.0);
        let diversity = (engines.len() as f64 / 3.0).min(1.0);
        let mut confidence = 0.2 + 0.4 * support + 0.2 * diversity;
        if candidate.from_theme {
            confidence += 0.1;
        }
        if candidate.from_ai {
            confidence += 0.1;
        }
        let focused = user_context.map_or(false, |ctx| {
            ctx.focus_areas.iter().any(|area| matches_area(candidate, area))
        });
        if focused {
            confidence += 0.15;
        }

        let base = if candidate.is_foundational() {
            Difficulty::Beginner
        } else if candidate.is_advanced() {
            Difficulty::Advanced
        } else {
            candidate.difficulty_hint.unwrap_or(Difficulty::Intermediate)
        };

        Scored {
            confidence: confidence.clamp(0.0, 1.0),
            difficulty: adjust_for_level(base, user_context.and_then(|ctx| ctx.level)),
            supporting,
            engines,
        }
    }

    fn assemble(
        &self,
        main_topic: &str,
        graph: &ConceptGraph,
        results: &[SearchResultWithEngine],
        user_context: Option<&UserContext>,
    ) -> ExtractionResult {
        let n = graph.len();
        let ids = assign_ids(&graph.nodes);

        let components = graph.cyclic_components();
        let mut component_of: Vec<Option<usize>> = vec![None; n];
        for (c, members) in components.iter().enumerate() {
            for &m in members {
                component_of[m] = Some(c);
            }
        }
        if !components.is_empty() {
            warn!(cycles = components.len(), "Prerequisite cycles detected, excluding their edges");
        }
        let dag: Vec<Edge> = graph
            .edges
            .iter()
            .filter(|e| e.is_hierarchical())
            .filter(|e| component_of[e.from].is_none() || component_of[e.from] != component_of[e.to])
            .copied()
            .collect();
        let order = graph.topological_order(&dag);

        // Parent = strongest incoming edge from a node with room below it.
        let max_depth = self.config.max_depth.clamp(1, 3);
        let mut level = vec![1u8; n];
        let mut parent: Vec<Option<usize>> = vec![None; n];
        for &v in &order {
            let best = dag
                .iter()
                .filter(|e| e.to == v && level[e.from] < max_depth)
                .max_by(|a, b| {
                    a.strength
                        .partial_cmp(&b.strength)
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| b.from.cmp(&a.from))
                });
            if let Some(edge) = best {
                parent[v] = Some(edge.from);
                level[v] = level[edge.from] + 1;
            }
        }

        let result_tokens: Vec<HashSet<String>> = results
            .iter()
            .map(|r| token_set(&r.searchable_text()))
            .collect();
        let scored: Vec<Scored> = graph
            .nodes
            .iter()
            .map(|c| self.score(c, results, &result_tokens, user_context))
            .collect();

        let mut kept: Vec<bool> = scored
            .iter()
            .map(|s| s.confidence >= self.config.min_confidence)
            .collect();
        let kept_parent = |i: usize, kept: &[bool]| {
            let mut p = parent[i];
            while let Some(q) = p {
                if kept[q] {
                    return Some(q);
                }
                p = parent[q];
            }
            None
        };
        let parent: Vec<Option<usize>> = (0..n).map(|i| kept_parent(i, &kept)).collect();

        while kept.iter().filter(|&&k| k).count() > self.config.max_subtopics {
            let leaf = (0..n)
                .filter(|&i| kept[i] && !(0..n).any(|j| kept[j] && parent[j] == Some(i)))
                .min_by(|&a, &b| {
                    scored[a]
                        .confidence
                        .partial_cmp(&scored[b].confidence)
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| b.cmp(&a))
                });
            match leaf {
                Some(i) => kept[i] = false,
                None => break,
            }
        }

        let depth = |i: usize| {
            let mut d = 1u8;
            let mut p = parent[i];
            while let Some(q) = p {
                d += 1;
                p = parent[q];
            }
            d
        };

        let mut nodes = HashMap::new();
        for i in (0..n).filter(|&i| kept[i]) {
            let candidate = &graph.nodes[i];
            let score = &scored[i];
            let linked = |kind: RelationshipKind, incoming_only: bool| {
                let mut linked: Vec<(f64, usize)> = graph
                    .edges
                    .iter()
                    .filter(|e| e.kind == kind)
                    .filter_map(|e| {
                        if e.to == i {
                            Some((e.strength, e.from))
                        } else if e.from == i && !incoming_only {
                            Some((e.strength, e.to))
                        } else {
                            None
                        }
                    })
                    .filter(|&(_, other)| kept[other])
                    .collect();
                linked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
                linked
                    .into_iter()
                    .map(|(_, other)| graph.nodes[other].title.clone())
                    .take(5)
                    .collect::<Vec<_>>()
            };

            let mut applications = Vec::new();
            for &r in &score.supporting {
                let title = results[r].result.title.trim();
                if practical_match_count(&results[r].searchable_text()) > 0
                    && !applications.iter().any(|a: &String| a == title)
                {
                    applications.push(title.to_string());
                }
            }
            applications.truncate(3);

            let key_terms: Vec<String> = if candidate.key_terms.is_empty() {
                candidate.terms.clone()
            } else {
                candidate.key_terms.clone()
            }
            .into_iter()
            .take(5)
            .collect();

            let description = candidate
                .description
                .clone()
                .or_else(|| {
                    score
                        .supporting
                        .iter()
                        .find_map(|&r| first_sentence(&results[r].result.snippet))
                })
                .unwrap_or_else(|| format!("{} within {}", candidate.title, main_topic));

            nodes.insert(
                i,
                ExtractedSubtopic {
                    id: ids[i].clone(),
                    title: candidate.title.clone(),
                    description,
                    level: depth(i),
                    parent_id: parent[i].map(|p| ids[p].clone()),
                    children: Vec::new(),
                    metadata: SubtopicMetadata {
                        confidence: score.confidence,
                        difficulty: score.difficulty,
                        estimated_time_minutes: estimated_minutes(score.difficulty),
                        prerequisites: linked(RelationshipKind::Prerequisite, true),
                        related_concepts: linked(RelationshipKind::Related, false),
                        source_agents: score.engines.iter().map(|e| e.agent_name()).collect(),
                        key_terms,
                        practical_applications: applications,
                    },
                },
            );
        }

        let assembly = Assembly {
            graph,
            ids,
            order,
            kept,
            parent,
            nodes,
        };
        let flat = assembly.flat();
        ExtractionResult {
            main_topic: main_topic.to_string(),
            hierarchy: assembly.hierarchy(),
            relationships: assembly.relationships(),
            cycles: components
                .iter()
                .map(|members| members.iter().map(|&m| assembly.ids[m].clone()).collect())
                .collect(),
            coverage: coverage(&flat),
            flat,
        }
    }

    fn build_prompt(
        &self,
        main_topic: &str,
        results: &[SearchResultWithEngine],
        synthesis: &SynthesisResult,
    ) -> String {
        let titles = results
            .iter()
            .take(15)
            .map(|r| format!("- [{}] {}", r.engine, r.result.title))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Identify up to {max} learnable subtopics of \"{main_topic}\".\n\
             Themes: {themes}\n\
             Insights: {insights}\n\
             Sources:\n{titles}\n\n\
             Respond with JSON only: {{\"subtopics\": [{{\"title\": string, \
             \"description\": string, \"difficulty\": \"beginner\"|\"intermediate\"|\"advanced\", \
             \"keyTerms\": [string], \"prerequisites\": [subtopic titles]}}]}}",
            max = self.config.max_subtopics,
            themes = synthesis.content_themes.join("; "),
            insights = synthesis.key_insights.join("; "),
        )
    }
}

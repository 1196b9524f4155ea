use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::agents::{AgentCommunicationManager, MessageType, PLANNER_AGENT};
use crate::config::{millis, PlanningConfig};
use crate::error::{GenerationError, ResearchError, Result};
use crate::models::{
    Complexity, EngineId, LearnerLevel, ResearchPlan, ResearchQuery, TopicUnderstanding,
    UserContext,
};
use crate::research::text::{contains_any, ACCESSIBLE_MARKERS, SPECIALIZED_MARKERS};
use crate::tools::llm::generate_structured_within;
use crate::tools::TextGenerator;

/// Raw plan as emitted by the generator. Decoded strictly; the distribution
/// is always recomputed from the queries.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanDraft {
    research_queries: Vec<ResearchQuery>,
    research_strategy: String,
    #[serde(default)]
    expected_outcomes: Vec<String>,
}

/// Template text with `{topic}` placeholders, paired with its reasoning.
type Template = (&'static str, &'static str);

const GENERAL_TEMPLATES: &[Template] = &[
    ("{topic} basics explained", "Accessible overview of the fundamentals"),
    ("introduction to {topic}", "Entry point for newcomers"),
    ("{topic} beginner guide", "Structured beginner-friendly walkthrough"),
    ("how does {topic} work", "Mechanism-level explanation"),
    ("{topic} key concepts overview", "Map of the core vocabulary"),
    ("{topic} real-world examples", "Concrete applications"),
];

const COMMUNITY_TEMPLATES: &[Template] = &[
    ("{topic} discussion", "Learner and practitioner discussion threads"),
    ("{topic} tips from learners", "Practical advice from people who studied it"),
    ("common questions about {topic}", "Frequently asked questions and confusions"),
    ("{topic} explained simply", "Plain-language community explanations"),
    ("{topic} study advice", "How others approached learning it"),
    ("{topic} common misconceptions", "Pitfalls surfaced by the community"),
];

const VIDEO_TEMPLATES: &[Template] = &[
    ("{topic} explained video", "Visual explanation"),
    ("{topic} tutorial for beginners", "Guided video tutorial"),
    ("{topic} lecture", "Lecture-style coverage"),
    ("{topic} animation", "Animated walkthrough of the process"),
    ("{topic} crash course", "Condensed video overview"),
    ("{topic} demonstration", "Worked demonstration"),
];

const ACADEMIC_TEMPLATES: &[Template] = &[
    ("{topic} research review", "Survey of the academic literature"),
    ("{topic} academic paper", "Primary scholarly sources"),
    ("{topic} recent studies", "Current research findings"),
    ("{topic} technical analysis", "Rigorous technical treatment"),
];

const COMPUTATIONAL_TEMPLATES: &[Template] = &[
    ("{topic} formula calculation", "Quantitative relationships"),
    ("{topic} data and statistics", "Numerical facts and figures"),
    ("{topic} quantitative model", "Computable models of the topic"),
];

fn templates_for(engine: EngineId) -> &'static [Template] {
    match engine {
        EngineId::General => GENERAL_TEMPLATES,
        EngineId::Community => COMMUNITY_TEMPLATES,
        EngineId::Video => VIDEO_TEMPLATES,
        EngineId::Academic => ACADEMIC_TEMPLATES,
        EngineId::Computational => COMPUTATIONAL_TEMPLATES,
    }
}

/// Largest per-engine minimum the templates alone can satisfy.
pub fn mandatory_template_capacity() -> usize {
    EngineId::MANDATORY
        .iter()
        .map(|e| templates_for(*e).len())
        .min()
        .unwrap_or(0)
}

fn render(template: &Template, topic: &str, engine: EngineId) -> ResearchQuery {
    ResearchQuery::new(template.0.replace("{topic}", topic), engine, template.1)
}

/// Outcome of checking a plan against the schema invariants.
#[derive(Debug, Default, PartialEq)]
pub struct PlanValidation {
    pub problems: Vec<String>,
    pub short_engines: Vec<EngineId>,
}

impl PlanValidation {
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty() && self.short_engines.is_empty()
    }
}

pub fn validate_plan(plan: &ResearchPlan, minimum: usize) -> PlanValidation {
    let mut validation = PlanValidation::default();
    if plan.research_queries.is_empty() {
        validation.problems.push("plan has no queries".to_string());
    }
    if plan.research_queries.iter().any(|q| q.query.trim().is_empty()) {
        validation.problems.push("plan contains an empty query".to_string());
    }
    let total: usize = plan.engine_distribution.values().sum();
    if total != plan.research_queries.len() {
        validation.problems.push(format!(
            "engine distribution sums to {} but plan has {} queries",
            total,
            plan.research_queries.len()
        ));
    }
    for engine in EngineId::ALL {
        let stated = plan.engine_distribution.get(&engine).copied().unwrap_or(0);
        if stated != plan.count_for(engine) {
            validation
                .problems
                .push(format!("engine distribution for {} is stale", engine));
        }
    }
    for engine in EngineId::MANDATORY {
        if plan.count_for(engine) < minimum {
            validation.short_engines.push(engine);
        }
    }
    validation
}

/// Tops up every mandatory engine to `minimum` queries from the templates.
///
/// Returns the number of queries added.
pub fn enforce_minimums(plan: &mut ResearchPlan, topic: &str, minimum: usize) -> usize {
    let mut added = 0;
    for engine in EngineId::MANDATORY {
        let shortfall = minimum.saturating_sub(plan.count_for(engine));
        if shortfall == 0 {
            continue;
        }
        let candidates: Vec<ResearchQuery> = templates_for(engine)
            .iter()
            .map(|t| render(t, topic, engine))
            .filter(|candidate| {
                !plan.research_queries.iter().any(|existing| {
                    existing.engine == engine
                        && existing.query.eq_ignore_ascii_case(&candidate.query)
                })
            })
            .take(shortfall)
            .collect();
        added += candidates.len();
        plan.research_queries.extend(candidates);
    }
    plan.recompute_distribution();
    added
}

/// Non-fatal diversity findings for a plan.
pub fn check_diversity(plan: &ResearchPlan) -> Vec<String> {
    let mut warnings = vec![];
    let general_accessible = plan
        .research_queries
        .iter()
        .filter(|q| q.engine == EngineId::General)
        .any(|q| contains_any(&q.query, ACCESSIBLE_MARKERS));
    if !general_accessible {
        warnings.push("general queries lack accessible-language markers".to_string());
    }
    let any_specialized = plan
        .research_queries
        .iter()
        .any(|q| contains_any(&q.query, SPECIALIZED_MARKERS));
    if !any_specialized {
        warnings.push("no query uses specialized-language markers".to_string());
    }
    warnings
}

enum Attempt {
    Planned(ResearchPlan),
    Fallback(String),
}

pub struct ResearchPlanningModule {
    generator: Arc<dyn TextGenerator>,
    config: PlanningConfig,
    comms: Option<Arc<AgentCommunicationManager>>,
}

impl ResearchPlanningModule {
    /// The mandatory minimum is clamped to what the templates can top up to.
    pub fn new(generator: Arc<dyn TextGenerator>, mut config: PlanningConfig) -> Self {
        let capacity = mandatory_template_capacity();
        if config.min_queries_per_mandatory_engine > capacity {
            warn!(
                configured = config.min_queries_per_mandatory_engine,
                capacity, "Mandatory query minimum exceeds the template pool, clamping"
            );
            config.min_queries_per_mandatory_engine = capacity;
        }
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

    fn minimum(&self) -> usize {
        self.config.min_queries_per_mandatory_engine
    }

    /// Produces a plan that always satisfies the per-engine minimums.
    ///
    /// Generation problems of any kind fall back to the deterministic
    /// templates; only an exhausted template pool is an error.
    #[instrument(skip(self, understanding, user_context))]
    pub async fn plan_research(
        &self,
        topic: &str,
        understanding: &TopicUnderstanding,
        user_context: Option<&UserContext>,
    ) -> Result<ResearchPlan> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(ResearchError::InvalidInput("topic must not be empty".to_string()));
        }
        let started = Instant::now();

        let outcome = match self.generated_plan(topic, understanding, user_context).await {
            Ok(Attempt::Planned(plan)) => Ok(plan),
            Ok(Attempt::Fallback(reason)) => {
                warn!(%reason, "Falling back to template research plan");
                self.fallback_plan(topic, understanding, user_context)
            }
            Err(e) => Err(e),
        };

        let elapsed = started.elapsed();
        match &outcome {
            Ok(plan) => {
                for warning in check_diversity(plan) {
                    warn!(topic, "Plan diversity: {}", warning);
                }
                info!(
                    queries = plan.research_queries.len(),
                    distribution = ?plan.engine_distribution,
                    "Research plan ready"
                );
                if let Some(comms) = &self.comms {
                    comms.record_agent_execution(PLANNER_AGENT, true, elapsed, plan.research_queries.len(), None);
                    comms.send_message(
                        MessageType::TaskResult,
                        serde_json::json!({
                            "stage": "planning",
                            "topic": topic,
                            "queries": plan.research_queries.len(),
                        }),
                        Some(PLANNER_AGENT),
                        None,
                    );
                }
            }
            Err(e) => {
                if let Some(comms) = &self.comms {
                    comms.record_agent_execution(PLANNER_AGENT, false, elapsed, 0, Some(e.to_string().as_str()));
                }
            }
        }
        outcome
    }

    async fn generated_plan(
        &self,
        topic: &str,
        understanding: &TopicUnderstanding,
        user_context: Option<&UserContext>,
    ) -> Result<Attempt> {
        let prompt = self.build_prompt(topic, understanding, user_context);
        let draft: PlanDraft = match generate_structured_within(
            self.generator.as_ref(),
            &prompt,
            self.config.temperature,
            millis(self.config.generation_timeout_ms),
        )
        .await
        {
            Ok(draft) => draft,
            Err(e @ GenerationError::Schema(_)) => {
                return Ok(Attempt::Fallback(format!("malformed plan: {}", e)))
            }
            Err(e) => return Ok(Attempt::Fallback(e.to_string())),
        };

        let mut plan = ResearchPlan::new(
            draft.research_queries,
            draft.research_strategy,
            draft.expected_outcomes,
        );
        let validation = validate_plan(&plan, self.minimum());
        if validation.is_valid() {
            return Ok(Attempt::Planned(plan));
        }
        if !validation.problems.is_empty() {
            return Ok(Attempt::Fallback(validation.problems.join("; ")));
        }

        let added = enforce_minimums(&mut plan, topic, self.minimum());
        info!(added, short = ?validation.short_engines, "Topped up generated plan to mandatory minimums");
        self.ensure_valid(plan)
            .map(Attempt::Planned)
    }

    fn ensure_valid(&self, plan: ResearchPlan) -> Result<ResearchPlan> {
        let validation = validate_plan(&plan, self.minimum());
        if !validation.short_engines.is_empty() {
            return Err(ResearchError::Planning(format!(
                "template pool exhausted, engines still below minimum: {:?}",
                validation.short_engines
            )));
        }
        if !validation.problems.is_empty() {
            return Err(ResearchError::Planning(validation.problems.join("; ")));
        }
        Ok(plan)
    }

    /// Builds a complete plan from templates without calling the generator.
    pub fn fallback_plan(
        &self,
        topic: &str,
        understanding: &TopicUnderstanding,
        user_context: Option<&UserContext>,
    ) -> Result<ResearchPlan> {
        let mut queries: Vec<ResearchQuery> = GENERAL_TEMPLATES
            .iter()
            .take(5)
            .map(|t| render(t, topic, EngineId::General))
            .collect();

        if let Some(level) = user_context.and_then(|c| c.level) {
            if level == LearnerLevel::Advanced {
                queries.push(ResearchQuery::new(
                    format!("{} advanced topics", topic),
                    EngineId::General,
                    "Depth for an advanced learner",
                ));
            }
        }

        for engine in &understanding.recommended_engines {
            let count = match engine {
                EngineId::General => 0,
                EngineId::Academic if understanding.complexity == Complexity::Advanced => 4,
                EngineId::Academic => 3,
                EngineId::Computational => 2,
                EngineId::Video | EngineId::Community => self.minimum(),
            };
            let already = queries.iter().filter(|q| q.engine == *engine).count();
            queries.extend(
                templates_for(*engine)
                    .iter()
                    .skip(already)
                    .take(count.saturating_sub(already))
                    .map(|t| render(t, topic, *engine)),
            );
        }

        if let Some(context) = user_context {
            for area in context.focus_areas.iter().take(2) {
                queries.push(ResearchQuery::new(
                    format!("{} {}", topic, area),
                    EngineId::General,
                    format!("Requested focus on {}", area),
                ));
            }
        }

        let mut plan = ResearchPlan::new(
            queries,
            format!(
                "Template-based {} research: accessible general sources first, community and video for practical perspective, specialized engines for depth",
                understanding.category
            ),
            vec![
                format!("Foundational understanding of {}", topic),
                "Practical examples and learner perspectives".to_string(),
                "Pointers to deeper specialized material".to_string(),
            ],
        );
        enforce_minimums(&mut plan, topic, self.minimum());
        self.ensure_valid(plan)
    }

    fn build_prompt(
        &self,
        topic: &str,
        understanding: &TopicUnderstanding,
        user_context: Option<&UserContext>,
    ) -> String {
        let recommended = understanding
            .recommended_engines
            .iter()
            .filter(|e| !EngineId::MANDATORY.contains(e))
            .map(|e| e.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let level = user_context
            .and_then(|c| c.level)
            .map(|l| format!("{:?}", l).to_lowercase())
            .unwrap_or_else(|| "unspecified".to_string());
        let focus = user_context
            .map(|c| c.focus_areas.join(", "))
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| "none".to_string());
        let min = self.minimum();

        format!(
            r#"You are a research planner. Create a research plan for the topic "{topic}".

Topic understanding:
- Definition: {definition}
- Category: {category}
- Complexity: {complexity:?}
- Recommended specialized engines: {recommended}
- Research approach: {approach}

Learner level: {level}
Focus areas: {focus}

Requirements:
- Produce 15-20 queries in total
- At least {min} queries for the "general" engine, using accessible language (basics, introduction, beginner)
- At least {min} queries for the "community" engine
- At least {min} queries for the "video" engine
- Between 0 and 5 queries for the recommended specialized engines (academic, computational)
- Allowed engine values: general, academic, video, community, computational

Return only JSON in this format:
{{"researchQueries": [{{"query": "...", "engine": "general", "reasoning": "..."}}], "researchStrategy": "...", "expectedOutcomes": ["..."]}}"#,
            topic = topic,
            definition = understanding.definition,
            category = understanding.category,
            complexity = understanding.complexity,
            recommended = if recommended.is_empty() { "none".to_string() } else { recommended },
            approach = understanding.research_approach,
            level = level,
            focus = focus,
            min = min,
        )
    }
}

//! Safety Classifier - mandatory first stage
//!
//! Two layers:
//! - A deterministic keyword check over the latest user message. Its matches
//!   are always reported in `matched_categories`, and a crisis-severity match
//!   forces BLOCKED without consulting the model.
//! - A generative verdict through the gateway. Anything that is not a clean,
//!   parseable verdict becomes WARNING; the classifier never defaults to SAFE.

use super::traits::{AgentError, AgentResult, Stage, StageContext, StageKind, StageOutput};
use crate::gateway::{AgentRole, Gateway, GenerationRequest};
use crate::memory::conversation::{transcript, window};
use crate::utils::{extract_json, truncate_chars};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

const GUARDRAIL_SYSTEM_PROMPT: &str = r#"You are a safety guardrail for a mental wellness companion.

Assess the user's latest message for:
1. Self-harm or suicidal ideation
2. Abuse or violence that requires immediate intervention
3. Substance-use crises
4. Acute distress that needs professional help

Safety levels:
- safe: no concerns
- warning: mild concerns, flag for monitoring
- blocked: requires intervention or professional help

Be sensitive to people who are venting or seeking help; distinguish processing
from danger, and err on the side of caution for serious concerns.

Respond with JSON only:
{"safety": "safe|warning|blocked", "reason": "brief explanation"}"#;

/// Messages of context shown to the model alongside the latest turn
const CONTEXT_MESSAGES: usize = 4;
const MAX_ASSESSED_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyLevel {
    Safe,
    Warning,
    Blocked,
}

impl SafetyLevel {
    /// Case-insensitive parse of a model label
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "safe" => Some(SafetyLevel::Safe),
            "warning" => Some(SafetyLevel::Warning),
            "blocked" => Some(SafetyLevel::Blocked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyLevel::Safe => "SAFE",
            SafetyLevel::Warning => "WARNING",
            SafetyLevel::Blocked => "BLOCKED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardrailVerdict {
    pub level: SafetyLevel,
    pub matched_categories: BTreeSet<String>,
    pub reasoning: String,
}

impl GuardrailVerdict {
    /// WARNING with no deterministic evidence, used when classification failed
    pub fn conservative(reasoning: impl Into<String>) -> Self {
        Self {
            level: SafetyLevel::Warning,
            matched_categories: BTreeSet::new(),
            reasoning: reasoning.into(),
        }
    }
}

// ============================================================================
// Deterministic keyword check
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchSeverity {
    Concern,
    Crisis,
}

struct CategoryRule {
    name: &'static str,
    crisis: Option<Regex>,
    concern: Option<Regex>,
}

fn pattern(source: &str) -> Option<Regex> {
    Some(Regex::new(&format!(r"(?i)\b(?:{})\b", source)).expect("valid regex"))
}

static DEFAULT_RULES: LazyLock<Vec<CategoryRule>> = LazyLock::new(|| {
    vec![
        CategoryRule {
            name: "self_harm",
            crisis: pattern(
                r"kill myself|end it all|end my life|take my (?:own )?life|suicid(?:e|al)|want to die|better off dead|no reason to live|hurt myself|harm myself|cut myself",
            ),
            concern: pattern(r"self[- ]harm|don'?t want to be here|can'?t go on|disappear forever"),
        },
        CategoryRule {
            name: "violence",
            crisis: pattern(
                r"kill (?:him|her|them|someone)|going to hurt (?:him|her|them|someone)|threatened to kill me|(?:he|she|they) (?:hits|beats|chokes) me",
            ),
            concern: pattern(r"abus(?:e|ed|ive)|hit me|afraid of (?:him|her|them)|violent"),
        },
        CategoryRule {
            name: "substance_crisis",
            crisis: pattern(r"overdos(?:e|ed|ing)|took (?:all|too many) (?:of )?(?:my |the )?pills"),
            concern: pattern(r"relapsed?|can'?t stop (?:drinking|using)|drinking (?:too much|every day)"),
        },
        CategoryRule {
            name: "distress",
            crisis: None,
            concern: pattern(
                r"hopeless|worthless|panic attacks?|can'?t cope|overwhelmed|falling apart|so alone",
            ),
        },
    ]
});

/// Categories matched in one message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeywordMatch {
    pub categories: BTreeSet<String>,
    pub severity: Option<MatchSeverity>,
}

impl KeywordMatch {
    pub fn is_crisis(&self) -> bool {
        self.severity == Some(MatchSeverity::Crisis)
    }

    /// Lowest level the final verdict may have
    pub fn floor(&self) -> SafetyLevel {
        match self.severity {
            Some(MatchSeverity::Crisis) => SafetyLevel::Blocked,
            Some(MatchSeverity::Concern) => SafetyLevel::Warning,
            None => SafetyLevel::Safe,
        }
    }
}

pub fn keyword_check(text: &str) -> KeywordMatch {
    let mut result = KeywordMatch::default();
    for rule in DEFAULT_RULES.iter() {
        let severity = if rule.crisis.as_ref().is_some_and(|re| re.is_match(text)) {
            Some(MatchSeverity::Crisis)
        } else if rule.concern.as_ref().is_some_and(|re| re.is_match(text)) {
            Some(MatchSeverity::Concern)
        } else {
            None
        };
        if let Some(severity) = severity {
            result.categories.insert(rule.name.to_string());
            result.severity = result.severity.max(Some(severity));
        }
    }
    result
}

// ============================================================================
// Crisis resources
// ============================================================================

/// Static content shown in place of a reply when a message is BLOCKED
pub trait CrisisResourceProvider: Send + Sync {
    fn text(&self, locale: &str) -> String;
}

const CRISIS_TEXT_EN: &str = "I'm really concerned about what you've shared, and I want you to \
be safe. You don't have to go through this alone. If you're in the US, you can call or text 988 \
to reach the Suicide & Crisis Lifeline any time, day or night. If you're elsewhere, please contact \
your local emergency number or a crisis helpline. If you're in immediate danger, call emergency \
services now.";

const CRISIS_TEXT_ES: &str = "Me preocupa mucho lo que has compartido y quiero que estés a salvo. \
No tienes que pasar por esto solo. En EE. UU. puedes llamar o enviar un mensaje de texto al 988 \
para comunicarte con la Línea de Prevención del Suicidio y Crisis a cualquier hora. En otros \
lugares, contacta a tu número de emergencias local o a una línea de crisis.";

#[derive(Debug, Default, Clone, Copy)]
pub struct StaticCrisisResources;

impl CrisisResourceProvider for StaticCrisisResources {
    fn text(&self, locale: &str) -> String {
        let lang = locale.split(['-', '_']).next().unwrap_or_default();
        match lang.to_ascii_lowercase().as_str() {
            "es" => CRISIS_TEXT_ES.to_string(),
            _ => CRISIS_TEXT_EN.to_string(),
        }
    }
}

// ============================================================================
// Stage
// ============================================================================

#[derive(Debug, Deserialize)]
struct ModelVerdict {
    safety: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Parse the model's JSON verdict
pub fn parse_verdict(response: &str) -> AgentResult<(SafetyLevel, String)> {
    let json_str = extract_json(response, '{', '}');
    let verdict: ModelVerdict = serde_json::from_str(json_str)
        .map_err(|e| AgentError::Classification(format!("unparseable verdict: {}", e)))?;
    let level = SafetyLevel::from_label(&verdict.safety).ok_or_else(|| {
        AgentError::Classification(format!("unknown safety label '{}'", verdict.safety))
    })?;
    Ok((level, verdict.reason.unwrap_or_default()))
}

pub struct GuardrailStage {
    gateway: Arc<Gateway>,
}

impl GuardrailStage {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    async fn classify(&self, context: &StageContext) -> AgentResult<GuardrailVerdict> {
        let latest = context
            .latest_user_message()
            .map(|m| m.text.as_str())
            .unwrap_or_default();
        let keywords = keyword_check(latest);

        if keywords.is_crisis() {
            tracing::warn!(
                user_id = %context.user_id,
                categories = ?keywords.categories,
                "Crisis keywords matched, blocking"
            );
            return Ok(GuardrailVerdict {
                level: SafetyLevel::Blocked,
                matched_categories: keywords.categories,
                reasoning: "Crisis indicators matched".to_string(),
            });
        }

        let history = window(&context.messages, CONTEXT_MESSAGES + 1);
        let prior = &history[..history.len().saturating_sub(1)];
        let prompt = if prior.is_empty() {
            format!(
                "Assess this message for safety concerns:\n\n{}",
                truncate_chars(latest, MAX_ASSESSED_CHARS)
            )
        } else {
            format!(
                "Recent conversation:\n{}\n\nAssess this latest message for safety concerns:\n\n{}",
                transcript(prior),
                truncate_chars(latest, MAX_ASSESSED_CHARS)
            )
        };
        let request = GenerationRequest::new(AgentRole::SafetyClassifier, GUARDRAIL_SYSTEM_PROMPT, prompt)
            .for_user(&context.user_id);

        let reply = self.gateway.invoke(&request, context.timeout, &context.cancel).await?;

        let (model_level, reasoning) = if reply.is_fallback() {
            (
                SafetyLevel::Warning,
                "Safety classification unavailable; treating message conservatively".to_string(),
            )
        } else {
            match parse_verdict(&reply.text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::error!(
                        user_id = %context.user_id,
                        "Failed to parse safety response: {}. Treating as WARNING.",
                        e
                    );
                    (SafetyLevel::Warning, e.to_string())
                }
            }
        };

        Ok(GuardrailVerdict {
            level: model_level.max(keywords.floor()),
            matched_categories: keywords.categories,
            reasoning,
        })
    }
}

#[async_trait]
impl Stage for GuardrailStage {
    fn kind(&self) -> StageKind {
        StageKind::SafetyClassifier
    }

    async fn invoke(&self, context: &StageContext) -> AgentResult<StageOutput> {
        self.classify(context).await.map(StageOutput::Verdict)
    }
}

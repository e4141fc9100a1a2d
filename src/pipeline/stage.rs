//! Stage catalogue and per-stage output schemas.
//!
//! Every agent response is parsed into the [`StageOutput`] variant of the
//! stage that produced it and bounds-checked before it is allowed anywhere
//! near a [`Job`](super::Job).

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::state::WorkflowState;

/// A generation step of the pipeline, backed by one agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    GapAnalysis,
    Interrogation,
    Differentiation,
    Tailoring,
    AtsOptimization,
    ExecutiveSynthesis,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::GapAnalysis => "gap_analysis",
            Stage::Interrogation => "interrogation",
            Stage::Differentiation => "differentiation",
            Stage::Tailoring => "tailoring",
            Stage::AtsOptimization => "ats_optimization",
            Stage::ExecutiveSynthesis => "executive_synthesis",
        }
    }

    /// The generation stage executed while the job sits in `state`.
    pub fn for_state(state: WorkflowState) -> Option<Stage> {
        match state {
            WorkflowState::GapAnalysis => Some(Stage::GapAnalysis),
            WorkflowState::Interrogation => Some(Stage::Interrogation),
            WorkflowState::Differentiation => Some(Stage::Differentiation),
            WorkflowState::Tailoring => Some(Stage::Tailoring),
            WorkflowState::AtsOptimization => Some(Stage::AtsOptimization),
            WorkflowState::ExecutiveSynthesis => Some(Stage::ExecutiveSynthesis),
            _ => None,
        }
    }

    /// Parse and validate a raw agent response for this stage.
    ///
    /// Returns the typed output and the reported confidence.
    pub fn parse_output(&self, raw: &str) -> Result<(StageOutput, f64), SchemaError> {
        let value = extract_json(raw)?;

        if let Some(reported) = value.get("stage").and_then(|v| v.as_str())
            && reported != self.as_str()
        {
            return Err(SchemaError::new(format!(
                "response claims stage '{reported}', expected '{}'",
                self.as_str()
            )));
        }

        let confidence = value
            .get("confidence")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| SchemaError::new("missing numeric field 'confidence'"))?;
        check_range("confidence", confidence, 0.0, 1.0)?;

        let output = match self {
            Stage::GapAnalysis => StageOutput::GapAnalysis(decode(value)?),
            Stage::Interrogation => StageOutput::Interrogation(decode(value)?),
            Stage::Differentiation => StageOutput::Differentiation(decode(value)?),
            Stage::Tailoring => StageOutput::Tailoring(decode(value)?),
            Stage::AtsOptimization => StageOutput::AtsOptimization(decode(value)?),
            Stage::ExecutiveSynthesis => StageOutput::ExecutiveSynthesis(decode(value)?),
        };
        output.validate()?;
        Ok((output, confidence))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A response that arrived but does not fit its stage's schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaError(pub String);

impl SchemaError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pull the JSON object out of an LLM response.
///
/// Models like to wrap JSON in Markdown fences or add a sentence before it,
/// so everything from the first `{` to the last `}` is taken.
pub fn extract_json(raw: &str) -> Result<serde_json::Value, SchemaError> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if s < e => &raw[s..=e],
        _ => return Err(SchemaError::new("response contains no JSON object")),
    };
    serde_json::from_str(body).map_err(|e| SchemaError::new(format!("malformed JSON: {e}")))
}

/// Deserialize a value into a typed schema, mapping serde errors.
pub fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, SchemaError> {
    serde_json::from_value(value).map_err(|e| SchemaError::new(e.to_string()))
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> Result<(), SchemaError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(SchemaError::new(format!(
            "'{field}' = {value} is outside [{min}, {max}]"
        )))
    }
}

fn check_non_empty(field: &str, value: &str) -> Result<(), SchemaError> {
    if value.trim().is_empty() {
        Err(SchemaError::new(format!("'{field}' must not be empty")))
    } else {
        Ok(())
    }
}

/// The document set produced by tailoring and refined by later stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Documents {
    pub resume: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_letter: Option<String>,
}

impl Documents {
    fn validate(&self) -> Result<(), SchemaError> {
        check_non_empty("documents.resume", &self.resume)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Critical,
    Important,
    NiceToHave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub requirement: String,
    pub importance: Importance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapAnalysis {
    pub fit_score: f64,
    #[serde(default)]
    pub matched_requirements: Vec<String>,
    #[serde(default)]
    pub gaps: Vec<Gap>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_gap: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrogation {
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Differentiation {
    pub positioning_statement: String,
    pub differentiators: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tailoring {
    pub documents: Documents,
    #[serde(default)]
    pub changes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtsOptimization {
    pub documents: Documents,
    pub keyword_coverage: f64,
    #[serde(default)]
    pub missing_keywords: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    StrongApply,
    Apply,
    Stretch,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutiveSynthesis {
    pub summary: String,
    pub recommendation: Recommendation,
}

/// Typed output of one stage, tagged by the stage that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageOutput {
    GapAnalysis(GapAnalysis),
    Interrogation(Interrogation),
    Differentiation(Differentiation),
    Tailoring(Tailoring),
    AtsOptimization(AtsOptimization),
    ExecutiveSynthesis(ExecutiveSynthesis),
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::GapAnalysis(_) => Stage::GapAnalysis,
            StageOutput::Interrogation(_) => Stage::Interrogation,
            StageOutput::Differentiation(_) => Stage::Differentiation,
            StageOutput::Tailoring(_) => Stage::Tailoring,
            StageOutput::AtsOptimization(_) => Stage::AtsOptimization,
            StageOutput::ExecutiveSynthesis(_) => Stage::ExecutiveSynthesis,
        }
    }

    /// Documents carried by this output, if the stage produces any.
    pub fn documents(&self) -> Option<&Documents> {
        match self {
            StageOutput::Tailoring(t) => Some(&t.documents),
            StageOutput::AtsOptimization(a) => Some(&a.documents),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), SchemaError> {
        match self {
            StageOutput::GapAnalysis(g) => check_range("fit_score", g.fit_score, 0.0, 100.0),
            StageOutput::Interrogation(i) => {
                if i.questions.is_empty() {
                    return Err(SchemaError::new("'questions' must not be empty"));
                }
                i.questions
                    .iter()
                    .try_for_each(|q| check_non_empty("questions[].question", &q.question))
            }
            StageOutput::Differentiation(d) => {
                check_non_empty("positioning_statement", &d.positioning_statement)?;
                if d.differentiators.is_empty() {
                    return Err(SchemaError::new("'differentiators' must not be empty"));
                }
                Ok(())
            }
            StageOutput::Tailoring(t) => t.documents.validate(),
            StageOutput::AtsOptimization(a) => {
                a.documents.validate()?;
                check_range("keyword_coverage", a.keyword_coverage, 0.0, 100.0)
            }
            StageOutput::ExecutiveSynthesis(e) => check_non_empty("summary", &e.summary),
        }
    }
}

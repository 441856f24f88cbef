//! LLM backend abstraction: polymorphic providers that turn a prompt into
//! a structured animation spec.

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

use crate::spec::{ActionKind, AnimationSpec, ObjectKind, PaletteColor};

pub mod gemini;
pub mod local;
pub mod orchestrator;

pub use orchestrator::{OrchestratorError, SpecOrchestrator, SpecOutcome};

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend timed out")]
    Timeout,
    #[error("malformed output: {diagnostic}")]
    MalformedOutput { raw: String, diagnostic: String },
    #[error("backend refused: {0}")]
    Refused(String),
    #[error("backend rate limited")]
    RateLimited,
}

impl BackendError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "llm_unavailable",
            Self::Timeout => "llm_unavailable",
            Self::MalformedOutput { .. } => "llm_malformed",
            Self::Refused(_) => "llm_refused",
            Self::RateLimited => "llm_unavailable",
        }
    }

    /// Errors that justify switching to the fallback backend.
    pub fn is_switchable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout | Self::RateLimited)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackendHealth {
    pub ok: bool,
    pub latency_ms: u64,
}

#[async_trait]
pub trait SpecBackend: Send + Sync {
    fn name(&self) -> &str;

    /// One spec-generation call. Backends never retry internally.
    async fn generate_spec(
        &self,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<AnimationSpec, BackendError>;

    async fn health(&self) -> BackendHealth;
}

/// System instruction shared by every backend: the frozen vocabulary and
/// the output contract.
pub fn system_instruction() -> String {
    format!(
        "You translate a natural-language animation request into a single JSON object \
         and output nothing else.\n\
         The object has fields: scene_kind (one of \"2d\", \"moving_camera\", \"3d\"), \
         duration_hint (seconds, 1-30), background (palette color), objects, steps, \
         and optional camera.\n\
         Each object: {{id, kind, params, style}} where id matches [a-z][a-z0-9_]*, \
         kind is one of: {kinds}.\n\
         Each step: {{action, target_ids, params, run_time, wait_after}} where action \
         is one of: {actions}. target_ids only name objects declared earlier; \
         Transform, ReplacementTransform and MoveAlongPath take exactly two targets, \
         every other action exactly one.\n\
         Colors come from the palette: {palette}.\n\
         Limits: at most 50 objects, 100 steps, run_time 0.1-10, wait_after 0-5, \
         total playtime at most 60 seconds.",
        kinds = ObjectKind::all_tokens().join(", "),
        actions = ActionKind::all_tokens().join(", "),
        palette = PaletteColor::all_tokens().join(", "),
    )
}

/// Machine-checkable contract handed to structured-output backends.
pub fn spec_json_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "scene_kind": {"type": "string", "enum": ["2d", "moving_camera", "3d"]},
            "duration_hint": {"type": "number"},
            "background": {"type": "string", "enum": PaletteColor::all_tokens()},
            "objects": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "string"},
                        "kind": {"type": "string", "enum": ObjectKind::all_tokens()},
                        "params": {"type": "object"},
                        "style": {
                            "type": "object",
                            "properties": {
                                "color": {"type": "string", "enum": PaletteColor::all_tokens()},
                                "stroke_width": {"type": "number"},
                                "fill_opacity": {"type": "number"},
                                "z_index": {"type": "integer"}
                            }
                        }
                    },
                    "required": ["id", "kind"]
                }
            },
            "steps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ActionKind::all_tokens()},
                        "target_ids": {"type": "array", "items": {"type": "string"}},
                        "params": {"type": "object"},
                        "run_time": {"type": "number"},
                        "wait_after": {"type": "number"}
                    },
                    "required": ["action", "target_ids", "run_time"]
                }
            },
            "camera": {
                "type": "object",
                "properties": {
                    "center": {"type": "array", "items": {"type": "number"}},
                    "zoom": {"type": "number"},
                    "phi": {"type": "number"},
                    "theta": {"type": "number"}
                }
            }
        },
        "required": ["scene_kind", "duration_hint", "background", "objects", "steps"]
    })
}

const MAX_RAW_OUTPUT_BYTES: usize = 64 * 1024;
const MALFORMED_RAW_KEEP: usize = 4 * 1024;

/// Bounded parse of raw model output into a spec. Tolerates code fences
/// and prose around the JSON object, nothing more.
pub fn parse_spec_text(raw: &str) -> Result<AnimationSpec, BackendError> {
    if raw.len() > MAX_RAW_OUTPUT_BYTES {
        return Err(BackendError::MalformedOutput {
            raw: truncate(raw, MALFORMED_RAW_KEEP),
            diagnostic: format!("output exceeds {} bytes", MAX_RAW_OUTPUT_BYTES),
        });
    }
    let cleaned = raw.replace("```json", "").replace("```", "");
    let start = cleaned.find('{');
    let end = cleaned.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if e > s => &cleaned[s..=e],
        _ => {
            return Err(BackendError::MalformedOutput {
                raw: truncate(raw, MALFORMED_RAW_KEEP),
                diagnostic: "no JSON object in output".to_string(),
            });
        }
    };
    serde_json::from_str::<AnimationSpec>(body).map_err(|e| BackendError::MalformedOutput {
        raw: truncate(raw, MALFORMED_RAW_KEEP),
        diagnostic: e.to_string(),
    })
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

static SECRET_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"sk-[A-Za-z0-9_\-]{10,}").expect("secret pattern"),
        Regex::new(r"AIza[0-9A-Za-z_\-]{30,}").expect("secret pattern"),
        Regex::new(r"(?i)bearer\s+[A-Za-z0-9._\-]{8,}").expect("secret pattern"),
        Regex::new(r#"(?i)(api[_-]?key|secret|token|password)["']?\s*[=:]\s*["']?[^\s"']{6,}"#)
            .expect("secret pattern"),
    ]
});

/// Scrub secret-looking tokens before anything is persisted or logged.
pub fn redact_secrets(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in SECRET_PATTERNS.iter() {
        out = pattern.replace_all(&out, "[redacted]").into_owned();
    }
    out
}

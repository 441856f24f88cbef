//! Policy layer across LLM backends: backend selection, bounded repair of
//! malformed output, and fallback on availability failures.

use std::sync::Arc;
use tracing::{info, warn};

use super::{redact_secrets, BackendError, SpecBackend};
use crate::spec::{validate_spec, AnimationSpec};

/// One backend call as seen by the orchestrator, for the append-only
/// generation log.
#[derive(Debug, Clone)]
pub struct BackendAttempt {
    pub backend: String,
    pub outcome: String,
    pub diagnostic: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SpecOutcome {
    pub spec: AnimationSpec,
    pub backend: String,
    /// Backend calls spent, including repair re-issues.
    pub calls: u32,
    pub attempts: Vec<BackendAttempt>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OrchestratorError {
    pub kind: &'static str,
    pub message: String,
    pub calls: u32,
}

pub struct SpecOrchestrator {
    primary: Arc<dyn SpecBackend>,
    fallback: Arc<dyn SpecBackend>,
    attempt_budget: u32,
}

const MAX_REPAIRS: u32 = 2;
const REPAIR_RAW_KEEP: usize = 2 * 1024;

impl SpecOrchestrator {
    pub fn new(
        primary: Arc<dyn SpecBackend>,
        fallback: Arc<dyn SpecBackend>,
        attempt_budget: u32,
    ) -> Self {
        Self {
            primary,
            fallback,
            attempt_budget: attempt_budget.max(1),
        }
    }

    pub fn primary(&self) -> &Arc<dyn SpecBackend> {
        &self.primary
    }

    pub fn fallback(&self) -> &Arc<dyn SpecBackend> {
        &self.fallback
    }

    /// Produce a validated spec for the prompt, spending at most the
    /// attempt budget across primary, fallback, and repair calls.
    /// `context` carries downstream diagnostics (validator or renderer
    /// feedback) from an earlier pipeline attempt.
    pub async fn generate(
        &self,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<SpecOutcome, OrchestratorError> {
        let mut backend: &Arc<dyn SpecBackend> = &self.primary;
        let mut using_fallback = false;
        let mut calls = 0u32;
        let mut repairs = 0u32;
        let mut repair_context: Option<String> = None;
        let mut last_error: Option<BackendError> = None;
        let mut attempts: Vec<BackendAttempt> = Vec::new();

        while calls < self.attempt_budget {
            calls += 1;
            let merged = merge_context(context, repair_context.as_deref());
            let result = backend.generate_spec(prompt, merged.as_deref()).await;
            match result {
                Ok(spec) => match validate_spec(&spec) {
                    Ok(()) => {
                        info!(backend = backend.name(), calls, "spec generated");
                        attempts.push(BackendAttempt {
                            backend: backend.name().to_string(),
                            outcome: "spec_ok".to_string(),
                            diagnostic: None,
                        });
                        return Ok(SpecOutcome {
                            spec,
                            backend: backend.name().to_string(),
                            calls,
                            attempts,
                        });
                    }
                    Err(violation) => {
                        warn!(
                            backend = backend.name(),
                            "spec failed validation: {}", violation.message
                        );
                        attempts.push(BackendAttempt {
                            backend: backend.name().to_string(),
                            outcome: "malformed".to_string(),
                            diagnostic: Some(violation.message.clone()),
                        });
                        last_error = Some(BackendError::MalformedOutput {
                            raw: String::new(),
                            diagnostic: violation.message.clone(),
                        });
                        if repairs >= MAX_REPAIRS {
                            break;
                        }
                        repairs += 1;
                        repair_context = Some(format!(
                            "the JSON violated the schema: {}",
                            violation.message
                        ));
                    }
                },
                Err(BackendError::Refused(message)) => {
                    // Refusals are surfaced as-is; switching backends would
                    // launder them.
                    return Err(OrchestratorError {
                        kind: "llm_refused",
                        message: redact_secrets(&message),
                        calls,
                    });
                }
                Err(BackendError::MalformedOutput { raw, diagnostic }) => {
                    warn!(backend = backend.name(), "malformed output: {}", diagnostic);
                    attempts.push(BackendAttempt {
                        backend: backend.name().to_string(),
                        outcome: "malformed".to_string(),
                        diagnostic: Some(diagnostic.clone()),
                    });
                    if repairs >= MAX_REPAIRS {
                        last_error = Some(BackendError::MalformedOutput { raw, diagnostic });
                        break;
                    }
                    repairs += 1;
                    let kept = if raw.len() > REPAIR_RAW_KEEP {
                        &raw[..REPAIR_RAW_KEEP]
                    } else {
                        raw.as_str()
                    };
                    repair_context = Some(format!(
                        "the previous output could not be parsed ({}). Previous output:\n{}",
                        diagnostic, kept
                    ));
                    last_error = Some(BackendError::MalformedOutput { raw, diagnostic });
                }
                Err(error) if error.is_switchable() => {
                    warn!(
                        backend = backend.name(),
                        "backend unavailable ({}), trying fallback", error
                    );
                    attempts.push(BackendAttempt {
                        backend: backend.name().to_string(),
                        outcome: error.error_kind().to_string(),
                        diagnostic: Some(error.to_string()),
                    });
                    if !using_fallback {
                        using_fallback = true;
                        backend = &self.fallback;
                    }
                    last_error = Some(error);
                }
                Err(error) => {
                    last_error = Some(error);
                }
            }
        }

        let message = last_error
            .map(|e| redact_secrets(&e.to_string()))
            .unwrap_or_else(|| "no backend produced a spec".to_string());
        Err(OrchestratorError {
            kind: "llm_exhausted",
            message,
            calls,
        })
    }
}

fn merge_context(outer: Option<&str>, repair: Option<&str>) -> Option<String> {
    match (outer, repair) {
        (None, None) => None,
        (Some(o), None) => Some(o.to_string()),
        (None, Some(r)) => Some(r.to_string()),
        (Some(o), Some(r)) => Some(format!("{}\n{}", o, r)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::BackendHealth;
    use crate::spec::{ObjectDecl, PaletteColor, SceneKind, StepDecl, StyleDecl};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn good_spec() -> AnimationSpec {
        AnimationSpec {
            scene_kind: SceneKind::TwoD,
            duration_hint: 5.0,
            background: PaletteColor::Black,
            objects: vec![ObjectDecl {
                id: "c".to_string(),
                kind: "Circle".to_string(),
                params: BTreeMap::new(),
                style: StyleDecl::default(),
            }],
            steps: vec![StepDecl {
                action: "FadeIn".to_string(),
                target_ids: vec!["c".to_string()],
                params: BTreeMap::new(),
                run_time: 1.0,
                wait_after: 0.5,
            }],
            camera: None,
        }
    }

    struct ScriptedBackend {
        name: &'static str,
        script: Mutex<Vec<Result<AnimationSpec, BackendError>>>,
        calls: AtomicU32,
        saw_context: Mutex<Vec<bool>>,
    }

    impl ScriptedBackend {
        fn new(name: &'static str, script: Vec<Result<AnimationSpec, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
                saw_context: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SpecBackend for ScriptedBackend {
        fn name(&self) -> &str {
            self.name
        }

        async fn generate_spec(
            &self,
            _prompt: &str,
            context: Option<&str>,
        ) -> Result<AnimationSpec, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.saw_context.lock().unwrap().push(context.is_some());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Err(BackendError::Unavailable("script exhausted".to_string()))
            } else {
                script.remove(0)
            }
        }

        async fn health(&self) -> BackendHealth {
            BackendHealth {
                ok: true,
                latency_ms: 1,
            }
        }
    }

    fn malformed() -> BackendError {
        BackendError::MalformedOutput {
            raw: "{\"scene_kind\"".to_string(),
            diagnostic: "missing field style".to_string(),
        }
    }

    #[tokio::test]
    async fn primary_success_spends_one_call() {
        let primary = ScriptedBackend::new("gemini", vec![Ok(good_spec())]);
        let fallback = ScriptedBackend::new("local", vec![]);
        let orchestrator =
            SpecOrchestrator::new(primary.clone(), fallback.clone(), 3);
        let outcome = orchestrator.generate("a circle", None).await.unwrap();
        assert_eq!(outcome.backend, "gemini");
        assert_eq!(outcome.calls, 1);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn unavailable_primary_falls_back() {
        let primary = ScriptedBackend::new(
            "gemini",
            vec![Err(BackendError::Unavailable("connect refused".to_string()))],
        );
        let fallback = ScriptedBackend::new("local", vec![Ok(good_spec())]);
        let orchestrator =
            SpecOrchestrator::new(primary.clone(), fallback.clone(), 3);
        let outcome = orchestrator.generate("a circle", None).await.unwrap();
        assert_eq!(outcome.backend, "local");
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn malformed_output_is_repaired_with_context() {
        let primary =
            ScriptedBackend::new("gemini", vec![Err(malformed()), Ok(good_spec())]);
        let fallback = ScriptedBackend::new("local", vec![]);
        let orchestrator =
            SpecOrchestrator::new(primary.clone(), fallback.clone(), 3);
        let outcome = orchestrator.generate("a circle", None).await.unwrap();
        assert_eq!(outcome.calls, 2);
        let contexts = primary.saw_context.lock().unwrap().clone();
        assert_eq!(contexts, vec![false, true]);
    }

    #[tokio::test]
    async fn refusal_surfaces_without_fallback() {
        let primary = ScriptedBackend::new(
            "gemini",
            vec![Err(BackendError::Refused("policy".to_string()))],
        );
        let fallback = ScriptedBackend::new("local", vec![Ok(good_spec())]);
        let orchestrator =
            SpecOrchestrator::new(primary.clone(), fallback.clone(), 3);
        let error = orchestrator.generate("a circle", None).await.unwrap_err();
        assert_eq!(error.kind, "llm_refused");
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn budget_bounds_total_calls() {
        let primary = ScriptedBackend::new(
            "gemini",
            vec![Err(malformed()), Err(malformed()), Err(malformed()), Err(malformed())],
        );
        let fallback = ScriptedBackend::new("local", vec![]);
        let orchestrator =
            SpecOrchestrator::new(primary.clone(), fallback.clone(), 3);
        let error = orchestrator.generate("a circle", None).await.unwrap_err();
        assert_eq!(error.kind, "llm_exhausted");
        assert!(primary.calls() + fallback.calls() <= 3);
        assert!(error.message.contains("missing field"));
    }

    #[tokio::test]
    async fn invalid_spec_triggers_schema_repair() {
        let mut invalid = good_spec();
        invalid.steps[0].target_ids = vec!["ghost".to_string()];
        let primary =
            ScriptedBackend::new("gemini", vec![Ok(invalid), Ok(good_spec())]);
        let fallback = ScriptedBackend::new("local", vec![]);
        let orchestrator =
            SpecOrchestrator::new(primary.clone(), fallback.clone(), 3);
        let outcome = orchestrator.generate("a circle", None).await.unwrap();
        assert_eq!(outcome.calls, 2);
    }
}

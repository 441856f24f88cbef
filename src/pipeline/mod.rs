//! Job coordinator: the single writer of job state. Drives each job
//! through LLM specification, synthesis, validation, sandboxed rendering,
//! upload, and persistence, and isolates its failures.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::llm::{redact_secrets, SpecOrchestrator};
use crate::render::{render_scene, RenderError, RenderGroup, RendererConfig};
use crate::sandbox::{Sandbox, SandboxConfig};
use crate::shared::models::VideoStatus;
use crate::storage::{StorageAdapter, StorageError};
use crate::store::{AttemptLog, MetadataStore, VideoPatch};
use crate::synth::{synthesize, SynthError};
use crate::validator::validate_source;

pub mod error;
pub mod worker;

pub use error::{ErrorKind, JobError};
pub use worker::{JobQueue, JobRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    LlmGenerating,
    Synthesizing,
    Validating,
    Rendering,
    Uploading,
    Persisting,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::LlmGenerating => "llm_generating",
            Self::Synthesizing => "synthesizing",
            Self::Validating => "validating",
            Self::Rendering => "rendering",
            Self::Uploading => "uploading",
            Self::Persisting => "persisting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    pub attempt: u32,
    pub video_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub attempt_cap: u32,
    pub job_deadline: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            attempt_cap: 3,
            job_deadline: Duration::from_secs(300),
        }
    }
}

struct CompletedUpload {
    object_key: String,
    url: String,
    file_size: i64,
    duration_s: f64,
    backend: String,
}

pub struct JobCoordinator {
    llm: SpecOrchestrator,
    storage: Arc<dyn StorageAdapter>,
    store: Arc<dyn MetadataStore>,
    sandbox_config: SandboxConfig,
    renderer_config: RendererConfig,
    config: CoordinatorConfig,
    jobs: RwLock<HashMap<Uuid, JobStatus>>,
    cancels: RwLock<HashMap<Uuid, Arc<Notify>>>,
}

impl JobCoordinator {
    pub fn new(
        llm: SpecOrchestrator,
        storage: Arc<dyn StorageAdapter>,
        store: Arc<dyn MetadataStore>,
        sandbox_config: SandboxConfig,
        renderer_config: RendererConfig,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            llm,
            storage,
            store,
            sandbox_config,
            renderer_config,
            config,
            jobs: RwLock::new(HashMap::new()),
            cancels: RwLock::new(HashMap::new()),
        }
    }

    pub async fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    /// Record a job as queued before it is handed to the worker pool, so
    /// status polls between admission and pickup see `queued`.
    pub async fn register(&self, job_id: Uuid) {
        self.jobs.write().await.insert(
            job_id,
            JobStatus {
                state: JobState::Queued,
                attempt: 0,
                video_id: job_id,
                url: None,
                error: None,
            },
        );
    }

    /// Drop a registration that never made it into the queue.
    pub async fn unregister(&self, job_id: Uuid) {
        self.jobs.write().await.remove(&job_id);
    }

    /// Client-requested cancellation; treated exactly like deadline
    /// expiry.
    pub async fn cancel(&self, job_id: Uuid) {
        if let Some(notify) = self.cancels.read().await.get(&job_id) {
            notify.notify_one();
        }
    }

    async fn set_state(&self, job_id: Uuid, state: JobState, attempt: u32) {
        let mut jobs = self.jobs.write().await;
        if let Some(status) = jobs.get_mut(&job_id) {
            status.state = state;
            status.attempt = attempt;
        }
    }

    async fn set_state_only(&self, job_id: Uuid, state: JobState) {
        let mut jobs = self.jobs.write().await;
        if let Some(status) = jobs.get_mut(&job_id) {
            status.state = state;
        }
    }

    async fn log(&self, video_id: Uuid, attempt: AttemptLog) {
        if let Err(e) = self.store.log_attempt(video_id, attempt).await {
            warn!(video_id = %video_id, "failed to write generation log: {}", e);
        }
    }

    /// Run one job to a terminal state. This is the only place job state
    /// is mutated.
    pub async fn run(&self, job_id: Uuid, user_id: &str, prompt: &str) {
        let safe_prompt = redact_secrets(prompt);
        if let Err(e) = self.store.ensure_user(user_id).await {
            error!(job_id = %job_id, "cannot ensure user row: {}", e);
        }
        // The video row shares the job id, so status survives the loss of
        // the in-memory map.
        let video_id = job_id;
        if let Err(e) = self.store.create_video(user_id, video_id, &safe_prompt).await {
            error!(job_id = %job_id, "cannot create video row: {}", e);
            self.jobs.write().await.insert(
                job_id,
                JobStatus {
                    state: JobState::Failed,
                    attempt: 0,
                    video_id,
                    url: None,
                    error: Some(JobError::new(ErrorKind::DbFailed, "could not record job")),
                },
            );
            return;
        }

        self.jobs.write().await.insert(
            job_id,
            JobStatus {
                state: JobState::Queued,
                attempt: 0,
                video_id,
                url: None,
                error: None,
            },
        );
        let cancel = Arc::new(Notify::new());
        self.cancels.write().await.insert(job_id, cancel.clone());

        // Shared handle to the renderer's process group, so teardown can
        // signal the whole group even when it is the job deadline (not the
        // render wall clock) that expires mid-render.
        let render_group = RenderGroup::new();

        let started = Instant::now();
        let outcome = tokio::select! {
            driven = tokio::time::timeout(
                self.config.job_deadline,
                self.drive(job_id, user_id, video_id, &safe_prompt, &render_group),
            ) => match driven {
                Ok(result) => result,
                Err(_) => {
                    render_group.terminate().await;
                    Err(JobError::new(
                        ErrorKind::DeadlineExceeded,
                        "job exceeded its end-to-end deadline",
                    ))
                }
            },
            _ = cancel.notified() => {
                render_group.terminate().await;
                Err(JobError::new(
                    ErrorKind::Cancelled,
                    "job cancelled by client",
                ))
            }
        };
        self.cancels.write().await.remove(&job_id);

        match outcome {
            Ok(upload) => {
                self.set_state_only(job_id, JobState::Persisting).await;
                let patch = VideoPatch {
                    object_key: Some(upload.object_key.clone()),
                    result_url: Some(upload.url.clone()),
                    file_size: Some(upload.file_size),
                    duration_s: Some(upload.duration_s),
                    width: Some(self.renderer_config.width as i32),
                    height: Some(self.renderer_config.height as i32),
                    status: Some(VideoStatus::Completed.as_str().to_string()),
                    generation_time_s: Some(started.elapsed().as_secs_f64()),
                };
                if let Err(e) = self.store.update_video(user_id, video_id, patch).await {
                    error!(job_id = %job_id, "failed to persist completion: {}", e);
                    self.fail(job_id, user_id, video_id, JobError::new(
                        ErrorKind::DbFailed,
                        "could not persist the finished video",
                    ))
                    .await;
                    return;
                }
                self.log(
                    video_id,
                    AttemptLog::new(0, &upload.backend, "persisting", "completed"),
                )
                .await;
                let mut jobs = self.jobs.write().await;
                if let Some(status) = jobs.get_mut(&job_id) {
                    status.state = JobState::Completed;
                    status.url = Some(upload.url);
                }
                info!(job_id = %job_id, video_id = %video_id, "job completed");
            }
            Err(job_error) => {
                self.fail(job_id, user_id, video_id, job_error).await;
            }
        }
    }

    async fn fail(&self, job_id: Uuid, user_id: &str, video_id: Uuid, job_error: JobError) {
        warn!(job_id = %job_id, kind = %job_error.kind, "job failed: {}", job_error.message);
        let _ = self
            .store
            .update_video(user_id, video_id, VideoPatch::status(VideoStatus::Failed))
            .await;
        self.log(
            video_id,
            AttemptLog::new(0, "pipeline", "failed", "failed")
                .with_error(job_error.kind.as_str(), &job_error.message),
        )
        .await;
        let mut jobs = self.jobs.write().await;
        if let Some(status) = jobs.get_mut(&job_id) {
            status.state = JobState::Failed;
            status.error = Some(job_error);
        }
    }

    /// The per-attempt loop: spec, synthesize, validate, render, upload.
    /// Repairable failures feed the diagnostic back into the next LLM
    /// round; the global attempt cap bounds the whole loop.
    async fn drive(
        &self,
        job_id: Uuid,
        user_id: &str,
        video_id: Uuid,
        prompt: &str,
        render_group: &RenderGroup,
    ) -> Result<CompletedUpload, JobError> {
        let mut context: Option<String> = None;
        let mut last_error = JobError::new(ErrorKind::Exhausted, "no attempts were made");

        for attempt in 1..=self.config.attempt_cap {
            let attempt_no = attempt as i32;
            self.set_state(job_id, JobState::LlmGenerating, attempt).await;
            self.log(
                video_id,
                AttemptLog::new(attempt_no, "pipeline", "llm_generating", "started"),
            )
            .await;

            let outcome = match self.llm.generate(prompt, context.as_deref()).await {
                Ok(outcome) => outcome,
                Err(orchestration) => {
                    let kind = match orchestration.kind {
                        "llm_refused" => ErrorKind::LlmRefused,
                        _ => ErrorKind::LlmExhausted,
                    };
                    self.log(
                        video_id,
                        AttemptLog::new(attempt_no, "pipeline", "llm_generating", "failed")
                            .with_error(kind.as_str(), &orchestration.message),
                    )
                    .await;
                    return Err(JobError::new(kind, orchestration.message));
                }
            };
            let spec = outcome.spec;
            let backend = outcome.backend;
            let spec_hash = spec.content_hash();
            for call in &outcome.attempts {
                let mut row =
                    AttemptLog::new(attempt_no, &call.backend, "llm_generating", &call.outcome);
                if call.outcome == "spec_ok" {
                    row = row.with_spec_hash(&spec_hash);
                } else if let Some(diagnostic) = &call.diagnostic {
                    let kind = if call.outcome == "malformed" {
                        "llm_malformed"
                    } else {
                        call.outcome.as_str()
                    };
                    row = row.with_error(kind, &redact_secrets(diagnostic));
                }
                self.log(video_id, row).await;
            }

            self.set_state(job_id, JobState::Synthesizing, attempt).await;
            let source = match synthesize(&spec) {
                Ok(source) => source,
                Err(SynthError::UnknownVocabulary { token }) => {
                    let message = format!("spec names unknown vocabulary {:?}", token);
                    self.log(
                        video_id,
                        AttemptLog::new(attempt_no, &backend, "synthesizing", "failed")
                            .with_error(ErrorKind::UnknownVocabulary.as_str(), &message),
                    )
                    .await;
                    last_error = JobError::new(ErrorKind::UnknownVocabulary, message.clone());
                    context = Some(format!(
                        "the spec used {:?}, which is outside the allowed vocabulary",
                        token
                    ));
                    continue;
                }
            };

            self.set_state(job_id, JobState::Validating, attempt).await;
            if let Err(violation) = validate_source(&source, spec.scene_kind) {
                let kind = match violation.kind {
                    crate::validator::ViolationKind::BannedSymbol => ErrorKind::BannedSymbol,
                    crate::validator::ViolationKind::Schema => ErrorKind::Schema,
                    crate::validator::ViolationKind::Shape => ErrorKind::Shape,
                    crate::validator::ViolationKind::TooLarge => ErrorKind::TooLarge,
                };
                let message = violation.to_string();
                self.log(
                    video_id,
                    AttemptLog::new(attempt_no, &backend, "validating", "failed")
                        .with_error(kind.as_str(), &message)
                        .with_source(&source),
                )
                .await;
                last_error = JobError::new(kind, message.clone());
                context = Some(format!("the generated scene was rejected: {}", message));
                continue;
            }
            self.log(
                video_id,
                AttemptLog::new(attempt_no, &backend, "validating", "ok").with_source(&source),
            )
            .await;

            self.set_state(job_id, JobState::Rendering, attempt).await;
            let rendered = {
                let sandbox = Sandbox::create(&self.sandbox_config, job_id).map_err(|e| {
                    JobError::new(
                        ErrorKind::RenderFailed,
                        format!("could not prepare the sandbox: {}", e),
                    )
                })?;
                match render_scene(&self.renderer_config, &sandbox, &source, render_group).await {
                    Ok(outcome) => {
                        self.set_state(job_id, JobState::Uploading, attempt).await;
                        self.log(
                            video_id,
                            AttemptLog::new(attempt_no, &backend, "rendering", "artifact_found"),
                        )
                        .await;
                        let stored = self
                            .storage
                            .put(user_id, &outcome.artifact, "video/mp4")
                            .await
                            .map_err(|e| match e {
                                StorageError::Auth => {
                                    JobError::new(ErrorKind::Auth, "storage rejected credentials")
                                }
                                StorageError::Quota => JobError::new(
                                    ErrorKind::UploadFailed,
                                    "storage quota exceeded",
                                ),
                                StorageError::Io(message) => JobError::new(
                                    ErrorKind::UploadFailed,
                                    format!("upload failed: {}", message),
                                ),
                            })?;
                        // The artifact is owned by the sandbox until the
                        // upload is acknowledged; drop the local copy now.
                        let _ = std::fs::remove_file(&outcome.artifact);
                        self.log(
                            video_id,
                            AttemptLog::new(attempt_no, &backend, "uploading", "ok"),
                        )
                        .await;
                        Ok(CompletedUpload {
                            object_key: stored.object_key,
                            url: stored.url,
                            file_size: stored.file_size,
                            duration_s: spec.total_playtime(),
                            backend,
                        })
                    }
                    Err(render_error) => Err(render_error),
                }
                // Sandbox dropped here: working directory removed on every
                // path, including upload failure.
            };

            match rendered {
                Ok(upload) => return Ok(upload),
                Err(RenderError::Timeout) => {
                    let message = "renderer exceeded the wall clock".to_string();
                    self.log(
                        video_id,
                        AttemptLog::new(attempt_no, "pipeline", "rendering", "failed")
                            .with_error(ErrorKind::RenderTimeout.as_str(), &message),
                    )
                    .await;
                    last_error = JobError::new(ErrorKind::RenderTimeout, message);
                    context = Some("the rendered scene timed out; produce a simpler, shorter animation".to_string());
                }
                Err(RenderError::NonzeroExit { code, stderr_tail }) => {
                    let safe_tail = redact_secrets(&stderr_tail);
                    let message = format!("renderer exited with status {}", code);
                    self.log(
                        video_id,
                        AttemptLog::new(attempt_no, "pipeline", "rendering", "failed")
                            .with_error(ErrorKind::RenderFailed.as_str(), &safe_tail),
                    )
                    .await;
                    last_error = JobError::new(ErrorKind::RenderFailed, message);
                    context = Some(format!("rendering failed with this error:\n{}", safe_tail));
                }
                Err(RenderError::NoOutputArtifact) => {
                    let message = "renderer produced no output artifact".to_string();
                    self.log(
                        video_id,
                        AttemptLog::new(attempt_no, "pipeline", "rendering", "failed")
                            .with_error(ErrorKind::NoOutputArtifact.as_str(), &message),
                    )
                    .await;
                    last_error = JobError::new(ErrorKind::NoOutputArtifact, message.clone());
                    context = Some(format!("{}; the scene may have nothing to render", message));
                }
                Err(RenderError::Spawn(message)) => {
                    // The tool itself is missing or broken; retrying with a
                    // new spec cannot help.
                    self.log(
                        video_id,
                        AttemptLog::new(attempt_no, "pipeline", "rendering", "failed")
                            .with_error(ErrorKind::RenderFailed.as_str(), &message),
                    )
                    .await;
                    return Err(JobError::new(ErrorKind::RenderFailed, message));
                }
            }
        }

        Err(JobError::new(
            ErrorKind::Exhausted,
            format!(
                "attempt budget spent; last failure was {}: {}",
                last_error.kind, last_error.message
            ),
        ))
    }
}

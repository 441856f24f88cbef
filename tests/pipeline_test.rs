//! End-to-end pipeline tests: the coordinator drives jobs against
//! scripted LLM backends, a stub renderer executable, and in-memory
//! storage and metadata adapters.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use animserver::llm::{BackendError, BackendHealth, SpecBackend, SpecOrchestrator};
use animserver::pipeline::{CoordinatorConfig, ErrorKind, JobCoordinator, JobState};
use animserver::render::RendererConfig;
use animserver::sandbox::SandboxConfig;
use animserver::shared::models::{Video, VideoStatus};
use animserver::spec::{AnimationSpec, ObjectDecl, PaletteColor, SceneKind, StepDecl, StyleDecl};
use animserver::storage::{
    key_belongs_to, make_object_key, DeleteOutcome, StorageAdapter, StorageError, StoredObject,
};
use animserver::store::{AttemptLog, MetadataStore, StoreError, VideoFilters, VideoPatch};

fn good_spec() -> AnimationSpec {
    let mut params = BTreeMap::new();
    params.insert("radius".to_string(), serde_json::json!(1.0));
    AnimationSpec {
        scene_kind: SceneKind::TwoD,
        duration_hint: 5.0,
        background: PaletteColor::Black,
        objects: vec![ObjectDecl {
            id: "c".to_string(),
            kind: "Circle".to_string(),
            params,
            style: StyleDecl {
                color: Some(PaletteColor::Blue),
                ..Default::default()
            },
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

fn corrupted_spec() -> AnimationSpec {
    let mut spec = good_spec();
    spec.objects[0].kind = "os.system".to_string();
    spec
}

struct ScriptedBackend {
    name: &'static str,
    script: Mutex<Vec<Result<AnimationSpec, BackendError>>>,
    repeat_last: bool,
}

impl ScriptedBackend {
    fn new(script: Vec<Result<AnimationSpec, BackendError>>) -> Arc<Self> {
        Arc::new(Self {
            name: "scripted",
            script: Mutex::new(script),
            repeat_last: false,
        })
    }

    fn repeating(spec: AnimationSpec) -> Arc<Self> {
        Arc::new(Self {
            name: "scripted",
            script: Mutex::new(vec![Ok(spec)]),
            repeat_last: true,
        })
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
        _context: Option<&str>,
    ) -> Result<AnimationSpec, BackendError> {
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            return Err(BackendError::Unavailable("script exhausted".to_string()));
        }
        if self.repeat_last && script.len() == 1 {
            return script[0].clone();
        }
        script.remove(0)
    }

    async fn health(&self) -> BackendHealth {
        BackendHealth {
            ok: true,
            latency_ms: 1,
        }
    }
}

#[derive(Default)]
struct MemoryStore {
    videos: Mutex<HashMap<Uuid, Video>>,
    logs: Mutex<Vec<AttemptLog>>,
}

impl MemoryStore {
    fn video(&self, id: Uuid) -> Option<Video> {
        self.videos.lock().unwrap().get(&id).cloned()
    }

    fn log_rows(&self) -> Vec<AttemptLog> {
        self.logs.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn ensure_user(&self, _user_id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_video(
        &self,
        user_id: &str,
        video_id: Uuid,
        prompt: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.videos.lock().unwrap().insert(
            video_id,
            Video {
                id: video_id,
                user_id: user_id.to_string(),
                prompt: prompt.to_string(),
                object_key: None,
                result_url: None,
                file_size: None,
                duration_s: None,
                width: None,
                height: None,
                status: VideoStatus::Processing.as_str().to_string(),
                tags: vec![],
                generation_time_s: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn update_video(
        &self,
        user_id: &str,
        video_id: Uuid,
        patch: VideoPatch,
    ) -> Result<(), StoreError> {
        let mut videos = self.videos.lock().unwrap();
        let row = videos.get_mut(&video_id).ok_or(StoreError::NotFound)?;
        if row.user_id != user_id {
            return Err(StoreError::NotFound);
        }
        if let Some(v) = patch.object_key {
            row.object_key = Some(v);
        }
        if let Some(v) = patch.result_url {
            row.result_url = Some(v);
        }
        if let Some(v) = patch.file_size {
            row.file_size = Some(v);
        }
        if let Some(v) = patch.duration_s {
            row.duration_s = Some(v);
        }
        if let Some(v) = patch.width {
            row.width = Some(v);
        }
        if let Some(v) = patch.height {
            row.height = Some(v);
        }
        if let Some(v) = patch.status {
            row.status = v;
        }
        if let Some(v) = patch.generation_time_s {
            row.generation_time_s = Some(v);
        }
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn log_attempt(&self, _video_id: Uuid, attempt: AttemptLog) -> Result<(), StoreError> {
        self.logs.lock().unwrap().push(attempt);
        Ok(())
    }

    async fn get_video(&self, user_id: &str, video_id: Uuid) -> Result<Video, StoreError> {
        let videos = self.videos.lock().unwrap();
        let row = videos.get(&video_id).ok_or(StoreError::NotFound)?;
        if row.user_id != user_id || row.status == VideoStatus::Deleted.as_str() {
            return Err(StoreError::NotFound);
        }
        Ok(row.clone())
    }

    async fn list_videos(
        &self,
        user_id: &str,
        _filters: VideoFilters,
    ) -> Result<Vec<Video>, StoreError> {
        Ok(self
            .videos
            .lock()
            .unwrap()
            .values()
            .filter(|v| v.user_id == user_id && v.status != VideoStatus::Deleted.as_str())
            .cloned()
            .collect())
    }

    async fn delete_video(&self, user_id: &str, video_id: Uuid) -> Result<Video, StoreError> {
        let mut videos = self.videos.lock().unwrap();
        let row = videos.get_mut(&video_id).ok_or(StoreError::NotFound)?;
        if row.user_id != user_id || row.status == VideoStatus::Deleted.as_str() {
            return Err(StoreError::NotFound);
        }
        let before = row.clone();
        row.status = VideoStatus::Deleted.as_str().to_string();
        Ok(before)
    }
}

#[derive(Default)]
struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    put_delay: Option<Duration>,
}

impl MemoryStorage {
    fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn put(
        &self,
        user_id: &str,
        local_path: &Path,
        _content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        if let Some(delay) = self.put_delay {
            tokio::time::sleep(delay).await;
        }
        let data = std::fs::read(local_path).map_err(|e| StorageError::Io(e.to_string()))?;
        let object_key = make_object_key("", user_id);
        let file_size = data.len() as i64;
        self.objects.lock().unwrap().insert(object_key.clone(), data);
        Ok(StoredObject {
            url: format!("memory://{}", object_key),
            object_key,
            file_size,
        })
    }

    async fn delete(&self, user_id: &str, object_key: &str) -> Result<DeleteOutcome, StorageError> {
        if !key_belongs_to("", user_id, object_key) {
            return Ok(DeleteOutcome::Forbidden);
        }
        match self.objects.lock().unwrap().remove(object_key) {
            Some(_) => Ok(DeleteOutcome::Ok),
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn fetch(&self, user_id: &str, object_key: &str) -> Result<Vec<u8>, StorageError> {
        if !key_belongs_to("", user_id, object_key) {
            return Err(StorageError::Auth);
        }
        self.objects
            .lock()
            .unwrap()
            .get(object_key)
            .cloned()
            .ok_or_else(|| StorageError::Io("object missing".to_string()))
    }
}

const HAPPY_RENDERER: &str = "#!/bin/sh\n\
mkdir -p \"$4/videos/GeneratedScene/720p30\"\n\
head -c 2048 /dev/zero > \"$4/videos/GeneratedScene/720p30/GeneratedScene.mp4\"\n";

const SLEEPY_RENDERER: &str = "#!/bin/sh\nsleep 30\n";

const EMPTY_HANDED_RENDERER: &str = "#!/bin/sh\nexit 0\n";

fn write_renderer(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-renderer");
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Harness {
    coordinator: Arc<JobCoordinator>,
    store: Arc<MemoryStore>,
    storage: Arc<MemoryStorage>,
    sandbox_base: PathBuf,
    _tmp: tempfile::TempDir,
}

fn harness(
    backend: Arc<ScriptedBackend>,
    renderer_body: &str,
    attempt_cap: u32,
    wall_timeout_s: u64,
    job_deadline: Duration,
    storage: Arc<MemoryStorage>,
) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let renderer_bin = write_renderer(tmp.path(), renderer_body);
    let sandbox_base = tmp.path().join("sandboxes");

    let store = Arc::new(MemoryStore::default());
    let orchestrator = SpecOrchestrator::new(backend.clone(), backend, 3);
    let coordinator = Arc::new(JobCoordinator::new(
        orchestrator,
        storage.clone(),
        store.clone(),
        SandboxConfig {
            base_dir: sandbox_base.clone(),
            wall_timeout_s,
            disable_limits: true,
            ..Default::default()
        },
        RendererConfig {
            bin: renderer_bin.to_string_lossy().into_owned(),
            ..Default::default()
        },
        CoordinatorConfig {
            attempt_cap,
            job_deadline,
        },
    ));
    Harness {
        coordinator,
        store,
        storage,
        sandbox_base,
        _tmp: tmp,
    }
}

fn sandbox_is_clean(base: &Path) -> bool {
    match std::fs::read_dir(base) {
        Ok(entries) => entries.count() == 0,
        Err(_) => true,
    }
}

#[tokio::test]
async fn happy_path_completes_and_publishes() {
    let h = harness(
        ScriptedBackend::new(vec![Ok(good_spec())]),
        HAPPY_RENDERER,
        3,
        120,
        Duration::from_secs(300),
        Arc::new(MemoryStorage::default()),
    );
    let job_id = Uuid::new_v4();
    h.coordinator
        .run(job_id, "user_a", "Create a blue circle that fades in")
        .await;

    let status = h.coordinator.status(job_id).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    let url = status.url.unwrap();
    assert!(url.starts_with("memory://user_a/"));

    let row = h.store.video(job_id).unwrap();
    assert_eq!(row.status, "completed");
    assert_eq!(row.width, Some(1280));
    assert_eq!(row.height, Some(720));
    assert!((row.duration_s.unwrap() - 1.5).abs() < 1e-9);
    let key = row.object_key.unwrap();
    let re = regex::Regex::new(r"^user_a/[0-9A-HJKMNP-TV-Z]{26}\.mp4$").unwrap();
    assert!(re.is_match(&key), "unexpected object key {}", key);
    assert_eq!(h.storage.keys(), vec![key]);

    let outcomes: Vec<String> = h.store.log_rows().iter().map(|l| l.outcome.clone()).collect();
    assert!(outcomes.contains(&"spec_ok".to_string()));
    assert!(outcomes.contains(&"artifact_found".to_string()));
    assert!(outcomes.contains(&"completed".to_string()));

    assert!(sandbox_is_clean(&h.sandbox_base));
}

#[tokio::test]
async fn malformed_output_is_repaired_then_completes() {
    let malformed = BackendError::MalformedOutput {
        raw: "{\"scene_kind\": \"2d\"".to_string(),
        diagnostic: "unexpected end of input".to_string(),
    };
    let h = harness(
        ScriptedBackend::new(vec![Err(malformed), Ok(good_spec())]),
        HAPPY_RENDERER,
        3,
        120,
        Duration::from_secs(300),
        Arc::new(MemoryStorage::default()),
    );
    let job_id = Uuid::new_v4();
    h.coordinator.run(job_id, "user_a", "a circle").await;

    let status = h.coordinator.status(job_id).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    let outcomes: Vec<String> = h.store.log_rows().iter().map(|l| l.outcome.clone()).collect();
    assert!(outcomes.contains(&"malformed".to_string()));
    assert!(outcomes.contains(&"spec_ok".to_string()));
}

#[tokio::test]
async fn unknown_vocabulary_is_refused_and_exhausts() {
    // Default attempt cap: unknown vocabulary is retried under the same
    // cap as every other repairable failure.
    let h = harness(
        ScriptedBackend::repeating(corrupted_spec()),
        HAPPY_RENDERER,
        3,
        120,
        Duration::from_secs(300),
        Arc::new(MemoryStorage::default()),
    );
    let job_id = Uuid::new_v4();
    h.coordinator.run(job_id, "user_a", "a circle").await;

    let status = h.coordinator.status(job_id).await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error.as_ref().unwrap().kind, ErrorKind::Exhausted);
    assert!(status
        .error
        .as_ref()
        .unwrap()
        .message
        .contains("unknown_vocabulary"));

    let rows = h.store.log_rows();
    let refusals: Vec<_> = rows
        .iter()
        .filter(|l| l.error_kind.as_deref() == Some("unknown_vocabulary"))
        .collect();
    assert_eq!(refusals.len(), 3, "one refusal per attempt");
    assert_eq!(h.store.video(job_id).unwrap().status, "failed");
    // Nothing was rendered or uploaded.
    assert!(h.storage.keys().is_empty());
}

#[tokio::test]
async fn render_timeout_kills_subprocess_and_fails() {
    let h = harness(
        ScriptedBackend::repeating(good_spec()),
        SLEEPY_RENDERER,
        1,
        1,
        Duration::from_secs(300),
        Arc::new(MemoryStorage::default()),
    );
    let job_id = Uuid::new_v4();
    let started = std::time::Instant::now();
    h.coordinator.run(job_id, "user_a", "a circle").await;
    assert!(
        started.elapsed() < Duration::from_secs(20),
        "timeout must not wait for the full sleep"
    );

    let status = h.coordinator.status(job_id).await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    let rows = h.store.log_rows();
    assert!(rows
        .iter()
        .any(|l| l.error_kind.as_deref() == Some("render_timeout")));
    assert!(sandbox_is_clean(&h.sandbox_base));
}

#[tokio::test]
async fn renderer_without_artifact_reports_no_output() {
    let h = harness(
        ScriptedBackend::repeating(good_spec()),
        EMPTY_HANDED_RENDERER,
        1,
        120,
        Duration::from_secs(300),
        Arc::new(MemoryStorage::default()),
    );
    let job_id = Uuid::new_v4();
    h.coordinator.run(job_id, "user_a", "a circle").await;

    let status = h.coordinator.status(job_id).await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    let rows = h.store.log_rows();
    assert!(rows
        .iter()
        .any(|l| l.error_kind.as_deref() == Some("no_output_artifact")));
}

#[tokio::test]
async fn deadline_during_upload_fails_without_partial_publication() {
    let slow_storage = Arc::new(MemoryStorage {
        objects: Mutex::new(HashMap::new()),
        put_delay: Some(Duration::from_secs(30)),
    });
    let h = harness(
        ScriptedBackend::repeating(good_spec()),
        HAPPY_RENDERER,
        1,
        120,
        Duration::from_secs(2),
        slow_storage.clone(),
    );
    let job_id = Uuid::new_v4();
    h.coordinator.run(job_id, "user_a", "a circle").await;

    let status = h.coordinator.status(job_id).await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(
        status.error.as_ref().unwrap().kind,
        ErrorKind::DeadlineExceeded
    );
    assert!(status.url.is_none());
    assert!(slow_storage.keys().is_empty(), "no partial object published");
    assert_eq!(h.store.video(job_id).unwrap().status, "failed");
    assert!(h.store.video(job_id).unwrap().result_url.is_none());
}

#[tokio::test]
async fn deadline_mid_render_tears_down_the_subprocess_group() {
    // The render wall clock (120s) is far beyond the job deadline, so it
    // is the deadline that interrupts the hung renderer.
    let h = harness(
        ScriptedBackend::repeating(good_spec()),
        SLEEPY_RENDERER,
        1,
        120,
        Duration::from_secs(2),
        Arc::new(MemoryStorage::default()),
    );
    let job_id = Uuid::new_v4();
    let started = std::time::Instant::now();
    h.coordinator.run(job_id, "user_a", "a circle").await;
    // Deadline plus the group-termination grace window, not the 30s sleep.
    assert!(
        started.elapsed() < Duration::from_secs(15),
        "group teardown must not wait for the renderer"
    );

    let status = h.coordinator.status(job_id).await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(
        status.error.as_ref().unwrap().kind,
        ErrorKind::DeadlineExceeded
    );
    assert_eq!(h.store.video(job_id).unwrap().status, "failed");
    assert!(sandbox_is_clean(&h.sandbox_base));
}

#[tokio::test]
async fn cancellation_is_treated_as_deadline_expiry() {
    let h = harness(
        ScriptedBackend::repeating(good_spec()),
        SLEEPY_RENDERER,
        1,
        120,
        Duration::from_secs(300),
        Arc::new(MemoryStorage::default()),
    );
    let job_id = Uuid::new_v4();
    let coordinator = h.coordinator.clone();
    let run = tokio::spawn(async move {
        coordinator.run(job_id, "user_a", "a circle").await;
    });

    // Wait for the job to reach the renderer, then cancel.
    for _ in 0..100 {
        if let Some(status) = h.coordinator.status(job_id).await {
            if status.state == JobState::Rendering {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    h.coordinator.cancel(job_id).await;
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("cancel must end the job promptly")
        .unwrap();

    let status = h.coordinator.status(job_id).await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(h.store.video(job_id).unwrap().status, "failed");
}

#[tokio::test]
async fn listings_are_isolated_per_user() {
    let h = harness(
        ScriptedBackend::new(vec![Ok(good_spec())]),
        HAPPY_RENDERER,
        3,
        120,
        Duration::from_secs(300),
        Arc::new(MemoryStorage::default()),
    );
    let job_id = Uuid::new_v4();
    h.coordinator.run(job_id, "user_a", "a circle").await;

    let mine = h
        .store
        .list_videos("user_a", VideoFilters::default())
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    let theirs = h
        .store
        .list_videos("user_b", VideoFilters::default())
        .await
        .unwrap();
    assert!(theirs.is_empty());
    assert!(matches!(
        h.store.get_video("user_b", job_id).await,
        Err(StoreError::NotFound)
    ));

    let key = h.store.video(job_id).unwrap().object_key.unwrap();
    assert!(matches!(
        h.storage.fetch("user_b", &key).await,
        Err(StorageError::Auth)
    ));
    assert_eq!(
        h.storage.delete("user_b", &key).await.unwrap(),
        DeleteOutcome::Forbidden
    );
}

#[tokio::test]
async fn delete_is_idempotent_at_the_store() {
    let h = harness(
        ScriptedBackend::new(vec![Ok(good_spec())]),
        HAPPY_RENDERER,
        3,
        120,
        Duration::from_secs(300),
        Arc::new(MemoryStorage::default()),
    );
    let job_id = Uuid::new_v4();
    h.coordinator.run(job_id, "user_a", "a circle").await;

    let first = h.store.delete_video("user_a", job_id).await;
    assert!(first.is_ok());
    let second = h.store.delete_video("user_a", job_id).await;
    assert!(matches!(second, Err(StoreError::NotFound)));
}

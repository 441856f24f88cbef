//! Metadata store adapter: videos and per-attempt generation logs, with
//! row-level isolation enforced by unconditional user predicates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use tracing::error;
use uuid::Uuid;

use crate::shared::models::{schema, Video, VideoStatus};
use crate::shared::utils::DbPool;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    #[error("row owned by another user")]
    Forbidden,
    #[error("database failure: {0}")]
    Db(String),
}

impl From<diesel::result::Error> for StoreError {
    fn from(error: diesel::result::Error) -> Self {
        match error {
            diesel::result::Error::NotFound => Self::NotFound,
            other => Self::Db(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, AsChangeset)]
#[diesel(table_name = schema::videos)]
pub struct VideoPatch {
    pub object_key: Option<String>,
    pub result_url: Option<String>,
    pub file_size: Option<i64>,
    pub duration_s: Option<f64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub status: Option<String>,
    pub generation_time_s: Option<f64>,
}

impl VideoPatch {
    pub fn status(status: VideoStatus) -> Self {
        Self {
            status: Some(status.as_str().to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VideoFilters {
    pub status: Option<String>,
    pub tag: Option<String>,
    pub limit: Option<i64>,
}

/// One append-only generation log row.
#[derive(Debug, Clone)]
pub struct AttemptLog {
    pub attempt_no: i32,
    pub backend: String,
    pub phase: String,
    pub outcome: String,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub generated_source: Option<String>,
    pub spec_hash: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl AttemptLog {
    pub fn new(attempt_no: i32, backend: &str, phase: &str, outcome: &str) -> Self {
        let now = Utc::now();
        Self {
            attempt_no,
            backend: backend.to_string(),
            phase: phase.to_string(),
            outcome: outcome.to_string(),
            error_kind: None,
            error_message: None,
            generated_source: None,
            spec_hash: None,
            started_at: now,
            ended_at: now,
        }
    }

    pub fn with_error(mut self, kind: &str, message: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(message.to_string());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.generated_source = Some(source.to_string());
        self
    }

    pub fn with_spec_hash(mut self, hash: &str) -> Self {
        self.spec_hash = Some(hash.to_string());
        self
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn ensure_user(&self, user_id: &str) -> Result<(), StoreError>;
    /// Creates the video row in `processing` state. The caller supplies
    /// the id (the job id), which keeps status recoverable from the table
    /// alone.
    async fn create_video(
        &self,
        user_id: &str,
        video_id: Uuid,
        prompt: &str,
    ) -> Result<(), StoreError>;
    async fn update_video(
        &self,
        user_id: &str,
        video_id: Uuid,
        patch: VideoPatch,
    ) -> Result<(), StoreError>;
    async fn log_attempt(&self, video_id: Uuid, attempt: AttemptLog) -> Result<(), StoreError>;
    async fn get_video(&self, user_id: &str, video_id: Uuid) -> Result<Video, StoreError>;
    async fn list_videos(
        &self,
        user_id: &str,
        filters: VideoFilters,
    ) -> Result<Vec<Video>, StoreError>;
    /// Marks the row deleted and returns its prior state so the caller can
    /// release the stored object.
    async fn delete_video(&self, user_id: &str, video_id: Uuid) -> Result<Video, StoreError>;
}

pub struct DieselStore {
    pool: DbPool,
}

impl DieselStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<crate::shared::utils::DbConn, StoreError> {
        self.pool.get().map_err(|e| StoreError::Db(e.to_string()))
    }
}

#[async_trait]
impl MetadataStore for DieselStore {
    async fn ensure_user(&self, user_id: &str) -> Result<(), StoreError> {
        use schema::users::dsl::*;
        let mut conn = self.conn()?;
        diesel::insert_into(users)
            .values((id.eq(user_id), created_at.eq(Utc::now())))
            .on_conflict(id)
            .do_nothing()
            .execute(&mut conn)?;
        Ok(())
    }

    async fn create_video(
        &self,
        owner: &str,
        video_id: Uuid,
        prompt_text: &str,
    ) -> Result<(), StoreError> {
        use schema::videos::dsl::*;
        let mut conn = self.conn()?;
        let now = Utc::now();
        diesel::insert_into(videos)
            .values((
                id.eq(video_id),
                user_id.eq(owner),
                prompt.eq(prompt_text),
                status.eq(VideoStatus::Processing.as_str()),
                tags.eq(Vec::<String>::new()),
                created_at.eq(now),
                updated_at.eq(now),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    async fn update_video(
        &self,
        owner: &str,
        video_id: Uuid,
        patch: VideoPatch,
    ) -> Result<(), StoreError> {
        use schema::videos::dsl::*;
        let mut conn = self.conn()?;
        let changed = diesel::update(videos.filter(id.eq(video_id)).filter(user_id.eq(owner)))
            .set((&patch, updated_at.eq(Utc::now())))
            .execute(&mut conn)?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn log_attempt(&self, video: Uuid, attempt: AttemptLog) -> Result<(), StoreError> {
        use schema::generation_logs::dsl::*;
        let mut conn = self.conn()?;
        diesel::insert_into(generation_logs)
            .values((
                id.eq(Uuid::new_v4()),
                video_id.eq(video),
                attempt_no.eq(attempt.attempt_no),
                backend.eq(attempt.backend),
                phase.eq(attempt.phase),
                outcome.eq(attempt.outcome),
                error_kind.eq(attempt.error_kind),
                error_message.eq(attempt.error_message),
                generated_source.eq(attempt.generated_source),
                spec_hash.eq(attempt.spec_hash),
                started_at.eq(attempt.started_at),
                ended_at.eq(attempt.ended_at),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    async fn get_video(&self, owner: &str, video_id: Uuid) -> Result<Video, StoreError> {
        use schema::videos::dsl::*;
        let mut conn = self.conn()?;
        let row: Video = videos
            .filter(id.eq(video_id))
            .filter(user_id.eq(owner))
            .first(&mut conn)?;
        if row.status == VideoStatus::Deleted.as_str() {
            return Err(StoreError::NotFound);
        }
        Ok(row)
    }

    async fn list_videos(
        &self,
        owner: &str,
        filters: VideoFilters,
    ) -> Result<Vec<Video>, StoreError> {
        use schema::videos::dsl::*;
        let mut conn = self.conn()?;
        let mut query = videos
            .filter(user_id.eq(owner))
            .filter(status.ne(VideoStatus::Deleted.as_str()))
            .order(created_at.desc())
            .into_boxed();
        if let Some(wanted) = filters.status {
            query = query.filter(status.eq(wanted));
        }
        if let Some(tag) = filters.tag {
            query = query.filter(tags.contains(vec![tag]));
        }
        query = query.limit(filters.limit.unwrap_or(100).clamp(1, 500));
        Ok(query.load(&mut conn)?)
    }

    async fn delete_video(&self, owner: &str, video_id: Uuid) -> Result<Video, StoreError> {
        use schema::videos::dsl::*;
        let mut conn = self.conn()?;
        let row: Video = videos
            .filter(id.eq(video_id))
            .filter(user_id.eq(owner))
            .first(&mut conn)?;
        if row.status == VideoStatus::Deleted.as_str() {
            return Err(StoreError::NotFound);
        }
        diesel::update(videos.filter(id.eq(video_id)).filter(user_id.eq(owner)))
            .set((
                status.eq(VideoStatus::Deleted.as_str()),
                result_url.eq(None::<String>),
                updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)?;
        Ok(row)
    }
}

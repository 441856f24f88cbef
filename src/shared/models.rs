use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Processing,
    Completed,
    Failed,
    Deleted,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = videos)]
pub struct Video {
    pub id: Uuid,
    pub user_id: String,
    pub prompt: String,
    pub object_key: Option<String>,
    pub result_url: Option<String>,
    pub file_size: Option<i64>,
    pub duration_s: Option<f64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub status: String,
    pub tags: Vec<String>,
    pub generation_time_s: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable)]
#[diesel(table_name = generation_logs)]
pub struct GenerationLog {
    pub id: Uuid,
    pub video_id: Uuid,
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

pub mod schema {
    diesel::table! {
        users (id) {
            id -> Text,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        videos (id) {
            id -> Uuid,
            user_id -> Text,
            prompt -> Text,
            object_key -> Nullable<Text>,
            result_url -> Nullable<Text>,
            file_size -> Nullable<Int8>,
            duration_s -> Nullable<Float8>,
            width -> Nullable<Int4>,
            height -> Nullable<Int4>,
            status -> Text,
            tags -> Array<Text>,
            generation_time_s -> Nullable<Float8>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        generation_logs (id) {
            id -> Uuid,
            video_id -> Uuid,
            attempt_no -> Int4,
            backend -> Text,
            phase -> Text,
            outcome -> Text,
            error_kind -> Nullable<Text>,
            error_message -> Nullable<Text>,
            generated_source -> Nullable<Text>,
            spec_hash -> Nullable<Text>,
            started_at -> Timestamptz,
            ended_at -> Timestamptz,
        }
    }

    diesel::joinable!(generation_logs -> videos (video_id));
    diesel::allow_tables_to_appear_in_same_query!(users, videos, generation_logs);
}

pub use schema::*;

use anyhow::Context;
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;

use crate::render::RendererConfig;
use crate::sandbox::SandboxConfig;
use crate::storage::StorageConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub local_url: String,
    pub local_model: String,
    pub attempt_budget: u32,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub job_deadline_s: u64,
    pub worker_concurrency: usize,
    pub queue_max: usize,
}

#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
    pub renderer: RendererConfig,
    pub pipeline: PipelineConfig,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        dotenv().ok();

        Ok(Self {
            server: ServerConfig {
                host: env_or("HOST", "0.0.0.0"),
                port: env_parse("PORT", 8080),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").context("DATABASE_URL not set")?,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
            },
            storage: StorageConfig {
                endpoint: env::var("STORAGE_ENDPOINT").context("STORAGE_ENDPOINT not set")?,
                access_key: env::var("STORAGE_ACCESS_KEY").context("STORAGE_ACCESS_KEY not set")?,
                secret_key: env::var("STORAGE_SECRET_KEY").context("STORAGE_SECRET_KEY not set")?,
                bucket: env_or("STORAGE_BUCKET", "animserver-media"),
                prefix: env_or("STORAGE_PREFIX", ""),
            },
            llm: LlmConfig {
                gemini_api_key: env::var("GEMINI_API_KEY").context("GEMINI_API_KEY not set")?,
                gemini_model: env_or("GEMINI_MODEL", "gemini-2.5-flash"),
                local_url: env_or("LOCAL_LLM_URL", "http://localhost:8081"),
                local_model: env_or("LOCAL_LLM_MODEL", "llama-3.1-8b-instruct"),
                attempt_budget: env_parse("LLM_ATTEMPT_BUDGET", 3),
            },
            sandbox: SandboxConfig {
                base_dir: PathBuf::from(env_or(
                    "SANDBOX_BASE_DIR",
                    &std::env::temp_dir().join("animserver").to_string_lossy(),
                )),
                memory_mib: env_parse("SANDBOX_MEMORY_MIB", 1024),
                wall_timeout_s: env_parse("SANDBOX_WALL_TIMEOUT_S", 120),
                cpu_timeout_s: env_parse("SANDBOX_CPU_TIMEOUT_S", 90),
                disable_limits: env_parse("SANDBOX_DISABLE_LIMITS", false),
            },
            renderer: RendererConfig {
                bin: env_or("RENDERER_BIN", "manim"),
                ..Default::default()
            },
            pipeline: PipelineConfig {
                job_deadline_s: env_parse("JOB_DEADLINE_S", 300),
                worker_concurrency: env_parse("WORKER_CONCURRENCY", 4),
                queue_max: env_parse("QUEUE_MAX", 16),
            },
        })
    }
}

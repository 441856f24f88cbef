//! Renderer adapter: runs the external animation tool as a subprocess
//! inside the sandbox, enforces the wall-clock deadline, and discovers the
//! produced artifact.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::sandbox::Sandbox;
use crate::synth::SCENE_CLASS;

pub const STDERR_TAIL_BYTES: usize = 4 * 1024;
const KILL_GRACE: Duration = Duration::from_secs(3);
const MIN_ARTIFACT_BYTES: u64 = 1024;

#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub bin: String,
    pub width: u32,
    pub height: u32,
    pub quality: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            bin: "manim".to_string(),
            width: 1280,
            height: 720,
            quality: "medium".to_string(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RenderError {
    #[error("render timed out")]
    Timeout,
    #[error("renderer exited with status {code}")]
    NonzeroExit { code: i32, stderr_tail: String },
    #[error("renderer produced no output artifact")]
    NoOutputArtifact,
    #[error("failed to launch renderer: {0}")]
    Spawn(String),
}

#[derive(Debug)]
pub struct RenderOutcome {
    pub artifact: PathBuf,
    pub stderr_tail: String,
}

/// Handle to the in-flight renderer's process group. The job owner holds
/// one so the group can be signaled when the job deadline or a
/// cancellation fires outside the render's own wall clock; `setsid` in
/// the sandbox pre-exec makes the child's pid the group id.
#[derive(Clone, Default)]
pub struct RenderGroup {
    pgid: Arc<AtomicI32>,
}

impl RenderGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn arm(&self, pgid: i32) {
        self.pgid.store(pgid, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.pgid.store(0, Ordering::SeqCst);
    }

    /// Graceful group termination: SIGTERM, a grace window, then SIGKILL
    /// for whatever remains. A no-op when no render is in flight.
    pub async fn terminate(&self) {
        let pgid = self.pgid.swap(0, Ordering::SeqCst);
        if pgid == 0 {
            return;
        }
        unsafe {
            libc::killpg(pgid, libc::SIGTERM);
        }
        let polls = KILL_GRACE.as_millis() as u64 / 100;
        for _ in 0..polls {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if unsafe { libc::killpg(pgid, 0) } != 0 {
                // No members left in the group.
                return;
            }
        }
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
}

static ANSI_ESCAPES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("ansi pattern"));

pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPES.replace_all(text, "").into_owned()
}

/// Last `STDERR_TAIL_BYTES` of the cleaned stream, for diagnosis and
/// repair feedback.
pub fn stderr_tail(stderr: &str) -> String {
    let cleaned = strip_ansi(stderr);
    if cleaned.len() <= STDERR_TAIL_BYTES {
        return cleaned;
    }
    let mut start = cleaned.len() - STDERR_TAIL_BYTES;
    while start < cleaned.len() && !cleaned.is_char_boundary(start) {
        start += 1;
    }
    cleaned[start..].to_string()
}

/// Render the given scene source inside the sandbox and return the newest
/// artifact under the tool's output subtree. The subprocess group is
/// registered with `group` for the duration of the run so the caller can
/// signal it if the job is torn down mid-render.
pub async fn render_scene(
    config: &RendererConfig,
    sandbox: &Sandbox,
    source: &str,
    group: &RenderGroup,
) -> Result<RenderOutcome, RenderError> {
    let source_file = sandbox.dir().join("scene.py");
    tokio::fs::write(&source_file, source)
        .await
        .map_err(|e| RenderError::Spawn(e.to_string()))?;
    let output_dir = sandbox.dir().join("media");

    let mut command = Command::new(&config.bin);
    command
        .arg(&source_file)
        .arg(SCENE_CLASS)
        .arg("-o")
        .arg(&output_dir)
        .arg("--format")
        .arg("mp4")
        .arg("--resolution")
        .arg(format!("{},{}", config.width, config.height))
        .arg("--quality")
        .arg(&config.quality)
        .arg("--disable_caching")
        .current_dir(sandbox.dir())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    sandbox.apply_to_command(&mut command);

    let mut child = command
        .spawn()
        .map_err(|e| RenderError::Spawn(e.to_string()))?;
    let pid = child.id();
    if let Some(pid) = pid {
        group.arm(pid as i32);
    }

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let wall = Duration::from_secs(sandbox.wall_timeout_s());
    let status = match tokio::time::timeout(wall, child.wait()).await {
        Ok(waited) => {
            group.clear();
            waited.map_err(|e| RenderError::Spawn(e.to_string()))?
        }
        Err(_) => {
            warn!("renderer exceeded {}s wall clock, signaling group", wall.as_secs());
            terminate_group(pid, &mut child).await;
            group.clear();
            return Err(RenderError::Timeout);
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();
    if !stdout.trim().is_empty() {
        info!("renderer stdout: {}", stdout.trim());
    }

    if !status.success() {
        return Err(RenderError::NonzeroExit {
            code: status.code().unwrap_or(-1),
            stderr_tail: stderr_tail(&stderr),
        });
    }

    let artifact =
        find_newest_artifact(&output_dir.join("videos")).ok_or(RenderError::NoOutputArtifact)?;
    Ok(RenderOutcome {
        artifact,
        stderr_tail: stderr_tail(&stderr),
    })
}

/// SIGTERM the subprocess group, then SIGKILL after a grace window.
async fn terminate_group(pid: Option<u32>, child: &mut tokio::process::Child) {
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Newest plausible mp4 under the output subtree.
pub fn find_newest_artifact(root: &Path) -> Option<PathBuf> {
    let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            if path.extension().map(|e| e == "mp4") != Some(true) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if meta.len() < MIN_ARTIFACT_BYTES {
                continue;
            }
            let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            if best.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
                best = Some((modified, path));
            }
        }
    }
    best.map(|(_, path)| path)
}

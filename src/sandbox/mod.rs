//! Per-job working directory and OS-level caps for the rendering
//! subprocess. The directory is released on every exit path; caps degrade
//! to warnings when the host refuses them.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub base_dir: PathBuf,
    pub memory_mib: u64,
    pub wall_timeout_s: u64,
    pub cpu_timeout_s: u64,
    pub disable_limits: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("animserver"),
            memory_mib: 1024,
            wall_timeout_s: 120,
            cpu_timeout_s: 90,
            disable_limits: false,
        }
    }
}

/// Caps that survived the host check and will be applied to the child.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolvedLimits {
    pub address_space_bytes: Option<u64>,
    pub cpu_seconds: Option<u64>,
}

pub struct Sandbox {
    dir: PathBuf,
    limits: ResolvedLimits,
    wall_timeout_s: u64,
}

impl Sandbox {
    /// Create the job directory and resolve which caps the host will
    /// accept.
    pub fn create(config: &SandboxConfig, job_id: Uuid) -> std::io::Result<Self> {
        let dir = config.base_dir.join(format!("job-{}", job_id));
        std::fs::create_dir_all(&dir)?;
        let limits = if config.disable_limits {
            debug!(job_id = %job_id, "resource limits disabled by configuration");
            ResolvedLimits::default()
        } else {
            resolve_limits(config)
        };
        Ok(Self {
            dir,
            limits,
            wall_timeout_s: config.wall_timeout_s,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn limits(&self) -> ResolvedLimits {
        self.limits
    }

    pub fn wall_timeout_s(&self) -> u64 {
        self.wall_timeout_s
    }

    /// Put the child in its own process group and apply the resolved
    /// rlimits pre-exec. Failures inside the child are tolerated; the
    /// render proceeds uncapped rather than failing the job.
    pub fn apply_to_command(&self, command: &mut tokio::process::Command) {
        let limits = self.limits;
        unsafe {
            command.pre_exec(move || {
                libc::setsid();
                if let Some(bytes) = limits.address_space_bytes {
                    let rlim = libc::rlimit {
                        rlim_cur: bytes as libc::rlim_t,
                        rlim_max: bytes as libc::rlim_t,
                    };
                    libc::setrlimit(libc::RLIMIT_AS, &rlim);
                }
                if let Some(seconds) = limits.cpu_seconds {
                    let rlim = libc::rlimit {
                        rlim_cur: seconds as libc::rlim_t,
                        rlim_max: (seconds + 10) as libc::rlim_t,
                    };
                    libc::setrlimit(libc::RLIMIT_CPU, &rlim);
                }
                Ok(())
            });
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove sandbox dir {:?}: {}", self.dir, e);
            }
        }
    }
}

fn resolve_limits(config: &SandboxConfig) -> ResolvedLimits {
    let requested_bytes = config.memory_mib * 1024 * 1024;
    let address_space_bytes = match current_hard_limit(libc::RLIMIT_AS) {
        Some(hard) if (hard as u64) < requested_bytes => {
            warn!(
                "host refuses {} MiB address-space cap (hard limit {} bytes), proceeding uncapped",
                config.memory_mib, hard
            );
            None
        }
        _ => Some(requested_bytes),
    };
    let cpu_seconds = match current_hard_limit(libc::RLIMIT_CPU) {
        Some(hard) if (hard as u64) < config.cpu_timeout_s => {
            warn!(
                "host refuses {}s CPU cap (hard limit {}s), proceeding uncapped",
                config.cpu_timeout_s, hard
            );
            None
        }
        _ => Some(config.cpu_timeout_s),
    };
    ResolvedLimits {
        address_space_bytes,
        cpu_seconds,
    }
}

/// Hard limit for a resource, or None when unlimited / unreadable.
fn current_hard_limit(resource: libc::__rlimit_resource_t) -> Option<libc::rlim_t> {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(resource, &mut rlim) };
    if rc != 0 || rlim.rlim_max == libc::RLIM_INFINITY {
        None
    } else {
        Some(rlim.rlim_max)
    }
}

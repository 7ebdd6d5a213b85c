use std::path::PathBuf;

/// Environment variables read by steward.
#[derive(Debug, Clone, Copy)]
pub enum EnvVar {
    StewardDir,
    StewardSocket,
    StewardPlan,
    StewardLog,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::StewardDir => "STEWARD_DIR",
            EnvVar::StewardSocket => "STEWARD_SOCKET",
            EnvVar::StewardPlan => "STEWARD_PLAN",
            EnvVar::StewardLog => "STEWARD_LOG",
        }
    }
}

const FALLBACK_DATA_DIR: &str = "~/.local/share";
const STEWARD_SUBDIR: &str = "steward";
const SOCKET_FILE: &str = "steward.sock";
const PLAN_FILE: &str = "plan.toml";
const DEFAULT_LOG_FILTER: &str = "info";

fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str()).ok().filter(|v| !v.is_empty())
}

/// State directory ($STEWARD_DIR or ~/.local/share/steward)
pub fn state_dir() -> PathBuf {
    let dir = env_opt(EnvVar::StewardDir)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
                .join(STEWARD_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved state directory");
    dir
}

/// Control socket path ($STEWARD_SOCKET or <state dir>/steward.sock)
pub fn socket_path() -> PathBuf {
    env_opt(EnvVar::StewardSocket)
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir().join(SOCKET_FILE))
}

/// Plan file ($STEWARD_PLAN or <state dir>/plan.toml)
pub fn plan_path() -> PathBuf {
    env_opt(EnvVar::StewardPlan)
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir().join(PLAN_FILE))
}

/// Log filter directives ($STEWARD_LOG, default "info")
pub fn log_filter() -> String {
    env_opt(EnvVar::StewardLog).unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

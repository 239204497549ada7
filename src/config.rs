use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CONFIG_DIR_ENV: &str = "GIT_DAEMON_CONFIG_DIR";
const CONFIG_FILE: &str = "config.json";

/// Resolve the daemon's config directory: `GIT_DAEMON_CONFIG_DIR` override,
/// otherwise the OS config dir. Created with owner-only permissions.
pub fn config_dir() -> PathBuf {
    let dir = std::env::var(CONFIG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("git-workspace-daemon")
        });

    if !dir.exists() {
        fs::create_dir_all(&dir).ok();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).ok();
        }
    }

    dir
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    #[serde(default)]
    pub tls: TlsConfig,
    pub origin_allowlist: Vec<String>,
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub deps: DepsConfig,
    #[serde(default)]
    pub approvals: Vec<ApprovalEntry>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PairingConfig {
    pub token_ttl_days: i64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self { token_ttl_days: 30 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobsConfig {
    pub max_concurrent: usize,
    pub timeout_seconds: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            timeout_seconds: 3600,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DepsConfig {
    pub default_safer: bool,
}

impl Default for DepsConfig {
    fn default() -> Self {
        Self { default_safer: true }
    }
}

/// Capabilities that require an explicit per-origin approval.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    #[serde(rename = "open-terminal")]
    OpenTerminal,
    #[serde(rename = "open-vscode")]
    OpenVscode,
    #[serde(rename = "deps/install")]
    DepsInstall,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Capability::OpenTerminal => "open-terminal",
            Capability::OpenVscode => "open-vscode",
            Capability::DepsInstall => "deps/install",
        };
        f.write_str(name)
    }
}

/// A persisted approval. `repo_path = None` is the wildcard form covering
/// every path under the workspace root for that origin.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalEntry {
    pub origin: String,
    #[serde(default)]
    pub repo_path: Option<String>,
    pub capabilities: BTreeSet<Capability>,
    pub approved_at: DateTime<Utc>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 8417,
            tls: TlsConfig::default(),
            origin_allowlist: vec![
                "http://127.0.0.1:5173".to_string(),
                "http://localhost:5173".to_string(),
            ],
            workspace_root: None,
            pairing: PairingConfig::default(),
            jobs: JobsConfig::default(),
            deps: DepsConfig::default(),
            approvals: Vec::new(),
        }
    }
}

impl Config {
    /// Startup invariants. Violations are fatal; the process must exit
    /// non-zero rather than serve with a weakened gate.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !matches!(self.server_host.as_str(), "127.0.0.1" | "::1" | "localhost") {
            bail!(
                "serverHost must be a loopback literal, got {:?}",
                self.server_host
            );
        }
        if self.origin_allowlist.iter().all(|o| o.trim().is_empty()) {
            bail!("originAllowlist must not be empty");
        }
        if self.jobs.max_concurrent < 1 {
            bail!("jobs.maxConcurrent must be at least 1");
        }
        if self.jobs.timeout_seconds == 0 {
            bail!("jobs.timeoutSeconds must be greater than zero");
        }
        if self.tls.enabled && (self.tls.cert_path.is_none() || self.tls.key_path.is_none()) {
            bail!("tls.enabled requires tls.certPath and tls.keyPath");
        }
        Ok(())
    }
}

/// The single in-memory config value, written back through serialized
/// update paths whenever approvals change.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<Config>,
}

impl ConfigStore {
    /// Load `config.json` from `dir`, initialising defaults when absent.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(CONFIG_FILE);
        let config = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        Ok(Self {
            path,
            inner: RwLock::new(config),
        })
    }

    pub fn get(&self) -> Config {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Mutate the config and persist the result before returning.
    pub fn update<F>(&self, f: F) -> anyhow::Result<Config>
    where
        F: FnOnce(&mut Config),
    {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
        write_json_atomic(&self.path, &*guard)?;
        Ok(guard.clone())
    }

}

/// Serialize to a sibling temp file and rename over the target so readers
/// never observe a partial document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("serializing JSON document")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &bytes).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

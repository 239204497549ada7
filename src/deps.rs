use std::path::Path;

use serde::Deserialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Pnpm,
    Yarn,
}

impl PackageManager {
    pub fn program(self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ManagerChoice {
    #[default]
    Auto,
    Npm,
    Pnpm,
    Yarn,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstallMode {
    #[default]
    Auto,
    Ci,
    Install,
}

/// What the target repository tells us about its package manager.
#[derive(Clone, Debug, Default)]
pub struct RepoProbe {
    pub package_manager_field: Option<String>,
    pub has_pnpm_lock: bool,
    pub has_yarn_lock: bool,
    pub has_npm_lock: bool,
    pub has_yarnrc_yml: bool,
}

/// Inspect `dir` (which must contain `package.json`; callers verify that)
/// for the signals the selection contract keys on.
pub async fn probe_repo(dir: &Path) -> anyhow::Result<RepoProbe> {
    let manifest = tokio::fs::read(dir.join("package.json")).await?;
    let manifest: serde_json::Value = serde_json::from_slice(&manifest)?;
    let package_manager_field = manifest
        .get("packageManager")
        .and_then(|v| v.as_str())
        .map(|s| s.split('@').next().unwrap_or(s).to_string());

    Ok(RepoProbe {
        package_manager_field,
        has_pnpm_lock: path_exists(dir.join("pnpm-lock.yaml")).await,
        has_yarn_lock: path_exists(dir.join("yarn.lock")).await,
        has_npm_lock: path_exists(dir.join("package-lock.json")).await,
        has_yarnrc_yml: path_exists(dir.join(".yarnrc.yml")).await,
    })
}

async fn path_exists(path: std::path::PathBuf) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

/// Selection contract: explicit choice wins; `auto` prefers the
/// `packageManager` field when that tool is installed, then the lockfiles
/// in pnpm → yarn → npm order, then npm.
pub fn select_manager(
    choice: ManagerChoice,
    probe: &RepoProbe,
    tool_installed: impl Fn(PackageManager) -> bool,
) -> PackageManager {
    match choice {
        ManagerChoice::Npm => return PackageManager::Npm,
        ManagerChoice::Pnpm => return PackageManager::Pnpm,
        ManagerChoice::Yarn => return PackageManager::Yarn,
        ManagerChoice::Auto => {}
    }

    if let Some(field) = probe.package_manager_field.as_deref() {
        let manager = match field {
            "npm" => Some(PackageManager::Npm),
            "pnpm" => Some(PackageManager::Pnpm),
            "yarn" => Some(PackageManager::Yarn),
            _ => None,
        };
        if let Some(manager) = manager {
            if tool_installed(manager) {
                return manager;
            }
        }
    }

    if probe.has_pnpm_lock {
        PackageManager::Pnpm
    } else if probe.has_yarn_lock {
        PackageManager::Yarn
    } else {
        PackageManager::Npm
    }
}

/// Build the install invocation per the per-manager rules.
pub fn build_install_args(
    manager: PackageManager,
    mode: InstallMode,
    safer: bool,
    probe: &RepoProbe,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    match manager {
        PackageManager::Npm => {
            if probe.has_npm_lock && mode != InstallMode::Install {
                args.push("ci".to_string());
            } else {
                args.push("install".to_string());
            }
            if safer {
                args.push("--ignore-scripts".to_string());
            }
        }
        PackageManager::Pnpm => {
            args.push("install".to_string());
            let frozen = mode == InstallMode::Ci
                || (mode == InstallMode::Auto && probe.has_pnpm_lock);
            if frozen {
                args.push("--frozen-lockfile".to_string());
            }
            if safer {
                args.push("--ignore-scripts".to_string());
            }
        }
        PackageManager::Yarn => {
            args.push("install".to_string());
            let immutable = mode == InstallMode::Ci
                || (mode == InstallMode::Auto && probe.has_yarn_lock)
                || probe.has_yarnrc_yml;
            if immutable {
                args.push("--immutable".to_string());
            }
            if safer {
                args.push("--ignore-scripts".to_string());
            }
        }
    }
    args
}

/// PATH lookup used for manager selection and the meta capability report.
pub fn tool_on_path(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        if dir.as_os_str().is_empty() {
            return false;
        }
        let candidate = dir.join(name);
        if candidate.is_file() {
            return true;
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{name}.exe"));
            if exe.is_file() {
                return true;
            }
        }
        false
    })
}

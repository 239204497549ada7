use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::process::Command;

use crate::{
    error::ApiError,
    sandbox::{SandboxError, resolve_inside_workspace},
};

/// Accepted remote forms: scp-like `git@host:path`, `https://host/path`,
/// `ssh://host/path`. Everything else, in particular `file://` and local
/// paths, is rejected before a child is ever spawned.
static REPO_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:https://[\w.-]+(?::\d+)?/\S+|ssh://[\w.-]+(?::\d+)?/\S+|[\w.-]+@[\w.-]+:[^/\s]\S*)$",
    )
    .expect("static repo URL pattern compiles")
});

pub fn validate_repo_url(url: &str) -> Result<(), ApiError> {
    if REPO_URL.is_match(url) {
        Ok(())
    } else {
        Err(ApiError::InvalidRepoUrl(url.to_string()))
    }
}

#[derive(Clone, Debug, Default)]
pub struct CloneOptions {
    pub branch: Option<String>,
    pub depth: Option<u32>,
}

pub fn clone_args(url: &str, dest: &Path, options: &CloneOptions) -> Vec<String> {
    let mut args = vec!["clone".to_string()];
    if let Some(branch) = &options.branch {
        args.push("--branch".to_string());
        args.push(branch.clone());
    }
    if let Some(depth) = options.depth {
        args.push("--depth".to_string());
        args.push(depth.to_string());
    }
    args.push(url.to_string());
    args.push(dest.to_string_lossy().into_owned());
    args
}

pub fn fetch_args(repo: &Path, remote: &str, prune: bool) -> Vec<String> {
    let mut args = vec![
        "-C".to_string(),
        repo.to_string_lossy().into_owned(),
        "fetch".to_string(),
        remote.to_string(),
    ];
    if prune {
        args.push("--prune".to_string());
    }
    args
}

/// Resolve a client-supplied repository path and require an existing git
/// working copy at it.
pub async fn resolve_repo_path(root: &Path, candidate: &str) -> Result<PathBuf, ApiError> {
    let resolved = resolve_inside_workspace(root, candidate, false)
        .await
        .map_err(|err| match err {
            SandboxError::Missing(_) => ApiError::RepoNotFound(candidate.to_string()),
            SandboxError::Outside => ApiError::PathOutsideWorkspace,
            SandboxError::TooLong => ApiError::validation(err),
            SandboxError::Io(err) => ApiError::internal(err),
        })?;

    let is_repo = tokio::fs::metadata(&resolved)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
        && tokio::fs::metadata(resolved.join(".git")).await.is_ok();
    if !is_repo {
        return Err(ApiError::RepoNotFound(candidate.to_string()));
    }

    Ok(resolved)
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitStatus {
    pub branch: Option<String>,
    pub ahead: u32,
    pub behind: u32,
    pub staged_count: u32,
    pub unstaged_count: u32,
    pub untracked_count: u32,
    pub conflicts_count: u32,
    pub clean: bool,
}

/// Run `git status --porcelain=2 -b` for `repo` and parse the result.
///
/// A first-time SSH host-key prompt inside a git child is invisible here;
/// the per-job timeout is the backstop for remotes that never answer.
pub async fn run_status(repo: &Path) -> anyhow::Result<GitStatus> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(["status", "--porcelain=2", "-b"])
        .output()
        .await
        .context("spawning git status")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git status failed: {}", stderr.trim());
    }

    Ok(parse_porcelain_status(&String::from_utf8_lossy(&output.stdout)))
}

/// Porcelain v2 line scan: branch headers, `?` untracked, `u` conflicts,
/// `1`/`2` changed entries whose XY letters mark index and worktree state.
pub fn parse_porcelain_status(text: &str) -> GitStatus {
    let mut status = GitStatus::default();

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("# branch.head ") {
            status.branch = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("# branch.ab ") {
            for field in rest.split_whitespace() {
                if let Some(ahead) = field.strip_prefix('+') {
                    status.ahead = ahead.parse().unwrap_or(0);
                } else if let Some(behind) = field.strip_prefix('-') {
                    status.behind = behind.parse().unwrap_or(0);
                }
            }
        } else if line.starts_with('?') {
            status.untracked_count += 1;
        } else if line.starts_with("u ") {
            status.conflicts_count += 1;
        } else if line.starts_with("1 ") || line.starts_with("2 ") {
            let mut xy = line.split_whitespace().nth(1).unwrap_or("").chars();
            if xy.next().is_some_and(|c| c != '.') {
                status.staged_count += 1;
            }
            if xy.next().is_some_and(|c| c != '.') {
                status.unstaged_count += 1;
            }
        }
    }

    status.clean = status.staged_count == 0
        && status.unstaged_count == 0
        && status.untracked_count == 0
        && status.conflicts_count == 0;
    status
}

use std::collections::BTreeSet;
use std::path::Path;

use chrono::Utc;
use tracing::{info, warn};

use crate::{
    config::{ApprovalEntry, Capability, Config},
    error::ApiError,
    state::AppState,
};

/// Pure predicate over the persisted approval records. A wildcard entry
/// (no repo path) covers every path under the workspace root for that
/// origin; otherwise the entry's path must match the argument exactly or,
/// when relative, resolve to it against the workspace root.
pub fn has_approval(
    config: &Config,
    origin: &str,
    repo_path: &Path,
    capability: Capability,
) -> bool {
    config.approvals.iter().any(|entry| {
        if entry.origin != origin || !entry.capabilities.contains(&capability) {
            return false;
        }
        match entry.repo_path.as_deref() {
            None => true,
            Some(entry_path) => {
                let entry_path = Path::new(entry_path);
                if entry_path == repo_path {
                    return true;
                }
                if entry_path.is_relative() {
                    if let Some(root) = config.workspace_root.as_deref() {
                        let joined = root.join(entry_path);
                        if joined == repo_path {
                            return true;
                        }
                        // `repo_path` arrives canonicalised; the joined
                        // entry has to be canonicalised too or it never
                        // matches under a symlinked workspace root.
                        if let Ok(canonical) = std::fs::canonicalize(&joined) {
                            return canonical == repo_path;
                        }
                    }
                }
                false
            }
        }
    })
}

/// Check the approval, prompting the local operator on a miss. A granted
/// prompt writes a wildcard entry back to config before proceeding; a
/// declined or unavailable prompt fails the request.
pub async fn ensure_approval(
    state: &AppState,
    origin: &str,
    repo_path: &Path,
    capability: Capability,
) -> Result<(), ApiError> {
    if has_approval(&state.config.get(), origin, repo_path, capability) {
        return Ok(());
    }

    let prompt_origin = origin.to_string();
    let granted =
        tokio::task::spawn_blocking(move || prompt_grant(&prompt_origin, capability))
            .await
            .map_err(ApiError::internal)?;

    if !granted {
        warn!(origin, %capability, "capability prompt declined or unavailable");
        return Err(ApiError::CapabilityNotGranted(capability.to_string()));
    }

    state
        .config
        .update(|config| grant_wildcard(config, origin, capability))
        .map_err(ApiError::internal)?;
    info!(origin, %capability, "capability granted by operator");
    Ok(())
}

/// Insert or extend the single wildcard entry for `origin`. Re-granting is
/// idempotent: capability sets union, one wildcard entry per origin.
pub fn grant_wildcard(config: &mut Config, origin: &str, capability: Capability) {
    let now = Utc::now();
    if let Some(entry) = config
        .approvals
        .iter_mut()
        .find(|entry| entry.origin == origin && entry.repo_path.is_none())
    {
        entry.capabilities.insert(capability);
        entry.approved_at = now;
        return;
    }

    config.approvals.push(ApprovalEntry {
        origin: origin.to_string(),
        repo_path: None,
        capabilities: BTreeSet::from([capability]),
        approved_at: now,
    });
}

/// Ask y/N on the controlling terminal. When stdio is not a TTY, talk to
/// the terminal device directly; with no terminal at all the answer is no.
fn prompt_grant(origin: &str, capability: Capability) -> bool {
    use std::io::IsTerminal;

    let question = format!(
        "Allow {origin} to use {capability} for any repository under the workspace root? [y/N] "
    );

    if std::io::stdin().is_terminal() {
        return ask_on_stdio(&question).unwrap_or(false);
    }
    ask_on_tty_device(&question).unwrap_or(false)
}

fn ask_on_stdio(question: &str) -> std::io::Result<bool> {
    use std::io::{BufRead, Write};

    let mut stderr = std::io::stderr();
    stderr.write_all(question.as_bytes())?;
    stderr.flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(is_affirmative(&answer))
}

#[cfg(unix)]
fn ask_on_tty_device(question: &str) -> std::io::Result<bool> {
    use std::io::{BufRead, BufReader, Write};

    let mut tty = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/tty")?;
    tty.write_all(question.as_bytes())?;
    tty.flush()?;

    let mut answer = String::new();
    BufReader::new(tty).read_line(&mut answer)?;
    Ok(is_affirmative(&answer))
}

#[cfg(not(unix))]
fn ask_on_tty_device(_question: &str) -> std::io::Result<bool> {
    Ok(false)
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim(), "y" | "Y" | "yes" | "Yes" | "YES")
}

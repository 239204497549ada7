use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tokio::fs;

/// Upper bound on any client-supplied path field.
pub const MAX_PATH_LEN: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("path exceeds {MAX_PATH_LEN} characters")]
    TooLong,
    #[error("path resolves outside the workspace root")]
    Outside,
    #[error("path does not exist: {0}")]
    Missing(PathBuf),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolve `candidate` against the workspace root and prove the result
/// stays inside it. Both the root and the candidate (or, when the
/// candidate does not exist yet, its nearest existing ancestor) are
/// canonicalised, so a symlinked path component pointing outside the root
/// is caught. With `allow_missing` the final path may be absent, which is
/// what `clone` needs for its destination.
pub async fn resolve_inside_workspace(
    root: &Path,
    candidate: &str,
    allow_missing: bool,
) -> Result<PathBuf, SandboxError> {
    if candidate.len() > MAX_PATH_LEN {
        return Err(SandboxError::TooLong);
    }

    let canonical_root = fs::canonicalize(root).await?;
    let joined = canonical_root.join(candidate);

    // Walk up to the nearest existing ancestor and canonicalise that, then
    // re-append the missing suffix.
    let mut existing = joined.clone();
    let mut suffix: Vec<OsString> = Vec::new();
    let canonical_base = loop {
        match fs::canonicalize(&existing).await {
            Ok(path) => break path,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let Some(name) = existing.file_name().map(OsString::from) else {
                    return Err(SandboxError::Outside);
                };
                suffix.push(name);
                let Some(parent) = existing.parent() else {
                    return Err(SandboxError::Outside);
                };
                existing = parent.to_path_buf();
            }
            Err(err) => return Err(SandboxError::Io(err)),
        }
    };

    // The missing suffix was never canonicalised; traversal components in
    // it cannot be trusted.
    if suffix
        .iter()
        .any(|name| matches!(name.to_str(), Some(".") | Some("..")))
    {
        return Err(SandboxError::Outside);
    }

    let mut resolved = canonical_base;
    for name in suffix.iter().rev() {
        resolved.push(name);
    }

    if resolved != canonical_root && !resolved.starts_with(&canonical_root) {
        return Err(SandboxError::Outside);
    }

    if !allow_missing && !suffix.is_empty() {
        return Err(SandboxError::Missing(resolved));
    }

    Ok(resolved)
}

/// Reject absolute candidates and anything that, after lexical
/// normalisation, is empty or escapes upward.
pub fn ensure_relative(candidate: &str) -> Result<(), SandboxError> {
    let path = Path::new(candidate);
    if path.is_absolute() || candidate.len() > MAX_PATH_LEN {
        return Err(SandboxError::Outside);
    }

    let mut depth: i64 = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(SandboxError::Outside);
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return Err(SandboxError::Outside),
        }
    }

    if depth == 0 {
        // Normalises to `.`.
        return Err(SandboxError::Outside);
    }

    Ok(())
}

use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use serde::Deserialize;
use tokio::process::Command;
use tracing::info;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OpenTarget {
    Folder,
    Terminal,
    Vscode,
}

/// Platform command for opening `path` in the file browser, a terminal,
/// or the editor. The spawned program is detached; the daemon does not
/// wait for it.
pub fn open_command(target: OpenTarget, path: &Path) -> (&'static str, Vec<String>) {
    let path = path.to_string_lossy().into_owned();
    #[cfg(target_os = "macos")]
    {
        match target {
            OpenTarget::Folder => ("open", vec![path]),
            OpenTarget::Terminal => ("open", vec!["-a".to_string(), "Terminal".to_string(), path]),
            OpenTarget::Vscode => ("code", vec![path]),
        }
    }
    #[cfg(target_os = "windows")]
    {
        match target {
            OpenTarget::Folder => ("explorer", vec![path]),
            OpenTarget::Terminal => (
                "cmd",
                vec!["/C".to_string(), "start".to_string(), "cmd".to_string(), "/K".to_string(), format!("cd /d {path}")],
            ),
            OpenTarget::Vscode => ("code", vec![path]),
        }
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        match target {
            OpenTarget::Folder => ("xdg-open", vec![path]),
            OpenTarget::Terminal => (
                "x-terminal-emulator",
                vec![format!("--working-directory={path}")],
            ),
            OpenTarget::Vscode => ("code", vec![path]),
        }
    }
}

pub async fn open_path(target: OpenTarget, path: &Path) -> anyhow::Result<()> {
    let (program, args) = open_command(target, path);
    info!(program, path = %path.display(), "opening path");
    Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawning {program}"))?;
    Ok(())
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::{OpenTarget, open_command};
    use std::path::Path;

    #[test]
    fn linux_commands() {
        let path = Path::new("/ws/repo");
        assert_eq!(
            open_command(OpenTarget::Folder, path),
            ("xdg-open", vec!["/ws/repo".to_string()])
        );
        assert_eq!(
            open_command(OpenTarget::Terminal, path),
            (
                "x-terminal-emulator",
                vec!["--working-directory=/ws/repo".to_string()]
            )
        );
        assert_eq!(
            open_command(OpenTarget::Vscode, path),
            ("code", vec!["/ws/repo".to_string()])
        );
    }
}

// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! External process invocation.

use std::path::Path;
use tokio::process::Command;

/// Exit status and captured output of a finished process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run `program` with `args` to completion, capturing stdout and stderr.
pub async fn run_command<S: AsRef<str>>(program: &str, args: &[S]) -> std::io::Result<CommandOutput> {
    diagnostics::log_debug!(
        "Running {program} {args}",
        args: args.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(" "),
        program: program
    );
    let output = Command::new(program)
        .args(args.iter().map(AsRef::as_ref))
        .kill_on_drop(true)
        .output()
        .await?;
    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Whether `name` resolves to an executable, either as a path or via `PATH`.
#[must_use]
pub fn command_available(name: &str) -> bool {
    if name.contains('/') {
        return is_executable(Path::new(name));
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(name))))
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

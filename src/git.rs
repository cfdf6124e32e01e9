//! Thin wrappers around the `git` executable.
//!
//! Arguments are always passed as separate argv entries, never through a
//! shell, and user-supplied URLs and paths sit behind `--` (or on stdin) so
//! they cannot be read as options. Prompts are disabled so a private or
//! missing repository fails instead of blocking on credentials.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::ResourceError;

fn git_command(dir: Option<&Path>) -> Command {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd.env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

fn check(name: &str, operation: &'static str, output: Output) -> Result<String, ResourceError> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(ResourceError::Git {
            name: name.to_string(),
            operation,
            code: output.status.code(),
            stderr,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn run<I, S>(
    name: &str,
    operation: &'static str,
    dir: Option<&Path>,
    args: I,
) -> Result<String, ResourceError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = git_command(dir)
        .args(args)
        .output()
        .await
        .map_err(|source| ResourceError::Io {
            name: name.to_string(),
            operation: "spawn git",
            source,
        })?;
    check(name, operation, output)
}

/// Shallow-clone `branch` of `url` into `dest`, which must not exist yet.
///
/// With `sparse_paths`, the clone starts sparse and blob-less so only the
/// top-level files and the listed directories are ever fetched.
pub async fn clone(
    name: &str,
    url: &str,
    branch: &str,
    sparse_paths: &[String],
    dest: &Path,
) -> Result<(), ResourceError> {
    let mut args: Vec<&OsStr> = vec![
        OsStr::new("clone"),
        OsStr::new("--quiet"),
        OsStr::new("--depth"),
        OsStr::new("1"),
        OsStr::new("--single-branch"),
        OsStr::new("--branch"),
        OsStr::new(branch),
    ];
    if !sparse_paths.is_empty() {
        args.extend([
            OsStr::new("--filter=blob:none"),
            OsStr::new("--sparse"),
        ]);
    }
    args.extend([OsStr::new("--"), OsStr::new(url), dest.as_os_str()]);

    run(name, "clone", None, args).await?;

    if !sparse_paths.is_empty() {
        sparse_checkout_set(name, dest, sparse_paths).await?;
    }
    Ok(())
}

/// Replace the sparse-checkout patterns with `paths`, passed on stdin.
pub async fn sparse_checkout_set(
    name: &str,
    repo_dir: &Path,
    paths: &[String],
) -> Result<(), ResourceError> {
    let io_err = |source: std::io::Error| ResourceError::Io {
        name: name.to_string(),
        operation: "spawn git",
        source,
    };

    let mut child = git_command(Some(repo_dir))
        .args(["sparse-checkout", "set", "--cone", "--stdin"])
        .stdin(Stdio::piped())
        .spawn()
        .map_err(io_err)?;

    if let Some(mut stdin) = child.stdin.take() {
        let mut input = paths.join("\n");
        input.push('\n');
        stdin.write_all(input.as_bytes()).await.map_err(io_err)?;
    }

    let output = child.wait_with_output().await.map_err(io_err)?;
    check(name, "sparse-checkout", output).map(|_| ())
}

/// Turn sparse checkout off if a previous configuration enabled it.
pub async fn sparse_checkout_disable(name: &str, repo_dir: &Path) -> Result<(), ResourceError> {
    if !repo_dir.join(".git").join("info").join("sparse-checkout").exists() {
        return Ok(());
    }
    run(name, "sparse-checkout", Some(repo_dir), ["sparse-checkout", "disable"])
        .await
        .map(|_| ())
}

/// Fetch the tip of `branch` and force the working copy onto it.
pub async fn refresh(name: &str, repo_dir: &Path, branch: &str) -> Result<(), ResourceError> {
    let refspec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", branch);
    let remote_ref = format!("refs/remotes/origin/{}", branch);

    run(
        name,
        "fetch",
        Some(repo_dir),
        ["fetch", "--quiet", "--depth", "1", "--", "origin", refspec.as_str()],
    )
    .await?;
    run(
        name,
        "checkout",
        Some(repo_dir),
        ["checkout", "--quiet", "--force", "-B", branch, remote_ref.as_str()],
    )
    .await?;
    run(name, "reset", Some(repo_dir), ["reset", "--quiet", "--hard", remote_ref.as_str()]).await?;
    run(name, "clean", Some(repo_dir), ["clean", "-fdq"]).await?;
    Ok(())
}

/// URL the working copy fetches from.
pub async fn remote_url(name: &str, repo_dir: &Path) -> Result<String, ResourceError> {
    run(name, "remote", Some(repo_dir), ["remote", "get-url", "origin"]).await
}

pub async fn head_sha(name: &str, repo_dir: &Path) -> Result<String, ResourceError> {
    run(name, "rev-parse", Some(repo_dir), ["rev-parse", "HEAD"]).await
}

/// Returns `true` if the directory contains a `.git` entry.
pub fn is_git_repo(dir: &Path) -> bool {
    dir.join(".git").exists()
}

/// Whether a `git` executable can be run at all.
pub async fn is_available() -> bool {
    git_command(None)
        .arg("--version")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

//! Asynchronous git CLI backend.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::backend::{MergeOutcome, VcsBackend};
use super::parser::{parse_log, parse_name_list, Commit, LOG_FORMAT};
use crate::config::GitConfig;
use crate::errors::GitError;

/// [`VcsBackend`] that runs the git executable in one directory.
#[derive(Debug, Clone)]
pub struct GitCli {
    dir: PathBuf,
    binary: String,
    remote: String,
    network_timeout: Duration,
    command_timeout: Duration,
}

impl GitCli {
    /// Create a backend for `dir` using the binary, remote name and time
    /// bounds from `config`.
    pub fn new(dir: impl Into<PathBuf>, config: &GitConfig) -> Self {
        let client = Self {
            dir: dir.into(),
            binary: config.binary.clone(),
            remote: config.remote.clone(),
            network_timeout: config.network_timeout(),
            command_timeout: config.command_timeout(),
        };
        debug!(dir = %client.dir.display(), binary = %client.binary, "created GitCli");
        client
    }

    async fn output_in(
        &self,
        cwd: &Path,
        args: &[&str],
        limit: Duration,
        operation: &str,
    ) -> Result<Output, GitError> {
        if !cwd.is_dir() {
            return Err(GitError::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("directory '{}' does not exist", cwd.display()),
            )));
        }

        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(cwd)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_MERGE_AUTOEDIT", "no")
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(cmd = ?format!("git {}", args.join(" ")), dir = %cwd.display(), "running git command");
        match timeout(limit, cmd.output()).await {
            Err(_) => {
                warn!(operation, secs = limit.as_secs(), "git command timed out");
                Err(GitError::Timeout {
                    operation: operation.to_string(),
                    secs: limit.as_secs(),
                })
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GitError::BinaryNotFound(self.binary.clone()))
            }
            Ok(Err(e)) => Err(GitError::IoError(e)),
            Ok(Ok(output)) => Ok(output),
        }
    }

    /// Run a local command in the backend directory and return its stdout.
    async fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let operation = args.first().copied().unwrap_or("git");
        let output = self
            .output_in(&self.dir, args, self.command_timeout, operation)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(exit_code, %stderr, "git command failed");
            return Err(GitError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                exit_code,
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run a command that talks to the remote, under the network time bound.
    async fn run_remote(&self, cwd: &Path, operation: &str, args: &[&str]) -> Result<String, GitError> {
        let output = self
            .output_in(cwd, args, self.network_timeout, operation)
            .await?;
        if !output.status.success() {
            let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(operation, %detail, "remote operation failed");
            return Err(GitError::RemoteSyncFailure {
                operation: operation.to_string(),
                detail,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run a query whose exit status is the answer: 0 is `true`, 1 is `false`.
    async fn probe(&self, args: &[&str]) -> Result<bool, GitError> {
        let operation = args.first().copied().unwrap_or("git");
        let output = self
            .output_in(&self.dir, args, self.command_timeout, operation)
            .await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            code => Err(GitError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                exit_code: code.unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    async fn local_branch_exists(&self, name: &str) -> Result<bool, GitError> {
        let refname = format!("refs/heads/{}", name);
        self.probe(&["show-ref", "--verify", "--quiet", &refname]).await
    }

    async fn remote_branch_exists(&self, name: &str) -> Result<bool, GitError> {
        let refname = format!("refs/remotes/{}/{}", self.remote, name);
        self.probe(&["show-ref", "--verify", "--quiet", &refname]).await
    }

    /// Map a branch name to something `merge`/`merge-base` accept even when
    /// only the remote-tracking branch exists. Non-branch revisions pass
    /// through unchanged.
    async fn resolve_branch(&self, name: &str) -> Result<String, GitError> {
        if self.local_branch_exists(name).await? {
            Ok(name.to_string())
        } else if self.remote_branch_exists(name).await? {
            Ok(format!("{}/{}", self.remote, name))
        } else {
            Ok(name.to_string())
        }
    }
}

fn is_rejection(stderr: &str) -> bool {
    stderr.contains("[rejected]")
        || stderr.contains("non-fast-forward")
        || stderr.contains("fetch first")
}

#[async_trait]
impl VcsBackend for GitCli {
    fn workdir(&self) -> &Path {
        &self.dir
    }

    async fn exists(&self) -> bool {
        if tokio::fs::metadata(self.dir.join(".git")).await.is_ok() {
            return true;
        }
        let head = tokio::fs::metadata(self.dir.join("HEAD")).await;
        let objects = tokio::fs::metadata(self.dir.join("objects")).await;
        matches!((head, objects), (Ok(h), Ok(o)) if h.is_file() && o.is_dir())
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn init_bare(&self, default_branch: &str) -> Result<(), GitError> {
        self.run(&["init", "--bare", "--quiet", "--initial-branch", default_branch])
            .await?;
        info!("initialized bare repository");
        Ok(())
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn clone_from(&self, source: &Path) -> Result<(), GitError> {
        let parent = self
            .dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let target = self
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| GitError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("clone target '{}' has no directory name", self.dir.display()),
            )))?;
        let source = if source.is_absolute() {
            source.to_path_buf()
        } else {
            std::env::current_dir()?.join(source)
        };
        let source = source.to_string_lossy().to_string();

        info!(source = %source, "cloning repository");
        self.run_remote(&parent, "clone", &["clone", "--quiet", &source, &target])
            .await?;
        info!("clone completed");
        Ok(())
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn configure_identity(&self, name: &str, email: &str) -> Result<(), GitError> {
        self.run(&["config", "user.name", name]).await?;
        self.run(&["config", "user.email", email]).await?;
        debug!("configured commit identity");
        Ok(())
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn checkout(&self, reference: &str) -> Result<(), GitError> {
        self.run(&["checkout", "--quiet", reference]).await?;
        debug!(reference, "checked out");
        Ok(())
    }

    async fn branch_exists(&self, name: &str) -> Result<bool, GitError> {
        if self.local_branch_exists(name).await? {
            return Ok(true);
        }
        self.remote_branch_exists(name).await
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn create_branch(&self, name: &str) -> Result<(), GitError> {
        self.run(&["branch", name]).await?;
        info!(name, "created branch");
        Ok(())
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn rename_current_branch(&self, name: &str) -> Result<(), GitError> {
        self.run(&["branch", "-M", name]).await?;
        Ok(())
    }

    async fn branch_list(&self) -> Result<String, GitError> {
        self.run(&["branch", "-a", "--no-color"]).await
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn fetch(&self) -> Result<(), GitError> {
        self.run_remote(&self.dir, "fetch", &["fetch", "--quiet", "--prune", &self.remote])
            .await?;
        debug!("fetch completed");
        Ok(())
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn pull(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        self.run_remote(
            &self.dir,
            "pull",
            &["pull", "--quiet", "--no-rebase", "--no-edit", remote, branch],
        )
        .await?;
        debug!("pull completed");
        Ok(())
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn push(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        info!(remote, branch, "pushing");
        let output = self
            .output_in(
                &self.dir,
                &["push", "--quiet", remote, branch],
                self.network_timeout,
                "push",
            )
            .await?;
        if !output.status.success() {
            let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_rejection(&detail) {
                warn!(branch, %detail, "push rejected");
                return Err(GitError::PushRejected {
                    branch: branch.to_string(),
                    detail,
                });
            }
            warn!(branch, %detail, "push failed");
            return Err(GitError::RemoteSyncFailure {
                operation: "push".into(),
                detail,
            });
        }
        info!("push completed");
        Ok(())
    }

    async fn status(&self) -> Result<bool, GitError> {
        let output = self.run(&["status", "--porcelain"]).await?;
        Ok(!output.trim().is_empty())
    }

    async fn add_all(&self) -> Result<(), GitError> {
        self.run(&["add", "--all"]).await?;
        Ok(())
    }

    #[instrument(skip(self, message), fields(dir = %self.dir.display()))]
    async fn commit(&self, message: &str) -> Result<(), GitError> {
        self.run(&["commit", "--quiet", "-m", message]).await?;
        info!("created commit");
        Ok(())
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn merge(&self, branch: &str) -> Result<MergeOutcome, GitError> {
        let reference = self.resolve_branch(branch).await?;
        let args = ["merge", "--no-edit", reference.as_str()];
        let output = self
            .output_in(&self.dir, &args, self.command_timeout, "merge")
            .await?;
        if output.status.success() {
            info!(branch, "merge completed");
            return Ok(MergeOutcome::Merged);
        }

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let files = parse_name_list(&self.run(&["diff", "--name-only", "--diff-filter=U"]).await?);
        if !files.is_empty() || self.merge_in_progress().await? {
            warn!(branch, count = files.len(), "merge stopped with conflicts");
            return Ok(MergeOutcome::Conflicted {
                output: combined,
                files,
            });
        }

        Err(GitError::CommandFailed {
            command: format!("git {}", args.join(" ")),
            exit_code: output.status.code().unwrap_or(-1),
            stderr: combined.trim().to_string(),
        })
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn abort_merge(&self) -> Result<(), GitError> {
        self.run(&["merge", "--abort"]).await?;
        info!("merge aborted");
        Ok(())
    }

    async fn merge_in_progress(&self) -> Result<bool, GitError> {
        self.probe(&["rev-parse", "-q", "--verify", "MERGE_HEAD"]).await
    }

    async fn merge_base(&self, a: &str, b: &str) -> Result<String, GitError> {
        let a = self.resolve_branch(a).await?;
        let b = self.resolve_branch(b).await?;
        Ok(self.run(&["merge-base", &a, &b]).await?.trim().to_string())
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn structured_log(&self, revision: &str) -> Result<Vec<Commit>, GitError> {
        let output = self
            .run(&["log", "--first-parent", LOG_FORMAT, revision, "--"])
            .await?;
        let commits = parse_log(&output)?;
        debug!(count = commits.len(), "collected commits");
        Ok(commits)
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn discard_changes(&self) -> Result<(), GitError> {
        self.run(&["reset", "--quiet", "--hard"]).await?;
        self.run(&["clean", "-fdq"]).await?;
        debug!("discarded working tree changes");
        Ok(())
    }

    async fn head(&self) -> Result<String, GitError> {
        Ok(self.run(&["rev-parse", "HEAD"]).await?.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_is_rejection() {
        assert!(is_rejection(" ! [rejected]        master -> master (fetch first)"));
        assert!(is_rejection("error: failed to push some refs (non-fast-forward)"));
        assert!(!is_rejection("fatal: 'origin' does not appear to be a git repository"));
    }

    #[tokio::test]
    async fn test_missing_directory_is_io_error() {
        let client = GitCli::new("/nonexistent/vetus/u1", &GitConfig::default());
        let result = client.status().await;
        assert!(matches!(result, Err(GitError::IoError(_))));
        assert!(!client.exists().await);
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let config = GitConfig {
            binary: "definitely-not-git-binary".into(),
            ..Default::default()
        };
        let client = GitCli::new(dir.path(), &config);
        assert!(matches!(client.head().await, Err(GitError::BinaryNotFound(_))));
    }

    #[tokio::test]
    async fn test_bare_clone_commit_and_log() {
        if !git_available() {
            eprintln!("SKIPPED: git not found in PATH");
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let config = GitConfig::default();

        let bare_dir = tmp.path().join("_bare");
        std::fs::create_dir_all(&bare_dir).unwrap();
        let bare = GitCli::new(&bare_dir, &config);
        assert!(!bare.exists().await);
        bare.init_bare("master").await.unwrap();
        assert!(bare.exists().await);

        let work = GitCli::new(tmp.path().join("u1"), &config);
        work.clone_from(&bare_dir).await.unwrap();
        assert!(work.exists().await);
        work.configure_identity("u1", "u1@vetus").await.unwrap();

        assert!(!work.status().await.unwrap());
        std::fs::write(tmp.path().join("u1").join("a.json"), "{}\n").unwrap();
        assert!(work.status().await.unwrap());
        work.add_all().await.unwrap();
        work.commit("first").await.unwrap();
        work.rename_current_branch("master").await.unwrap();
        work.push("origin", "master").await.unwrap();

        let log = work.structured_log("master").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].author, "u1");
        assert_eq!(log[0].subject, "first");
        assert_eq!(log[0].hash, work.head().await.unwrap());

        assert!(work.branch_exists("master").await.unwrap());
        assert!(!work.branch_exists("nope").await.unwrap());
        assert!(!work.merge_in_progress().await.unwrap());
    }
}

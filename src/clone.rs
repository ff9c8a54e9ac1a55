//! Repository cloning inside disposable containers.
//!
//! Each attempt builds a throwaway cloner image on top of the configured git
//! image, runs one shell pipeline in it as the owner of the destination and
//! reads the resolved commit SHA back from the container output.

use std::path::Path;
use std::time::Duration;

use slipway_common::naming::is_commit_sha;

use crate::config::WorkerConfig;
use crate::docker::{BuildContext, BuildRequest, ContainerSpec, ExitStatus, shell_quote, unique_name};
use crate::errors::CloneError;
use crate::image::dockerfile;
use crate::job::BuildJob;
use crate::logging::JobLog;
use crate::retry::RetryPolicy;
use crate::workdir;

const LOG_STAGE: &str = "clone";
const CLONE_MOUNT: &str = "/workspace";

/// Shell pipeline that clones `url` at `revision` into `./code` and prints
/// the checked-out commit.
pub fn clone_script(url: &str, revision: &str) -> String {
    let url = shell_quote(url);
    let revision = revision.trim();
    if is_commit_sha(revision) {
        format!(
            "git clone {url} code && cd code && git checkout -B local {} && git rev-parse HEAD",
            revision
        )
    } else if revision.is_empty() {
        format!("git clone --depth 1 {url} code && cd code && git rev-parse HEAD")
    } else {
        format!(
            "git clone --depth 1 --single-branch --branch {} {url} code && cd code && git rev-parse HEAD",
            shell_quote(revision)
        )
    }
}

/// Last 40-hex line of the container output.
pub fn parse_commit_sha(output: &str) -> Option<String> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| is_commit_sha(l))
        .map(str::to_ascii_lowercase)
}

/// `uid:gid` owning `path`, so the checkout is writable by the host worker.
#[cfg(unix)]
fn owner_of(path: &Path) -> std::io::Result<Option<String>> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path)?;
    Ok(Some(format!("{}:{}", meta.uid(), meta.gid())))
}

#[cfg(not(unix))]
fn owner_of(path: &Path) -> std::io::Result<Option<String>> {
    std::fs::metadata(path)?;
    Ok(None)
}

pub struct RepoCloner<'a> {
    git_image: &'a str,
    timeout: Duration,
    retry: RetryPolicy,
}

impl<'a> RepoCloner<'a> {
    pub fn new(config: &'a WorkerConfig) -> Self {
        Self {
            git_image: &config.git_image,
            timeout: config.clone_timeout(),
            retry: config.clone_retry(),
        }
    }

    /// Clone into `<destination>/code` and return the commit SHA.
    pub async fn clone(
        &self,
        job: &mut BuildJob,
        url: &str,
        revision: &str,
        destination: &Path,
        log: &JobLog,
    ) -> Result<String, CloneError> {
        let user = owner_of(destination).map_err(|source| CloneError::Destination {
            path: destination.to_path_buf(),
            source,
        })?;
        let script = clone_script(url, revision);
        let code_dir = destination.join("code");
        let max = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        log.line(LOG_STAGE, format!("cloning {} at '{}'", url, revision));
        for attempt in 1..=max {
            match self.attempt(job, &script, destination, user.clone()).await {
                Ok(AttemptResult::Sha(sha)) => {
                    log.line(LOG_STAGE, format!("checked out {}", sha));
                    return Ok(sha);
                }
                Ok(AttemptResult::TimedOut) => {
                    last_error = format!("clone timed out after {}s", self.timeout.as_secs());
                    log.error(LOG_STAGE, &last_error);
                    remove_partial(job, &code_dir, log).await;
                    return Err(CloneError::NoCommitSha {
                        attempts: attempt,
                        last_error,
                    });
                }
                Ok(AttemptResult::Failed(output)) => {
                    log.output(LOG_STAGE, &output);
                    last_error = output
                        .lines()
                        .rev()
                        .find(|l| !l.trim().is_empty())
                        .unwrap_or("clone produced no output")
                        .trim()
                        .to_string();
                }
                Err(e) => last_error = e,
            }

            log.error(
                LOG_STAGE,
                format!("attempt {}/{} failed: {}", attempt, max, last_error),
            );
            remove_partial(job, &code_dir, log).await;
            if attempt < max {
                let delay = self.retry.delay(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(CloneError::NoCommitSha {
            attempts: max,
            last_error,
        })
    }

    async fn attempt(
        &self,
        job: &mut BuildJob,
        script: &str,
        destination: &Path,
        user: Option<String>,
    ) -> Result<AttemptResult, String> {
        let tag = format!("slipway-cloner-{}", unique_name(job.id()));
        let build = BuildRequest {
            tag: tag.clone(),
            context: BuildContext::Inline(dockerfile::cloner(self.git_image)),
            nocache: false,
            memory: None,
        };
        job.track_image(&tag);
        let built = job.runtime().build_image(&build).await;
        let result = match built {
            Ok(out) if out.error.is_none() => {
                let spec = ContainerSpec {
                    name: unique_name("slipway-clone"),
                    image: tag.clone(),
                    entrypoint: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
                    cmd: vec![script.to_string()],
                    user,
                    env: vec!["HOME=/tmp".to_string(), "GIT_TERMINAL_PROMPT=0".to_string()],
                    binds: vec![format!("{}:{}", destination.display(), CLONE_MOUNT)],
                    working_dir: Some(CLONE_MOUNT.to_string()),
                    memory: None,
                };
                match job.run_container(&spec, self.timeout).await {
                    Ok(outcome) => match outcome.exit {
                        ExitStatus::TimedOut => Ok(AttemptResult::TimedOut),
                        ExitStatus::Code(0) => match parse_commit_sha(&outcome.output) {
                            Some(sha) if destination.join("code").is_dir() => {
                                Ok(AttemptResult::Sha(sha))
                            }
                            _ => Ok(AttemptResult::Failed(outcome.output)),
                        },
                        ExitStatus::Code(_) => Ok(AttemptResult::Failed(outcome.output)),
                    },
                    Err(e) => Err(e.to_string()),
                }
            }
            Ok(out) => Err(format!(
                "cloner image build failed: {}",
                out.error.unwrap_or_default()
            )),
            Err(e) => Err(e.to_string()),
        };

        if let Err(e) = job.runtime().remove_image(&tag).await {
            tracing::warn!(image = %tag, error = %e, "cloner image removal deferred to job close");
        } else {
            job.release_image(&tag);
        }
        result
    }
}

enum AttemptResult {
    Sha(String),
    Failed(String),
    TimedOut,
}

async fn remove_partial(job: &BuildJob, code_dir: &Path, log: &JobLog) {
    if let Err(e) = workdir::remove_tree(job.runtime(), job.cleanup_image(), code_dir).await {
        log.error(LOG_STAGE, format!("failed to remove partial checkout: {}", e));
    }
}

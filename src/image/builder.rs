use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::config::WorkerConfig;
use crate::docker::{BuildContext, BuildOutput, BuildRequest};
use crate::errors::BuildError;
use crate::job::BuildJob;
use crate::logging::JobLog;

static BUILT_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Successfully built ([0-9a-f]{12,64})").unwrap());

/// Image id from the builder's success marker, if present.
pub fn built_image_id(output: &BuildOutput) -> Option<String> {
    if output.error.is_some() {
        return None;
    }
    output
        .lines
        .iter()
        .rev()
        .find_map(|l| BUILT_MARKER.captures(l).map(|c| c[1].to_string()))
}

/// Drives image builds with one no-cache retry.
pub struct ImageBuilder {
    timeout: Duration,
    memory: Option<u64>,
}

impl ImageBuilder {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            timeout: config.build_timeout(),
            memory: Some(config.build_memory_bytes()).filter(|m| *m > 0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build `tag`, tracking it on the job. A failed first attempt is retried
    /// once with the cache disabled; a timeout is final.
    pub async fn build(
        &self,
        job: &mut BuildJob,
        tag: &str,
        context: BuildContext,
        log: &JobLog,
        stage: &str,
    ) -> Result<String, BuildError> {
        job.track_image(tag);
        let mut last_error = String::new();
        for nocache in [false, true] {
            let req = BuildRequest {
                tag: tag.to_string(),
                context: context.clone(),
                nocache,
                memory: self.memory,
            };
            log.line(
                stage,
                format!("building {}{}", tag, if nocache { " (no cache)" } else { "" }),
            );
            let result = tokio::time::timeout(self.timeout, job.runtime().build_image(&req)).await;
            let output = match result {
                Err(_) => {
                    log.error(stage, format!("build of {} timed out", tag));
                    return Err(BuildError::TimedOut {
                        tag: tag.to_string(),
                        secs: self.timeout.as_secs(),
                    });
                }
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    log.error(stage, &last_error);
                    continue;
                }
                Ok(Ok(output)) => output,
            };

            log.output(stage, &output.lines.join("\n"));
            if let Some(id) = built_image_id(&output) {
                log.line(stage, format!("built {} ({})", tag, id));
                return Ok(id);
            }
            last_error = output
                .error
                .unwrap_or_else(|| "builder reported no success marker".to_string());
            log.error(stage, format!("build of {} failed: {}", tag, last_error));
        }

        Err(BuildError::Failed {
            tag: tag.to_string(),
            message: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::{FakeRuntime, build_failed, built};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, JobLog, FakeRuntime, BuildJob) {
        let dir = tempdir().unwrap();
        let log = JobLog::create(dir.path(), "res", "job").unwrap();
        let fake = FakeRuntime::new();
        let job = BuildJob::new(Arc::new(fake.clone()), "busybox");
        (dir, log, fake, job)
    }

    fn inline() -> BuildContext {
        BuildContext::Inline("FROM scratch\n".into())
    }

    #[test]
    fn marker_requires_no_error() {
        assert_eq!(
            built_image_id(&built("app")).as_deref(),
            Some("0123456789ab")
        );
        let mut out = built("app");
        out.error = Some("boom".into());
        assert!(built_image_id(&out).is_none());
        assert!(built_image_id(&BuildOutput::default()).is_none());
    }

    #[tokio::test]
    async fn first_failure_gets_one_nocache_retry() {
        let (_dir, log, fake, mut job) = setup();
        fake.script_builds("app", vec![build_failed("network flake")]);

        let builder = ImageBuilder::new(&WorkerConfig::default());
        builder
            .build(&mut job, "app", inline(), &log, "build")
            .await
            .unwrap();

        assert_eq!(
            fake.builds(),
            vec![("app".to_string(), false), ("app".to_string(), true)]
        );
        job.close().await;
        assert!(fake.images().is_empty());
    }

    #[tokio::test]
    async fn second_failure_is_final() {
        let (_dir, log, fake, mut job) = setup();
        fake.script_builds(
            "app",
            vec![build_failed("first"), build_failed("second"), built("app")],
        );

        let err = ImageBuilder::new(&WorkerConfig::default())
            .build(&mut job, "app", inline(), &log, "build")
            .await
            .unwrap_err();

        match err {
            BuildError::Failed { tag, message } => {
                assert_eq!(tag, "app");
                assert_eq!(message, "second");
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
        assert_eq!(fake.builds().len(), 2);
        job.close().await;
    }

    #[tokio::test]
    async fn timeout_is_final_without_retry() {
        let (_dir, log, fake, mut job) = setup();
        fake.delay_builds(Duration::from_secs(30));

        let err = ImageBuilder::new(&WorkerConfig::default())
            .with_timeout(Duration::from_millis(20))
            .build(&mut job, "app", inline(), &log, "build")
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::TimedOut { ref tag, .. } if tag == "app"));
        assert_eq!(fake.builds(), vec![("app".to_string(), false)]);
        job.close().await;
    }

    #[tokio::test]
    async fn missing_marker_counts_as_failure() {
        let (_dir, log, fake, mut job) = setup();
        let silent = BuildOutput {
            lines: vec!["Step 1/1 : FROM scratch".into()],
            error: None,
        };
        fake.script_builds("app", vec![silent.clone(), silent]);

        let err = ImageBuilder::new(&WorkerConfig::default())
            .build(&mut job, "app", inline(), &log, "build")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no success marker"));
        job.close().await;
    }
}

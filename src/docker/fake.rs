//! Scripted in-memory [`ContainerRuntime`] for tests.
//!
//! Tracks live containers and images so tests can assert that a job left
//! nothing behind. Without scripting, builds succeed, cleanup containers
//! really delete their bind-mounted target and clone containers create a
//! `code/` checkout and print a commit SHA.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    BuildOutput, BuildRequest, ContainerOutcome, ContainerRuntime, ContainerSpec, ExitStatus,
};
use crate::errors::DockerError;

pub const FAKE_SHA: &str = "0123456789abcdef0123456789abcdef01234567";

type RunHandler = Arc<dyn Fn(&ContainerSpec) -> Option<ContainerOutcome> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Build { tag: String, nocache: bool },
    Create { name: String, image: String },
    Run { name: String },
    RemoveContainer(String),
    Save(String),
    Load,
    Push(String),
    RemoveImage(String),
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    /// Scripted results for builds whose tag starts with the key.
    build_results: Vec<(String, VecDeque<BuildOutput>)>,
    containers: Vec<(String, ContainerSpec)>,
    live_containers: BTreeSet<String>,
    images: BTreeSet<String>,
    build_delay: Option<Duration>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<State>>,
    handler: Arc<Mutex<Option<RunHandler>>>,
}

pub fn built(tag: &str) -> BuildOutput {
    BuildOutput {
        lines: vec![
            "Step 1/1 : FROM base".to_string(),
            format!("Successfully built {}", &FAKE_SHA[..12]),
            format!("Successfully tagged {}", tag),
        ],
        error: None,
    }
}

pub fn build_failed(message: &str) -> BuildOutput {
    BuildOutput {
        lines: vec!["Step 1/2 : FROM base".to_string()],
        error: Some(message.to_string()),
    }
}

pub fn exited(code: i64, output: &str) -> ContainerOutcome {
    ContainerOutcome {
        exit: ExitStatus::Code(code),
        output: output.to_string(),
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue build results for tags beginning with `prefix`; once drained,
    /// builds succeed.
    pub fn script_builds(&self, prefix: &str, results: Vec<BuildOutput>) {
        let mut state = self.state.lock().unwrap();
        state
            .build_results
            .push((prefix.to_string(), results.into_iter().collect()));
    }

    /// Override container runs. Returning `None` falls back to the default
    /// clone/cleanup emulation.
    pub fn on_run<F>(&self, f: F)
    where
        F: Fn(&ContainerSpec) -> Option<ContainerOutcome> + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap() = Some(Arc::new(f));
    }

    /// Every build sleeps this long before answering.
    pub fn delay_builds(&self, delay: Duration) {
        self.state.lock().unwrap().build_delay = Some(delay);
    }

    pub fn add_image(&self, tag: &str) {
        self.state.lock().unwrap().images.insert(tag.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn builds(&self) -> Vec<(String, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Build { tag, nocache } => Some((tag, nocache)),
                _ => None,
            })
            .collect()
    }

    /// Specs of every container created, in order.
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .map(|(_, spec)| spec.clone())
            .collect()
    }

    pub fn live_containers(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .live_containers
            .iter()
            .cloned()
            .collect()
    }

    pub fn images(&self) -> Vec<String> {
        self.state.lock().unwrap().images.iter().cloned().collect()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn default_run(spec: &ContainerSpec) -> ContainerOutcome {
        let script = spec.cmd.join(" ");
        if script.contains("rm -rf") {
            remove_bound_targets(spec);
            return exited(0, "");
        }
        if script.contains("git clone") {
            return emulate_clone(spec, &script);
        }
        exited(0, "")
    }
}

/// Host path behind a container path, resolved through the bind mounts.
fn host_path(spec: &ContainerSpec, container_path: &str) -> Option<std::path::PathBuf> {
    spec.binds.iter().find_map(|bind| {
        let mut parts = bind.split(':');
        let host = parts.next()?;
        let target = parts.next()?;
        let rest = container_path.strip_prefix(target)?;
        Some(Path::new(host).join(rest.trim_start_matches('/')))
    })
}

fn remove_bound_targets(spec: &ContainerSpec) {
    let script = spec.cmd.join(" ");
    let Some(args) = script.split("rm -rf").nth(1) else {
        return;
    };
    for arg in args.split_whitespace() {
        let arg = arg.trim_matches('\'');
        if let Some(path) = host_path(spec, arg) {
            let _ = std::fs::remove_dir_all(&path).or_else(|_| std::fs::remove_file(&path));
        }
    }
}

fn emulate_clone(spec: &ContainerSpec, script: &str) -> ContainerOutcome {
    let Some(workdir) = spec.working_dir.as_deref().and_then(|w| host_path(spec, w)) else {
        return exited(128, "fatal: no working directory");
    };
    let code = workdir.join("code");
    if std::fs::create_dir_all(&code).is_err() {
        return exited(128, "fatal: could not create work tree");
    }
    let _ = std::fs::write(code.join("README"), "fake checkout\n");
    let sha = script
        .split_whitespace()
        .map(|w| w.trim_matches('\''))
        .find(|w| slipway_common::naming::is_commit_sha(w))
        .unwrap_or(FAKE_SHA)
        .to_ascii_lowercase();
    exited(0, &format!("Cloning into 'code'...\n{}\n", sha))
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build_image(&self, req: &BuildRequest) -> Result<BuildOutput, DockerError> {
        self.record(Call::Build {
            tag: req.tag.clone(),
            nocache: req.nocache,
        });
        let delay = self.state.lock().unwrap().build_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        let scripted = state
            .build_results
            .iter_mut()
            .find(|(prefix, queue)| req.tag.starts_with(prefix.as_str()) && !queue.is_empty())
            .and_then(|(_, queue)| queue.pop_front());
        let output = scripted.unwrap_or_else(|| built(&req.tag));
        if output.error.is_none() {
            state.images.insert(req.tag.clone());
        }
        Ok(output)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        self.record(Call::Create {
            name: spec.name.clone(),
            image: spec.image.clone(),
        });
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("c{}", state.next_id);
        state.containers.push((id.clone(), spec.clone()));
        state.live_containers.insert(id.clone());
        Ok(id)
    }

    async fn start_and_wait(
        &self,
        id: &str,
        _timeout: Duration,
    ) -> Result<ContainerOutcome, DockerError> {
        let spec = {
            let state = self.state.lock().unwrap();
            state
                .containers
                .iter()
                .find(|(cid, _)| cid == id)
                .map(|(_, spec)| spec.clone())
        };
        let Some(spec) = spec else {
            return Err(DockerError::api("start container", "no such container"));
        };
        self.record(Call::Run {
            name: spec.name.clone(),
        });
        let handler = self.handler.lock().unwrap().clone();
        let scripted = handler.and_then(|h| h(&spec));
        Ok(scripted.unwrap_or_else(|| Self::default_run(&spec)))
    }

    async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        self.record(Call::RemoveContainer(id.to_string()));
        self.state.lock().unwrap().live_containers.remove(id);
        Ok(())
    }

    async fn save_image(&self, tag: &str, dest: &Path) -> Result<u64, DockerError> {
        self.record(Call::Save(tag.to_string()));
        if !self.state.lock().unwrap().images.contains(tag) {
            return Err(DockerError::api("save image", format!("No such image: {}", tag)));
        }
        std::fs::write(dest, tag.as_bytes()).map_err(|source| DockerError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        Ok(tag.len() as u64)
    }

    async fn load_image(&self, src: &Path) -> Result<(), DockerError> {
        self.record(Call::Load);
        let tag = std::fs::read_to_string(src).map_err(|source| DockerError::Io {
            path: src.to_path_buf(),
            source,
        })?;
        self.state.lock().unwrap().images.insert(tag.trim().to_string());
        Ok(())
    }

    async fn push_image(&self, tag: &str) -> Result<(), DockerError> {
        self.record(Call::Push(tag.to_string()));
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool, DockerError> {
        Ok(self.state.lock().unwrap().images.contains(tag))
    }

    async fn remove_image(&self, tag: &str) -> Result<(), DockerError> {
        self.record(Call::RemoveImage(tag.to_string()));
        self.state.lock().unwrap().images.remove(tag);
        Ok(())
    }
}

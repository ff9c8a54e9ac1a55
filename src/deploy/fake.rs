//! Scripted stack and network services for tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::heat::{StackInfo, StackOutput, StackService};
use super::network::{Network, NetworkService};
use crate::errors::DeployError;

pub const FAKE_IP: &str = "172.24.4.10";

struct Entry {
    info: StackInfo,
    polls: u32,
}

struct State {
    stacks: BTreeMap<String, Entry>,
    complete_after: u32,
    never_complete: bool,
    fail: bool,
    delete_fails: bool,
    outputs: Vec<StackOutput>,
    creates: Vec<String>,
    updates: Vec<String>,
    deletes: Vec<String>,
    gets: u32,
    next_id: u32,
}

/// In-memory orchestration service. In-progress stacks settle after
/// `complete_after` lookups.
#[derive(Clone)]
pub struct FakeStacks {
    state: Arc<Mutex<State>>,
}

impl FakeStacks {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                stacks: BTreeMap::new(),
                complete_after: 1,
                never_complete: false,
                fail: false,
                delete_fails: false,
                outputs: vec![StackOutput {
                    output_key: "public_ip".into(),
                    output_value: FAKE_IP.into(),
                }],
                creates: Vec::new(),
                updates: Vec::new(),
                deletes: Vec::new(),
                gets: 0,
                next_id: 0,
            })),
        }
    }

    pub fn complete_after(&self, polls: u32) {
        self.state.lock().unwrap().complete_after = polls;
    }

    pub fn never_complete(&self) {
        self.state.lock().unwrap().never_complete = true;
    }

    /// Creates and updates end in `*_FAILED`.
    pub fn fail(&self) {
        self.state.lock().unwrap().fail = true;
    }

    pub fn fail_deletes(&self) {
        self.state.lock().unwrap().delete_fails = true;
    }

    pub fn set_outputs(&self, outputs: Vec<(&str, serde_json::Value)>) {
        self.state.lock().unwrap().outputs = outputs
            .into_iter()
            .map(|(k, v)| StackOutput {
                output_key: k.to_string(),
                output_value: v,
            })
            .collect();
    }

    pub fn creates(&self) -> Vec<String> {
        self.state.lock().unwrap().creates.clone()
    }

    pub fn updates(&self) -> Vec<String> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.state.lock().unwrap().deletes.clone()
    }

    pub fn gets(&self) -> u32 {
        self.state.lock().unwrap().gets
    }

    pub fn exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().stacks.contains_key(name)
    }
}

#[async_trait]
impl StackService for FakeStacks {
    async fn get_stack(&self, name: &str) -> Result<Option<StackInfo>, DeployError> {
        let mut state = self.state.lock().unwrap();
        state.gets += 1;
        let (complete_after, never, fail, delete_fails) = (
            state.complete_after,
            state.never_complete,
            state.fail,
            state.delete_fails,
        );
        let Some(entry) = state.stacks.get_mut(name) else {
            return Ok(None);
        };
        let status = entry.info.stack_status.clone();
        if let Some(action) = status.strip_suffix("_IN_PROGRESS") {
            entry.polls += 1;
            if action == "DELETE" {
                if delete_fails {
                    entry.info.stack_status = "DELETE_FAILED".into();
                } else {
                    state.stacks.remove(name);
                    return Ok(None);
                }
            } else if fail {
                entry.info.stack_status = format!("{}_FAILED", action);
                entry.info.stack_status_reason = Some("Resource CREATE failed".into());
            } else if !never && entry.polls >= complete_after {
                entry.info.stack_status = format!("{}_COMPLETE", action);
            }
        }
        Ok(Some(entry.info.clone()))
    }

    async fn create_stack(
        &self,
        name: &str,
        _template: &str,
        _parameters: &BTreeMap<String, String>,
    ) -> Result<String, DeployError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("stack-{}", state.next_id);
        let outputs = state.outputs.clone();
        state.creates.push(name.to_string());
        state.stacks.insert(
            name.to_string(),
            Entry {
                info: StackInfo {
                    id: id.clone(),
                    stack_name: name.to_string(),
                    stack_status: "CREATE_IN_PROGRESS".into(),
                    stack_status_reason: None,
                    outputs,
                },
                polls: 0,
            },
        );
        Ok(id)
    }

    async fn update_stack(
        &self,
        name: &str,
        _id: &str,
        _template: &str,
        _parameters: &BTreeMap<String, String>,
    ) -> Result<(), DeployError> {
        let mut state = self.state.lock().unwrap();
        state.updates.push(name.to_string());
        let entry = state
            .stacks
            .get_mut(name)
            .ok_or_else(|| DeployError::orchestration("update stack", "HTTP 404"))?;
        entry.info.stack_status = "UPDATE_IN_PROGRESS".into();
        entry.polls = 0;
        Ok(())
    }

    async fn delete_stack(&self, name: &str, _id: &str) -> Result<(), DeployError> {
        let mut state = self.state.lock().unwrap();
        state.deletes.push(name.to_string());
        if let Some(entry) = state.stacks.get_mut(name) {
            entry.info.stack_status = "DELETE_IN_PROGRESS".into();
            entry.polls = 0;
        }
        Ok(())
    }
}

/// One public and one private network.
pub struct FakeNetworks;

#[async_trait]
impl NetworkService for FakeNetworks {
    async fn list_networks(&self) -> Result<Vec<Network>, DeployError> {
        Ok(vec![
            Network {
                id: "net-public".into(),
                name: "public".into(),
                external: true,
                subnets: vec!["subnet-public".into()],
            },
            Network {
                id: "net-private".into(),
                name: "private".into(),
                external: false,
                subnets: vec!["subnet-private".into()],
            },
        ])
    }
}

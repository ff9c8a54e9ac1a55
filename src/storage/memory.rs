//! In-memory [`BlobStore`] for tests, with scriptable interruptions.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use super::swift::{BlobStore, RangeBody};
use crate::errors::PersistError;

const CHUNK: usize = 8;

#[derive(Default)]
struct State {
    containers: BTreeSet<String>,
    objects: BTreeMap<(String, String), Vec<u8>>,
    /// Bytes served by each upcoming open before the stream breaks.
    interruptions: VecDeque<usize>,
    ignore_ranges: bool,
    range_offsets: Vec<u64>,
}

#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    state: Arc<Mutex<State>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, container: &str, object: &str, data: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(container.to_string());
        state
            .objects
            .insert((container.to_string(), object.to_string()), data);
    }

    pub fn get(&self, container: &str, object: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(container.to_string(), object.to_string()))
            .cloned()
    }

    /// Object names in `container`.
    pub fn objects(&self, container: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, o)| o.clone())
            .collect()
    }

    pub fn interrupt_after(&self, bytes: Vec<usize>) {
        self.state.lock().unwrap().interruptions = bytes.into();
    }

    pub fn ignore_ranges(&self) {
        self.state.lock().unwrap().ignore_ranges = true;
    }

    pub fn range_offsets(&self) -> Vec<u64> {
        self.state.lock().unwrap().range_offsets.clone()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn ensure_container(&self, container: &str) -> Result<(), PersistError> {
        self.state
            .lock()
            .unwrap()
            .containers
            .insert(container.to_string());
        Ok(())
    }

    async fn upload(&self, container: &str, object: &str, src: &Path) -> Result<(), PersistError> {
        let data = std::fs::read(src).map_err(|source| PersistError::Io {
            path: src.to_path_buf(),
            source,
        })?;
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains(container) {
            return Err(PersistError::blob("upload", "no such container"));
        }
        state
            .objects
            .insert((container.to_string(), object.to_string()), data);
        Ok(())
    }

    async fn open_range(
        &self,
        container: &str,
        object: &str,
        offset: u64,
    ) -> Result<RangeBody, PersistError> {
        let mut state = self.state.lock().unwrap();
        state.range_offsets.push(offset);
        let data = state
            .objects
            .get(&(container.to_string(), object.to_string()))
            .cloned()
            .ok_or_else(|| PersistError::blob("download", "HTTP 404 Not Found"))?;
        let start = if state.ignore_ranges { 0 } else { offset };
        let rest = data[(start as usize).min(data.len())..].to_vec();
        let cut = state.interruptions.pop_front();

        let served = cut.map_or(rest.len(), |n| n.min(rest.len()));
        let mut items: Vec<Result<Vec<u8>, PersistError>> = rest[..served]
            .chunks(CHUNK)
            .map(|c| Ok(c.to_vec()))
            .collect();
        if cut.is_some() {
            items.push(Err(PersistError::blob("download", "connection reset")));
        }
        Ok(RangeBody {
            start,
            stream: futures_util::stream::iter(items).boxed(),
        })
    }

    async fn delete(&self, container: &str, object: &str) -> Result<(), PersistError> {
        self.state
            .lock()
            .unwrap()
            .objects
            .remove(&(container.to_string(), object.to_string()));
        Ok(())
    }

    fn temp_url(
        &self,
        container: &str,
        object: &str,
        ttl: Duration,
    ) -> Result<String, PersistError> {
        Ok(format!(
            "memory://{}/{}?ttl={}",
            container,
            object,
            ttl.as_secs()
        ))
    }
}

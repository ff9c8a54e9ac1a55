//! Guarded Assembly status writes.
//!
//! Every write re-reads the stored status first. `DELETING` set by another
//! actor aborts the run; moves that would go backwards are refused.
//!
//! One tracker spans one run. Until the run has written a status, whatever
//! an earlier run left behind may be replaced.

use std::sync::atomic::{AtomicBool, Ordering};

use slipway_common::AssemblyStatus;

use crate::errors::StatusError;
use crate::store::MetadataStore;

pub struct StatusTracker<'a> {
    store: &'a dyn MetadataStore,
    assembly_id: i64,
    /// Set once this run has written a status.
    written: AtomicBool,
}

impl<'a> StatusTracker<'a> {
    pub fn new(store: &'a dyn MetadataStore, assembly_id: i64) -> Self {
        Self {
            store,
            assembly_id,
            written: AtomicBool::new(false),
        }
    }

    pub async fn current(&self) -> Result<AssemblyStatus, StatusError> {
        let assembly = self
            .store
            .get_assembly(self.assembly_id)
            .await
            .map_err(StatusError::Store)?
            .ok_or(StatusError::NotFound {
                id: self.assembly_id,
            })?;
        Ok(assembly.status)
    }

    /// Fail with [`StatusError::Deleting`] if deletion has started.
    pub async fn ensure_live(&self) -> Result<AssemblyStatus, StatusError> {
        let current = self.current().await?;
        if current == AssemblyStatus::Deleting {
            return Err(StatusError::Deleting {
                id: self.assembly_id,
            });
        }
        Ok(current)
    }

    /// First write of a new run: `next` replaces whatever an earlier run left,
    /// unless deletion has started.
    pub async fn begin(&self, next: AssemblyStatus) -> Result<(), StatusError> {
        let current = self.ensure_live().await?;
        if current != next {
            self.store
                .set_assembly_status(self.assembly_id, next)
                .await
                .map_err(StatusError::Store)?;
            tracing::info!(assembly = self.assembly_id, from = %current, to = %next, "run started");
        }
        self.written.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Move to `next`. Writing the current status again is a no-op.
    pub async fn advance(&self, next: AssemblyStatus) -> Result<(), StatusError> {
        let current = self.ensure_live().await?;
        if current == next {
            return Ok(());
        }
        if !current.can_advance_to(next) {
            return Err(StatusError::Backwards {
                id: self.assembly_id,
                from: current,
                to: next,
            });
        }
        self.store
            .set_assembly_status(self.assembly_id, next)
            .await
            .map_err(StatusError::Store)?;
        self.written.store(true, Ordering::Relaxed);
        tracing::info!(assembly = self.assembly_id, from = %current, to = %next, "status");
        Ok(())
    }

    /// Record a terminal failure status, swallowing the refusals a failed run
    /// can legitimately hit (deletion started, already terminal). A run that
    /// fails before its first write replaces the previous run's status.
    pub async fn fail(&self, status: AssemblyStatus) {
        let result = if self.written.load(Ordering::Relaxed) {
            self.advance(status).await
        } else {
            self.begin(status).await
        };
        match result {
            Ok(()) => {}
            Err(StatusError::Deleting { .. }) => {
                tracing::info!(assembly = self.assembly_id, "deletion in progress, status left alone");
            }
            Err(e) => {
                tracing::warn!(assembly = self.assembly_id, error = %e, "could not record failure status");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewAssembly, SqliteDb, StoreHandle};
    use slipway_common::Workflow;

    fn seeded() -> (StoreHandle, i64) {
        let db = SqliteDb::new_in_memory().unwrap();
        let assembly = db
            .create_assembly(&NewAssembly {
                name: "app".into(),
                plan_id: 1,
                workflow: Workflow::full(),
                tenant: "t".into(),
            })
            .unwrap();
        (StoreHandle::new(db), assembly.id)
    }

    #[tokio::test]
    async fn advance_moves_forward_only() {
        let (store, id) = seeded();
        let tracker = StatusTracker::new(&store, id);
        tracker.advance(AssemblyStatus::Building).await.unwrap();
        tracker.advance(AssemblyStatus::Building).await.unwrap();
        tracker.advance(AssemblyStatus::Built).await.unwrap();

        let err = tracker.advance(AssemblyStatus::Building).await.unwrap_err();
        assert!(matches!(err, StatusError::Backwards { .. }));

        let history = store.call(move |db| db.status_history(id)).await.unwrap();
        assert_eq!(
            history,
            vec![AssemblyStatus::Building, AssemblyStatus::Built]
        );
    }

    #[tokio::test]
    async fn deleting_is_never_overwritten() {
        let (store, id) = seeded();
        store
            .set_assembly_status(id, AssemblyStatus::Deleting)
            .await
            .unwrap();
        let tracker = StatusTracker::new(&store, id);

        let err = tracker.advance(AssemblyStatus::Built).await.unwrap_err();
        assert!(matches!(err, StatusError::Deleting { .. }));
        tracker.fail(AssemblyStatus::Error).await;
        assert_eq!(tracker.current().await.unwrap(), AssemblyStatus::Deleting);
    }

    #[tokio::test]
    async fn begin_restarts_a_settled_assembly() {
        let (store, id) = seeded();
        let tracker = StatusTracker::new(&store, id);
        tracker.advance(AssemblyStatus::DeploymentComplete).await.unwrap();
        tracker.begin(AssemblyStatus::Deploying).await.unwrap();
        assert_eq!(tracker.current().await.unwrap(), AssemblyStatus::Deploying);

        store
            .set_assembly_status(id, AssemblyStatus::Deleting)
            .await
            .unwrap();
        let err = tracker.begin(AssemblyStatus::Building).await.unwrap_err();
        assert!(matches!(err, StatusError::Deleting { .. }));
    }

    #[tokio::test]
    async fn failure_before_first_write_replaces_stale_status() {
        let (store, id) = seeded();
        store
            .set_assembly_status(id, AssemblyStatus::ErrorStackCreateFailed)
            .await
            .unwrap();

        StatusTracker::new(&store, id)
            .fail(AssemblyStatus::Error)
            .await;
        assert_eq!(
            StatusTracker::new(&store, id).current().await.unwrap(),
            AssemblyStatus::Error
        );
    }

    #[tokio::test]
    async fn failure_after_a_terminal_write_is_refused() {
        let (store, id) = seeded();
        let tracker = StatusTracker::new(&store, id);
        tracker.begin(AssemblyStatus::UnitTesting).await.unwrap();
        tracker
            .advance(AssemblyStatus::UnitTestingFailed)
            .await
            .unwrap();

        tracker.fail(AssemblyStatus::Error).await;
        assert_eq!(
            tracker.current().await.unwrap(),
            AssemblyStatus::UnitTestingFailed
        );
    }

    #[tokio::test]
    async fn missing_assembly_is_not_found() {
        let (store, _) = seeded();
        let err = StatusTracker::new(&store, 99).current().await.unwrap_err();
        assert!(matches!(err, StatusError::NotFound { id: 99 }));
    }
}

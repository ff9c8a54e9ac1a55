//! Metadata store: Assembly, Image, Component and Log rows.
//!
//! The pipeline and deployer only see the narrow [`MetadataStore`] trait. The
//! SQLite implementation in [`sqlite`] backs the CLI and the tests.

pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use slipway_common::{
    ArtifactType, Assembly, AssemblyStatus, Component, Image, ImageStatus, LogRecord,
};

pub use sqlite::{SqliteDb, StoreHandle};

#[derive(Debug, Clone)]
pub struct NewAssembly {
    pub name: String,
    pub plan_id: i64,
    pub workflow: slipway_common::Workflow,
    pub tenant: String,
}

#[derive(Debug, Clone)]
pub struct NewImage {
    pub name: String,
    pub status: ImageStatus,
    pub external_ref: Option<String>,
    pub docker_image_name: Option<String>,
    pub source_format: String,
    pub artifact_type: ArtifactType,
    pub base_image_id: Option<i64>,
    pub tenant: String,
}

/// Fields to change on an Image; `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct ImageUpdate {
    pub status: Option<ImageStatus>,
    pub external_ref: Option<String>,
    pub docker_image_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewComponent {
    pub assembly_id: i64,
    pub component_type: String,
    pub name: String,
    pub resource_uri: Option<String>,
    pub heat_stack_id: Option<String>,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_assembly(&self, id: i64) -> Result<Option<Assembly>>;
    async fn set_assembly_status(&self, id: i64, status: AssemblyStatus) -> Result<()>;
    async fn set_application_uri(&self, id: i64, uri: &str) -> Result<()>;
    async fn set_assembly_image(&self, id: i64, image_id: i64) -> Result<()>;
    async fn list_assemblies_for_plan(&self, plan_id: i64) -> Result<Vec<Assembly>>;
    async fn delete_assembly(&self, id: i64) -> Result<()>;

    async fn get_image(&self, id: i64) -> Result<Option<Image>>;
    async fn create_image(&self, new: NewImage) -> Result<Image>;
    async fn update_image(&self, id: i64, update: ImageUpdate) -> Result<()>;
    async fn delete_image(&self, id: i64) -> Result<()>;

    async fn find_component(
        &self,
        assembly_id: i64,
        component_type: &str,
    ) -> Result<Option<Component>>;
    async fn create_component(&self, new: NewComponent) -> Result<Component>;
    async fn delete_components(&self, assembly_id: i64) -> Result<()>;

    async fn add_log(&self, resource_uuid: &str, stage: &str, location: &str) -> Result<()>;
    /// Remove and return every Log row for a resource.
    async fn take_logs(&self, resource_uuid: &str) -> Result<Vec<LogRecord>>;
}

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an Assembly, from queueing through deployment.
///
/// Progress states carry an ordering ([`AssemblyStatus::rank`]) so a single
/// run can refuse to move backwards. `Deleting` is written by the destroy path
/// only and preempts every other writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssemblyStatus {
    Queued,
    UnitTesting,
    UnitTestingFailed,
    UnitTestingPassed,
    Building,
    Built,
    Deploying,
    StartingApp,
    DeploymentComplete,
    Error,
    ErrorStackCreateFailed,
    ErrorStackDeleteFailed,
    ErrorCodeDeployment,
    Deleting,
}

impl AssemblyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::UnitTesting => "UNIT_TESTING",
            Self::UnitTestingFailed => "UNIT_TESTING_FAILED",
            Self::UnitTestingPassed => "UNIT_TESTING_PASSED",
            Self::Building => "BUILDING",
            Self::Built => "BUILT",
            Self::Deploying => "DEPLOYING",
            Self::StartingApp => "STARTING_APP",
            Self::DeploymentComplete => "DEPLOYMENT_COMPLETE",
            Self::Error => "ERROR",
            Self::ErrorStackCreateFailed => "ERROR_STACK_CREATE_FAILED",
            Self::ErrorStackDeleteFailed => "ERROR_STACK_DELETE_FAILED",
            Self::ErrorCodeDeployment => "ERROR_CODE_DEPLOYMENT",
            Self::Deleting => "DELETING",
        }
    }

    /// Position in the forward-only progression. Both unit-test outcomes share
    /// a rank, and every error status outranks all progress states.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::UnitTesting => 1,
            Self::UnitTestingPassed | Self::UnitTestingFailed => 2,
            Self::Building => 3,
            Self::Built => 4,
            Self::Deploying => 5,
            Self::StartingApp => 6,
            Self::DeploymentComplete => 7,
            Self::Error
            | Self::ErrorStackCreateFailed
            | Self::ErrorStackDeleteFailed
            | Self::ErrorCodeDeployment => 8,
            Self::Deleting => 9,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::Error
                | Self::ErrorStackCreateFailed
                | Self::ErrorStackDeleteFailed
                | Self::ErrorCodeDeployment
        )
    }

    /// Statuses after which the current run makes no further progress.
    pub fn is_terminal(&self) -> bool {
        self.is_error() || matches!(self, Self::UnitTestingFailed | Self::Deleting)
    }

    /// Whether a run that last wrote `self` may write `next`.
    pub fn can_advance_to(&self, next: AssemblyStatus) -> bool {
        if *self == Self::Deleting {
            return false;
        }
        if next == Self::Deleting {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
    }

    /// Deploy or build in flight; such Assemblies are never garbage-collected.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::Queued
                | Self::UnitTesting
                | Self::UnitTestingPassed
                | Self::Building
                | Self::Deploying
                | Self::StartingApp
        )
    }
}

impl fmt::Display for AssemblyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssemblyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "UNIT_TESTING" => Ok(Self::UnitTesting),
            "UNIT_TESTING_FAILED" => Ok(Self::UnitTestingFailed),
            "UNIT_TESTING_PASSED" => Ok(Self::UnitTestingPassed),
            "BUILDING" => Ok(Self::Building),
            "BUILT" => Ok(Self::Built),
            "DEPLOYING" => Ok(Self::Deploying),
            "STARTING_APP" => Ok(Self::StartingApp),
            "DEPLOYMENT_COMPLETE" => Ok(Self::DeploymentComplete),
            "ERROR" => Ok(Self::Error),
            "ERROR_STACK_CREATE_FAILED" => Ok(Self::ErrorStackCreateFailed),
            "ERROR_STACK_DELETE_FAILED" => Ok(Self::ErrorStackDeleteFailed),
            "ERROR_CODE_DEPLOYMENT" => Ok(Self::ErrorCodeDeployment),
            "DELETING" => Ok(Self::Deleting),
            _ => Err(format!("Invalid assembly status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    Queued,
    Building,
    Ready,
    Error,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Building => "BUILDING",
            Self::Ready => "READY",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "BUILDING" => Ok(Self::Building),
            "READY" => Ok(Self::Ready),
            "ERROR" => Ok(Self::Error),
            _ => Err(format!("Invalid image status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    LanguagePack,
    Application,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LanguagePack => "language_pack",
            Self::Application => "application",
        }
    }
}

impl FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "language_pack" => Ok(Self::LanguagePack),
            "application" => Ok(Self::Application),
            _ => Err(format!("Invalid artifact type: {}", s)),
        }
    }
}

/// One step of an app's workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[serde(alias = "unit_test")]
    Unittest,
    Build,
    Deploy,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unittest => "unittest",
            Self::Build => "build",
            Self::Deploy => "deploy",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unittest" | "unit_test" => Ok(Self::Unittest),
            "build" => Ok(Self::Build),
            "deploy" => Ok(Self::Deploy),
            other => Err(format!(
                "Invalid stage '{}'. Valid values: unittest, build, deploy",
                other
            )),
        }
    }
}

/// Ordered, duplicate-free subset of {unittest, build, deploy}.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Stage>", into = "Vec<Stage>")]
pub struct Workflow(Vec<Stage>);

impl Workflow {
    pub fn new(stages: Vec<Stage>) -> Result<Self, String> {
        let mut seen = Vec::with_capacity(stages.len());
        for stage in stages {
            if seen.contains(&stage) {
                return Err(format!("Stage '{}' appears more than once", stage));
            }
            seen.push(stage);
        }
        Ok(Self(seen))
    }

    /// The full unittest → build → deploy workflow.
    pub fn full() -> Self {
        Self(vec![Stage::Unittest, Stage::Build, Stage::Deploy])
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.0.contains(&stage)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.0
    }

    /// Comma-separated form used for storage, e.g. `unittest,build`.
    pub fn to_csv(&self) -> String {
        self.0
            .iter()
            .map(Stage::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromStr for Workflow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stages = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Stage::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(stages)
    }
}

impl TryFrom<Vec<Stage>> for Workflow {
    type Error = String;

    fn try_from(stages: Vec<Stage>) -> Result<Self, Self::Error> {
        Self::new(stages)
    }
}

impl From<Workflow> for Vec<Stage> {
    fn from(workflow: Workflow) -> Self {
        workflow.0
    }
}

/// Format of the artifact the deploy target boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Docker,
    Vm,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Vm => "vm",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where built artifacts live between build and deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Swift,
    DockerRegistry,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Swift => "swift",
            Self::DockerRegistry => "docker_registry",
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assembly {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    /// Blueprint this Assembly was deployed from; twin GC groups by it.
    pub plan_id: i64,
    pub workflow: Workflow,
    pub status: AssemblyStatus,
    pub application_uri: Option<String>,
    /// Application artifact produced by the last successful build.
    pub image_id: Option<i64>,
    pub tenant: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub status: ImageStatus,
    /// Backend location: blob object name or registry reference.
    pub external_ref: Option<String>,
    pub docker_image_name: Option<String>,
    pub source_format: String,
    pub artifact_type: ArtifactType,
    pub base_image_id: Option<i64>,
    pub tenant: String,
    pub created_at: DateTime<Utc>,
}

impl Image {
    /// A language pack is usable only when READY with both references set.
    pub fn is_consumable(&self) -> bool {
        self.status == ImageStatus::Ready
            && self.external_ref.as_deref().is_some_and(|r| !r.is_empty())
            && self.docker_image_name.as_deref().is_some_and(|n| !n.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: i64,
    pub assembly_id: i64,
    pub component_type: String,
    pub name: String,
    pub resource_uri: Option<String>,
    pub heat_stack_id: Option<String>,
}

/// Component type for orchestration stacks.
pub const HEAT_STACK_COMPONENT: &str = "heat_stack";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub resource_uuid: String,
    pub stage: String,
    pub location: String,
}

use log::{debug, info};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use tokio::process::Command;

use crate::error::HarnessError;
use crate::retry::PollOutcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Restarting,
    Exited,
    /// Any other state reported by the stack, kept verbatim.
    Unknown(String),
}

impl ServiceState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "restarting" => Self::Restarting,
            "exited" => Self::Exited,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Restarting => write!(f, "restarting"),
            Self::Exited => write!(f, "exited"),
            Self::Unknown(raw) if raw.is_empty() => write!(f, "unknown"),
            Self::Unknown(raw) => write!(f, "{raw}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
}

impl ServiceStatus {
    pub fn new(name: impl Into<String>, state: ServiceState) -> Self {
        Self {
            name: name.into(),
            state,
        }
    }
}

/// The container stack backing an integration run.
#[tonic::async_trait]
pub trait ServiceStack: Send + Sync {
    async fn list_statuses(&self) -> Result<Vec<ServiceStatus>, HarnessError>;

    async fn bring_up(&self) -> Result<(), HarnessError>;

    async fn tear_down(&self) -> Result<(), HarnessError>;
}

/// Classifies one status snapshot against the services a test needs.
///
/// Any service that is neither running nor restarting is fatal: a crashed
/// container does not heal itself. Restarting services, and expected services
/// the stack has not listed yet, are worth waiting for.
pub fn classify(
    statuses: &[ServiceStatus],
    expected: &[String],
) -> PollOutcome<Vec<ServiceStatus>, HarnessError> {
    let relevant: Vec<&ServiceStatus> = statuses
        .iter()
        .filter(|status| expected.is_empty() || expected.contains(&status.name))
        .collect();

    let not_running: Vec<String> = relevant
        .iter()
        .filter(|status| !matches!(status.state, ServiceState::Running | ServiceState::Restarting))
        .map(|status| format!("{}={}", status.name, status.state))
        .collect();

    if !not_running.is_empty() {
        return PollOutcome::Fatal(HarnessError::fatal(
            "containers",
            format!("Some services are not running: {}", not_running.join(",")),
        ));
    }

    let mut pending: Vec<String> = relevant
        .iter()
        .filter(|status| status.state == ServiceState::Restarting)
        .map(|status| format!("{}=restarting", status.name))
        .collect();

    pending.extend(
        expected
            .iter()
            .filter(|name| !statuses.iter().any(|status| &status.name == *name))
            .map(|name| format!("{name}=missing")),
    );

    if !pending.is_empty() {
        return PollOutcome::retryable(format!("Waiting for services: {}", pending.join(",")));
    }

    PollOutcome::Success(relevant.into_iter().cloned().collect())
}

#[derive(Debug, Deserialize)]
struct ComposeContainer {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Service", default)]
    service: String,
    #[serde(rename = "State", default)]
    state: String,
}

/// `docker compose` driven stack.
#[derive(Debug, Clone)]
pub struct ComposeStack {
    pub compose_file: PathBuf,
    pub project_name: String,
    pub program: String,
}

impl ComposeStack {
    pub fn new(compose_file: impl Into<PathBuf>, project_name: impl Into<String>) -> Self {
        Self {
            compose_file: compose_file.into(),
            project_name: project_name.into(),
            program: "docker".to_string(),
        }
    }

    async fn compose(&self, args: &[&str]) -> Result<String, HarnessError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("compose")
            .arg("-f")
            .arg(&self.compose_file)
            .arg("-p")
            .arg(&self.project_name)
            .args(args)
            .kill_on_drop(true);

        let rendered = format!("{} compose {}", self.program, args.join(" "));
        debug!("Running {rendered}");

        let output = cmd.output().await.map_err(|e| HarnessError::Command {
            command: rendered.clone(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(HarnessError::Command {
                command: rendered,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parses `docker compose ps --format json`, which is either a JSON array or
/// one object per line depending on the compose version.
pub fn parse_compose_ps(output: &str) -> Result<Vec<ServiceStatus>, HarnessError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let containers: Vec<ComposeContainer> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?
    };

    Ok(containers
        .into_iter()
        .map(|container| {
            let name = if container.service.is_empty() {
                container.name
            } else {
                container.service
            };
            ServiceStatus::new(name, ServiceState::parse(&container.state))
        })
        .collect())
}

#[tonic::async_trait]
impl ServiceStack for ComposeStack {
    async fn list_statuses(&self) -> Result<Vec<ServiceStatus>, HarnessError> {
        let output = self.compose(&["ps", "--all", "--format", "json"]).await?;
        parse_compose_ps(&output)
    }

    async fn bring_up(&self) -> Result<(), HarnessError> {
        info!(
            "Bringing up compose project {} from {}",
            self.project_name,
            self.compose_file.display()
        );
        self.compose(&["up", "--detach"]).await.map(|_| ())
    }

    async fn tear_down(&self) -> Result<(), HarnessError> {
        info!("Tearing down compose project {}", self.project_name);
        self.compose(&["down", "--volumes"]).await.map(|_| ())
    }
}

//! Docker Engine API client (swarm mode)

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use http::StatusCode;
use reqwest::{Client, Response};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::errors::EngineError;
use crate::orchestrator::types::split_image_reference;
use crate::orchestrator::{
    Orchestrator, OrchestratorError, RegistryAuth, ServiceSpec, ServiceState,
};

/// Docker Engine API endpoint
pub struct DockerEngine {
    client: Client,
    base_url: Url,
}

impl DockerEngine {
    /// Create a client for `base_url`, e.g. `http://127.0.0.1:2375/v1.43`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EngineError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url)?,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, OrchestratorError> {
        self.base_url.join(path).map_err(|e| OrchestratorError::Rejected {
            status: 0,
            message: format!("invalid request path '{}': {}", path, e),
        })
    }

    async fn find_service(&self, name: &str) -> Result<Option<SwarmService>, OrchestratorError> {
        let mut url = self.url("services")?;
        let filters = serde_json::json!({ "name": [name] }).to_string();
        url.query_pairs_mut()
            .append_pair("filters", &filters)
            .append_pair("status", "true");
        debug!("GET {}", url);

        let response = self.client.get(url).send().await.map_err(transport_error)?;
        let services: Vec<SwarmService> = read_json(check(response, name).await?).await?;

        // The name filter matches prefixes
        Ok(services.into_iter().find(|s| s.spec.name == name))
    }

    async fn last_task_status(&self, name: &str) -> Result<Option<String>, OrchestratorError> {
        let mut url = self.url("tasks")?;
        let filters = serde_json::json!({ "service": [name] }).to_string();
        url.query_pairs_mut().append_pair("filters", &filters);
        debug!("GET {}", url);

        let response = self.client.get(url).send().await.map_err(transport_error)?;
        let tasks: Vec<SwarmTask> = read_json(check(response, name).await?).await?;

        Ok(tasks
            .into_iter()
            .filter_map(|t| Some((t.updated_at?, t.status?.state?)))
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, state)| state))
    }
}

#[async_trait]
impl Orchestrator for DockerEngine {
    async fn get_service(&self, name: &str) -> Result<Option<ServiceState>, OrchestratorError> {
        let Some(service) = self.find_service(name).await? else {
            return Ok(None);
        };

        let last_task_status = match self.last_task_status(name).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Unable to read tasks of service {}: {}", name, e);
                None
            }
        };

        let desired_replicas = service
            .spec
            .mode
            .and_then(|m| m.replicated)
            .and_then(|r| r.replicas)
            .unwrap_or(0);
        let (current_replicas, desired_from_status) = service
            .service_status
            .map(|s| (s.running_tasks, s.desired_tasks))
            .unwrap_or((0, desired_replicas));

        Ok(Some(ServiceState {
            name: service.spec.name,
            version_index: service.version.index,
            image: service
                .spec
                .task_template
                .and_then(|t| t.container_spec)
                .and_then(|c| c.image)
                .unwrap_or_default(),
            desired_replicas: desired_replicas.max(desired_from_status),
            current_replicas,
            last_task_status,
        }))
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<(), OrchestratorError> {
        let url = self.url("services/create")?;
        debug!("POST {}", url);

        let response = self
            .client
            .post(url)
            .json(&SwarmServiceSpec::from(spec))
            .send()
            .await
            .map_err(transport_error)?;
        check(response, &spec.name).await?;
        Ok(())
    }

    async fn update_service(
        &self,
        name: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> Result<(), OrchestratorError> {
        let mut url = self.url(&format!("services/{}/update", name))?;
        url.query_pairs_mut()
            .append_pair("version", &version.to_string());
        debug!("POST {}", url);

        let response = self
            .client
            .post(url)
            .json(&SwarmServiceSpec::from(spec))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check(response, name).await?;

        // Warnings come back in a 200 body
        if let Ok(body) = response.json::<UpdateResponse>().await {
            for warning in body.warnings.unwrap_or_default() {
                warn!("Service {} update warning: {}", name, warning);
            }
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, OrchestratorError> {
        let url = self.url(&format!("images/{}/json", image))?;
        debug!("GET {}", url);

        let response = self.client.get(url).send().await.map_err(transport_error)?;
        match check(response, image).await {
            Ok(_) => Ok(true),
            Err(OrchestratorError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn pull_image(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), OrchestratorError> {
        let (repository, tag) = split_image_reference(image);
        let mut url = self.url("images/create")?;
        url.query_pairs_mut()
            .append_pair("fromImage", repository)
            .append_pair("tag", tag.unwrap_or("latest"));
        debug!("POST {}", url);

        let mut request = self.client.post(url);
        if let Some(auth) = auth {
            request = request.header("X-Registry-Auth", encode_registry_auth(auth));
        }

        let response = request.send().await.map_err(transport_error)?;
        let response = match check(response, image).await {
            Err(OrchestratorError::NotFound(_)) => {
                return Err(OrchestratorError::ImageNotFound(image.to_string()))
            }
            other => other?,
        };

        // Pull progress is streamed as JSON lines; failures show up in-band
        let body = response.text().await.map_err(transport_error)?;
        match pull_stream_error(&body) {
            Some(message) => Err(classify_pull_error(image, &message)),
            None => Ok(()),
        }
    }

    async fn network_exists(&self, name: &str) -> Result<bool, OrchestratorError> {
        let url = self.url(&format!("networks/{}", name))?;
        debug!("GET {}", url);

        let response = self.client.get(url).send().await.map_err(transport_error)?;
        match check(response, name).await {
            Ok(_) => Ok(true),
            Err(OrchestratorError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_network(&self, name: &str) -> Result<(), OrchestratorError> {
        let url = self.url("networks/create")?;
        debug!("POST {}", url);

        let body = serde_json::json!({
            "Name": name,
            "Driver": "overlay",
            "Attachable": true,
            "CheckDuplicate": true,
        });
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        check(response, name).await?;
        Ok(())
    }
}

fn normalize_base_url(base_url: &str) -> Result<Url, EngineError> {
    let base_url = match base_url.strip_prefix("tcp://") {
        Some(rest) => format!("http://{}", rest),
        None => base_url.to_string(),
    };
    let mut url = Url::parse(&base_url)
        .map_err(|e| EngineError::ConfigError(format!("invalid Docker API URL '{}': {}", base_url, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn transport_error(err: reqwest::Error) -> OrchestratorError {
    OrchestratorError::Unreachable(err.to_string())
}

/// Decode a success body. A body that arrives but does not parse is the
/// API answering with something unexpected, not a connectivity problem.
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, OrchestratorError> {
    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&body).map_err(|e| OrchestratorError::Rejected {
        status,
        message: format!("malformed response: {}", e),
    })
}

/// Map a non-success response to an [`OrchestratorError`]
async fn check(response: Response, subject: &str) -> Result<Response, OrchestratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.message)
        .unwrap_or(body);

    Err(match status {
        StatusCode::NOT_FOUND => OrchestratorError::NotFound(format!("{}: {}", subject, message)),
        StatusCode::CONFLICT => OrchestratorError::Conflict(format!("{}: {}", subject, message)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            OrchestratorError::Unauthorized(format!("{}: {}", subject, message))
        }
        _ if message.contains("update out of sequence") => {
            OrchestratorError::VersionConflict(format!("{}: {}", subject, message))
        }
        _ => OrchestratorError::Rejected {
            status: status.as_u16(),
            message,
        },
    })
}

fn encode_registry_auth(auth: &RegistryAuth) -> String {
    let payload = serde_json::json!({
        "username": auth.username,
        "password": auth.password.expose_secret(),
        "serveraddress": auth.server_address,
    });
    base64::engine::general_purpose::URL_SAFE.encode(payload.to_string())
}

fn pull_stream_error(body: &str) -> Option<String> {
    body.lines()
        .filter_map(|line| serde_json::from_str::<PullProgress>(line).ok())
        .find_map(|progress| {
            progress
                .error_detail
                .and_then(|d| d.message)
                .or(progress.error)
        })
}

fn classify_pull_error(image: &str, message: &str) -> OrchestratorError {
    let lowered = message.to_lowercase();
    if ["not found", "manifest unknown", "does not exist", "pull access denied"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        OrchestratorError::ImageNotFound(format!("{}: {}", image, message))
    } else if lowered.contains("unauthorized") {
        OrchestratorError::Unauthorized(format!("{}: {}", image, message))
    } else {
        OrchestratorError::RegistryUnreachable(format!("{}: {}", image, message))
    }
}

// ============================== WIRE FORMAT ================================ //

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UpdateResponse {
    warnings: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullProgress {
    error: Option<String>,
    error_detail: Option<PullErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct PullErrorDetail {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmService {
    version: ObjectVersion,
    spec: SwarmServiceSpecView,
    service_status: Option<SwarmServiceStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ObjectVersion {
    index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmServiceSpecView {
    name: String,
    mode: Option<ModeView>,
    task_template: Option<TaskTemplateView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ModeView {
    replicated: Option<ReplicatedView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReplicatedView {
    replicas: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TaskTemplateView {
    container_spec: Option<ContainerSpecView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSpecView {
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmServiceStatus {
    running_tasks: u64,
    desired_tasks: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmTask {
    updated_at: Option<String>,
    status: Option<SwarmTaskStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmTaskStatus {
    state: Option<String>,
}

/// Create/update payload; every field is always sent
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmServiceSpec<'a> {
    name: &'a str,
    labels: BTreeMap<&'static str, &'a str>,
    task_template: TaskTemplate<'a>,
    mode: Mode,
    endpoint_spec: EndpointSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TaskTemplate<'a> {
    container_spec: ContainerSpec<'a>,
    networks: Vec<NetworkAttachment<'a>>,
    placement: Placement<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSpec<'a> {
    image: &'a str,
    env: &'a [String],
    mounts: Vec<MountSpec<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct MountSpec<'a> {
    #[serde(rename = "Type")]
    mount_type: &'static str,
    source: &'a str,
    target: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkAttachment<'a> {
    target: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Placement<'a> {
    constraints: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Mode {
    replicated: Replicated,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Replicated {
    replicas: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointSpec {
    ports: Vec<PortConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PortConfig {
    protocol: &'static str,
    target_port: u16,
    published_port: u16,
    publish_mode: &'static str,
}

impl<'a> From<&'a ServiceSpec> for SwarmServiceSpec<'a> {
    fn from(spec: &'a ServiceSpec) -> Self {
        Self {
            name: &spec.name,
            labels: BTreeMap::from([("dev.empaas.managed", "true")]),
            task_template: TaskTemplate {
                container_spec: ContainerSpec {
                    image: &spec.image,
                    env: &spec.environment_variables,
                    mounts: spec
                        .mounts
                        .iter()
                        .map(|m| MountSpec {
                            mount_type: m.mount_type.as_str(),
                            source: &m.source,
                            target: &m.target,
                        })
                        .collect(),
                },
                networks: spec
                    .networks
                    .iter()
                    .map(|n| NetworkAttachment { target: n })
                    .collect(),
                placement: Placement {
                    constraints: spec.placement_constraints.iter().map(String::as_str).collect(),
                },
            },
            mode: Mode {
                replicated: Replicated {
                    replicas: spec.replicas,
                },
            },
            endpoint_spec: EndpointSpec {
                ports: spec
                    .published_ports
                    .iter()
                    .map(|p| PortConfig {
                        protocol: p.protocol.as_str(),
                        target_port: p.target,
                        published_port: p.published,
                        publish_mode: p.mode.as_str(),
                    })
                    .collect(),
            },
        }
    }
}

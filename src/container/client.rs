// src/container/client.rs

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::container::{ContainerError, ObservedState};

/// Label carrying the service name on every managed container
pub const SERVICE_LABEL: &str = "morio.service";

/// What the engine reports about a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Engine container id
    pub id: String,
    /// Container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Engine state
    pub state: ObservedState,

    /// Value of the service label, for managed containers
    pub service: Option<String>,
}

/// Everything needed to create a managed container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Hostname inside the container network
    pub hostname: String,
    /// Network to attach to
    pub network: String,
    /// Container labels
    pub labels: BTreeMap<String, String>,

    /// Host paths mounted into the container, as `host:container[:mode]`
    pub binds: Vec<String>,
}

/// Container engine operations the lifecycle controller relies on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Looks a container up by name; `None` when it does not exist
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, ContainerError>;

    /// Every container carrying the service label
    async fn list_managed(&self) -> Result<Vec<ContainerInfo>, ContainerError>;

    /// Pulls an image
    async fn pull(&self, image: &str) -> Result<(), ContainerError>;

    /// Creates a container, returning its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError>;

    /// Starts a created or stopped container
    async fn start(&self, id: &str) -> Result<(), ContainerError>;

    /// Stops a container gracefully
    async fn stop(&self, id: &str) -> Result<(), ContainerError>;

    /// Freezes a running container
    async fn pause(&self, id: &str) -> Result<(), ContainerError>;

    /// Resumes a paused container
    async fn unpause(&self, id: &str) -> Result<(), ContainerError>;

    /// Kills a container
    async fn kill(&self, id: &str) -> Result<(), ContainerError>;
}

/// Client for the Docker Engine HTTP API
pub struct DockerEngineClient {
    client: Client<HttpConnector>,
    base_url: String,
    timeout: Duration,
}

impl DockerEngineClient {
    /// `base_url` is the engine's TCP endpoint, `api_version` the path
    /// prefix such as `v1.43`
    pub fn new(base_url: &str, api_version: &str, timeout: Duration) -> Result<Self, ContainerError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| ContainerError::EngineError(format!("invalid engine URL {}: {}", base_url, e)))?;
        if parsed.scheme() != "http" {
            return Err(ContainerError::EngineError(format!(
                "unsupported engine scheme {}",
                parsed.scheme()
            )));
        }

        Ok(Self {
            client: Client::new(),
            base_url: format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                api_version.trim_matches('/')
            ),
            timeout,
        })
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<(StatusCode, Vec<u8>), ContainerError> {
        let uri = format!("{}{}", self.base_url, path);
        let builder = Request::builder().method(method.clone()).uri(&uri);
        let request = match body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .map_err(|e| ContainerError::EngineError(e.to_string()))?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| ContainerError::EngineError(e.to_string()))?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body())
                .await
                .map_err(|e| ContainerError::EngineError(e.to_string()))?;
            Ok::<_, ContainerError>((status, bytes.to_vec()))
        };

        let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ContainerError::Timeout)??;

        debug!("{} {} -> {}", method, uri, status);
        Ok((status, bytes))
    }

    /// Runs a lifecycle action. `304 Not Modified` means the container is
    /// already in the requested state.
    async fn action(&self, id: &str, action: &str) -> Result<(), ContainerError> {
        let (status, body) = self
            .call(Method::POST, &format!("/containers/{}/{}", id, action), None)
            .await?;

        match status {
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED | StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(ContainerError::NotFound(id.to_string())),
            status => Err(Self::failure(status, &body)),
        }
    }

    /// Server errors are worth retrying, client errors are not
    fn failure(status: StatusCode, body: &[u8]) -> ContainerError {
        let message = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());

        if status.is_server_error() {
            ContainerError::EngineError(format!("{}: {}", status, message))
        } else {
            ContainerError::Rejected {
                status: status.as_u16(),
                message,
            }
        }
    }

    /// Splits `repo:tag`, leaving registry ports alone
    fn split_image(image: &str) -> (&str, &str) {
        match image.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, tag),
            _ => (image, "latest"),
        }
    }

    fn parse_inspect(value: &Value) -> ContainerInfo {
        let text = |v: Option<&Value>| v.and_then(Value::as_str).unwrap_or_default().to_string();
        let state = value.pointer("/State/Status").and_then(Value::as_str).unwrap_or_default();

        ContainerInfo {
            id: text(value.get("Id")),
            name: text(value.get("Name")).trim_start_matches('/').to_string(),
            image: text(value.pointer("/Config/Image")),
            state: ObservedState::from_engine(state),
            service: value
                .pointer("/Config/Labels")
                .and_then(|labels| labels.get(SERVICE_LABEL))
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    fn parse_listed(value: &Value) -> ContainerInfo {
        let text = |v: Option<&Value>| v.and_then(Value::as_str).unwrap_or_default().to_string();

        ContainerInfo {
            id: text(value.get("Id")),
            name: value
                .get("Names")
                .and_then(Value::as_array)
                .and_then(|names| names.first())
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            image: text(value.get("Image")),
            state: ObservedState::from_engine(value.get("State").and_then(Value::as_str).unwrap_or_default()),
            service: value
                .get("Labels")
                .and_then(|labels| labels.get(SERVICE_LABEL))
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

#[async_trait]
impl EngineClient for DockerEngineClient {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, ContainerError> {
        let (status, body) = self
            .call(Method::GET, &format!("/containers/{}/json", name), None)
            .await?;

        match status {
            StatusCode::OK => {
                let value: Value = serde_json::from_slice(&body)
                    .map_err(|e| ContainerError::EngineError(format!("unreadable inspect response: {}", e)))?;
                Ok(Some(Self::parse_inspect(&value)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(Self::failure(status, &body)),
        }
    }

    async fn list_managed(&self) -> Result<Vec<ContainerInfo>, ContainerError> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("all", "true")
            .append_pair("filters", &json!({ "label": [SERVICE_LABEL] }).to_string())
            .finish();
        let (status, body) = self
            .call(Method::GET, &format!("/containers/json?{}", query), None)
            .await?;

        if status != StatusCode::OK {
            return Err(Self::failure(status, &body));
        }

        let listed: Vec<Value> = serde_json::from_slice(&body)
            .map_err(|e| ContainerError::EngineError(format!("unreadable container list: {}", e)))?;
        Ok(listed.iter().map(Self::parse_listed).collect())
    }

    async fn pull(&self, image: &str) -> Result<(), ContainerError> {
        let (repo, tag) = Self::split_image(image);
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("fromImage", repo)
            .append_pair("tag", tag)
            .finish();
        let (status, body) = self
            .call(Method::POST, &format!("/images/create?{}", query), None)
            .await?;

        match status {
            StatusCode::OK => Ok(()),
            status => Err(Self::failure(status, &body)),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("name", &spec.name)
            .finish();
        let body = json!({
            "Image": spec.image,
            "Hostname": spec.hostname,
            "Labels": spec.labels,
            "HostConfig": {
                "NetworkMode": spec.network,
                "Binds": spec.binds,
                "RestartPolicy": { "Name": "unless-stopped" },
            },
        });

        let (status, response) = self
            .call(Method::POST, &format!("/containers/create?{}", query), Some(body))
            .await?;

        match status {
            StatusCode::CREATED => {
                let value: Value = serde_json::from_slice(&response)
                    .map_err(|e| ContainerError::EngineError(format!("unreadable create response: {}", e)))?;
                value
                    .get("Id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ContainerError::EngineError("create response without an id".to_string()))
            }
            status => Err(Self::failure(status, &response)),
        }
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        self.action(id, "start").await
    }

    async fn stop(&self, id: &str) -> Result<(), ContainerError> {
        self.action(id, "stop").await
    }

    async fn pause(&self, id: &str) -> Result<(), ContainerError> {
        self.action(id, "pause").await
    }

    async fn unpause(&self, id: &str) -> Result<(), ContainerError> {
        self.action(id, "unpause").await
    }

    async fn kill(&self, id: &str) -> Result<(), ContainerError> {
        self.action(id, "kill").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> DockerEngineClient {
        DockerEngineClient::new(&server.uri(), "v1.43", Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn not_modified_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.43/containers/abc/start"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        client(&server).start("abc").await.unwrap();
    }

    #[tokio::test]
    async fn missing_containers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.43/containers/db/json"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "message": "No such container: db" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.43/containers/db/stop"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client(&server);
        assert_eq!(client.inspect("db").await.unwrap(), None);
        assert!(matches!(client.stop("db").await, Err(ContainerError::NotFound(_))));
    }

    #[tokio::test]
    async fn inspect_reads_state_and_label() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.43/containers/broker/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Id": "f00d",
                "Name": "/broker",
                "State": { "Status": "paused", "Running": true, "Paused": true },
                "Config": { "Image": "redpanda:v23", "Labels": { "morio.service": "broker" } }
            })))
            .mount(&server)
            .await;

        let info = client(&server).inspect("broker").await.unwrap().unwrap();
        assert_eq!(info.id, "f00d");
        assert_eq!(info.name, "broker");
        assert_eq!(info.state, ObservedState::Paused);
        assert_eq!(info.service.as_deref(), Some("broker"));
    }

    #[tokio::test]
    async fn create_sends_labels_and_returns_the_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.43/containers/create"))
            .and(query_param("name", "api"))
            .and(body_partial_json(json!({
                "Image": "morio/api:0.1.0",
                "Labels": { "morio.service": "api" },
                "HostConfig": { "NetworkMode": "morionet" }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "Id": "c0ffee", "Warnings": [] })))
            .mount(&server)
            .await;

        let spec = ContainerSpec {
            name: "api".to_string(),
            image: "morio/api:0.1.0".to_string(),
            hostname: "api".to_string(),
            network: "morionet".to_string(),
            labels: BTreeMap::from([(SERVICE_LABEL.to_string(), "api".to_string())]),
            binds: vec![],
        };
        assert_eq!(client(&server).create(&spec).await.unwrap(), "c0ffee");
    }

    #[tokio::test]
    async fn server_errors_are_transient_client_errors_are_not() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.43/containers/a/pause"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "message": "boom" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.43/containers/b/pause"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "message": "is not running" })))
            .mount(&server)
            .await;

        let client = client(&server);
        let err = client.pause("a").await.unwrap_err();
        assert!(err.is_transient());
        let err = client.pause("b").await.unwrap_err();
        assert!(matches!(err, ContainerError::Rejected { status: 409, .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn image_references() {
        assert_eq!(DockerEngineClient::split_image("traefik:2.10.7"), ("traefik", "2.10.7"));
        assert_eq!(
            DockerEngineClient::split_image("registry.local:5000/morio/api"),
            ("registry.local:5000/morio/api", "latest")
        );
    }
}

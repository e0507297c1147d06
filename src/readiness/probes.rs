use log::debug;
use std::time::Duration;
use tonic::transport::Endpoint;
use tonic::Code;

use crate::error::HarnessError;
use crate::proto::gateway::node_client::NodeClient;
use crate::proto::gateway::StatusRequest;
use crate::retry::PollOutcome;

/// A single network-reachable liveness check.
#[tonic::async_trait]
pub trait LivenessProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> PollOutcome<(), HarnessError>;
}

/// HTTP liveness endpoint, e.g. the node's `/is_alive`.
pub struct HttpLivenessProbe {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpLivenessProbe {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, HarnessError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| HarnessError::fatal("http client", e.to_string()))?;

        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
        })
    }

    /// Probe for a node exposing `<base>/is_alive`.
    pub fn node(base_url: &str, request_timeout: Duration) -> Result<Self, HarnessError> {
        let url = format!("{}/is_alive", base_url.trim_end_matches('/'));
        Self::new("node", url, request_timeout)
    }

    /// Probe for a GraphQL endpoint answering a `{__typename}` query.
    pub fn graphql(base_url: &str, request_timeout: Duration) -> Result<Self, HarnessError> {
        let url = format!(
            "{}/graphql?query=%7B__typename%7D",
            base_url.trim_end_matches('/')
        );
        Self::new("graphql", url, request_timeout)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Maps an HTTP status to a poll outcome: server errors are treated as a
/// service still warming up, client errors mean the endpoint is wrong.
pub fn classify_http_status(name: &str, status: u16) -> PollOutcome<(), HarnessError> {
    match status {
        200..=299 => PollOutcome::Success(()),
        500..=599 => PollOutcome::retryable(format!("HTTP {status}")),
        _ => PollOutcome::Fatal(HarnessError::fatal(
            name,
            format!("unexpected HTTP status {status}"),
        )),
    }
}

#[tonic::async_trait]
impl LivenessProbe for HttpLivenessProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> PollOutcome<(), HarnessError> {
        match self.client.get(&self.url).send().await {
            Ok(response) => classify_http_status(&self.name, response.status().as_u16()),
            Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                debug!("{} not reachable at {}: {e}", self.name, self.url);
                PollOutcome::retryable(format!("connection failed: {e}"))
            }
            Err(e) => PollOutcome::Fatal(HarnessError::fatal(&self.name, e.to_string())),
        }
    }
}

/// Calls the gateway's `Node.Status` RPC.
pub struct GatewayStatusProbe {
    endpoint: String,
    request_timeout: Duration,
}

impl GatewayStatusProbe {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            request_timeout,
        }
    }
}

/// Transport-level gRPC codes are transient, anything else is a broken
/// gateway.
pub fn is_transient_grpc_code(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable | Code::DeadlineExceeded | Code::Unknown | Code::ResourceExhausted
    )
}

#[tonic::async_trait]
impl LivenessProbe for GatewayStatusProbe {
    fn name(&self) -> &str {
        "gateway"
    }

    async fn check(&self) -> PollOutcome<(), HarnessError> {
        let endpoint = match Endpoint::from_shared(self.endpoint.clone()) {
            Ok(endpoint) => endpoint
                .connect_timeout(self.request_timeout)
                .timeout(self.request_timeout),
            Err(e) => {
                return PollOutcome::Fatal(HarnessError::fatal(
                    "gateway",
                    format!("invalid endpoint {}: {e}", self.endpoint),
                ))
            }
        };

        let channel = match endpoint.connect().await {
            Ok(channel) => channel,
            Err(e) => return PollOutcome::retryable(format!("connection failed: {e}")),
        };

        match NodeClient::new(channel).status(StatusRequest {}).await {
            Ok(response) => {
                let status = response.into_inner();
                debug!(
                    "Gateway at {} is up, head block {}",
                    self.endpoint, status.head_block
                );
                PollOutcome::Success(())
            }
            Err(status) if is_transient_grpc_code(status.code()) => {
                PollOutcome::retryable(format!("status RPC failed: {status}"))
            }
            Err(status) => PollOutcome::Fatal(HarnessError::fatal(
                "gateway",
                format!("unexpected status RPC response: {status}"),
            )),
        }
    }
}

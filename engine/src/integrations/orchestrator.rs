// External workflow orchestrator HTTP client
//
// The orchestrator exposes workflows as {nodes, connections} documents and
// executions polled by id. Authentication is an API-key header pair when
// configured, with HTTP basic auth as the fallback.

use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

use crate::config::OrchestratorConfig;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("orchestrator returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("workflow '{0}' was rejected by every execution endpoint")]
    ExecuteFailed(String),
    #[error("orchestrator response missing execution id")]
    MalformedExecution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalNode {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub position: [f64; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalConnection {
    pub node: String,
    #[serde(rename = "type", default = "main_kind")]
    pub kind: String,
    #[serde(default)]
    pub index: u32,
}

fn main_kind() -> String {
    "main".to_string()
}

/// Outgoing connection groups of one node, addressed by node name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalConnections {
    #[serde(default)]
    pub main: Vec<Vec<ExternalConnection>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalWorkflow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub nodes: Vec<ExternalNode>,
    #[serde(default)]
    pub connections: HashMap<String, ExternalConnections>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ExternalExecution {
    pub id: String,
    pub status: Option<String>,
    pub finished: bool,
    pub data: Option<Value>,
}

#[derive(Debug, Clone)]
enum Auth {
    ApiKey { header: String, key: String },
    Basic { username: String, password: Option<String> },
    None,
}

#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    http: Client,
    base_url: String,
    auth: Auth,
}

impl OrchestratorClient {
    pub fn new(config: &OrchestratorConfig) -> Self {
        let auth = match (&config.api_key_header, &config.api_key) {
            (Some(header), Some(key)) => Auth::ApiKey {
                header: header.clone(),
                key: key.clone(),
            },
            _ => match &config.basic_username {
                Some(username) => Auth::Basic {
                    username: username.clone(),
                    password: config.basic_password.clone(),
                },
                None => Auth::None,
            },
        };

        Self {
            http: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.http.request(method, url);
        match &self.auth {
            Auth::ApiKey { header, key } => builder.header(header, key),
            Auth::Basic { username, password } => builder.basic_auth(username, password.as_deref()),
            Auth::None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Value, OrchestratorError> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(OrchestratorError::Api { status: status.as_u16(), body });
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }

    pub async fn list_workflows(&self) -> Result<Vec<ExternalWorkflow>, OrchestratorError> {
        let body = self.send(self.request(Method::GET, "/workflows")).await?;
        let items = unwrap_data(body);
        let workflows = serde_json::from_value(items).unwrap_or_default();
        Ok(workflows)
    }

    pub async fn get_workflow(&self, id: &str) -> Result<ExternalWorkflow, OrchestratorError> {
        let body = self
            .send(self.request(Method::GET, &format!("/workflows/{}", id)))
            .await?;
        serde_json::from_value(unwrap_data(body)).map_err(|_| OrchestratorError::Api {
            status: 200,
            body: "unparseable workflow document".to_string(),
        })
    }

    pub async fn create_workflow(
        &self,
        workflow: &ExternalWorkflow,
    ) -> Result<ExternalWorkflow, OrchestratorError> {
        let body = self
            .send(self.request(Method::POST, "/workflows").json(workflow))
            .await?;
        serde_json::from_value(unwrap_data(body)).map_err(|_| OrchestratorError::Api {
            status: 200,
            body: "unparseable workflow document".to_string(),
        })
    }

    pub async fn update_workflow(
        &self,
        id: &str,
        workflow: &ExternalWorkflow,
    ) -> Result<(), OrchestratorError> {
        self.send(
            self.request(Method::PUT, &format!("/workflows/{}", id))
                .json(workflow),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_workflow(&self, id: &str) -> Result<(), OrchestratorError> {
        self.send(self.request(Method::DELETE, &format!("/workflows/{}", id)))
            .await?;
        Ok(())
    }

    pub async fn set_active(&self, id: &str, active: bool) -> Result<(), OrchestratorError> {
        let verb = if active { "activate" } else { "deactivate" };
        self.send(self.request(Method::POST, &format!("/workflows/{}/{}", id, verb)))
            .await?;
        Ok(())
    }

    /// Trigger a workflow execution. Orchestrator deployments differ in the
    /// endpoint they expose, so the shapes are tried in order until one
    /// accepts the request.
    pub async fn execute_workflow(
        &self,
        id: &str,
        payload: &Value,
    ) -> Result<ExternalExecution, OrchestratorError> {
        let attempts: [(Method, String, Value); 3] = [
            (Method::POST, format!("/workflows/{}/run", id), json!({ "data": payload })),
            (Method::POST, format!("/workflows/{}/execute", id), json!({ "data": payload })),
            (
                Method::POST,
                "/executions".to_string(),
                json!({ "workflowId": id, "data": payload }),
            ),
        ];

        for (method, path, body) in attempts {
            match self.send(self.request(method, &path).json(&body)).await {
                Ok(response) => return parse_execution(&response),
                Err(OrchestratorError::Api { status, .. }) if status == 404 || status == 405 => {
                    warn!("Execution endpoint {} not available, trying next shape", path);
                }
                Err(e) => return Err(e),
            }
        }

        Err(OrchestratorError::ExecuteFailed(id.to_string()))
    }

    pub async fn get_execution(&self, id: &str) -> Result<ExternalExecution, OrchestratorError> {
        let body = self
            .send(self.request(Method::GET, &format!("/executions/{}", id)))
            .await?;
        parse_execution(&body)
    }
}

fn unwrap_data(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("data") => map.remove("data").unwrap_or(Value::Null),
        other => other,
    }
}

/// Execution documents vary across orchestrator versions; accept the common
/// envelope and id field spellings.
fn parse_execution(value: &Value) -> Result<ExternalExecution, OrchestratorError> {
    let body = value.get("data").unwrap_or(value);

    let id = body
        .get("executionId")
        .or_else(|| body.get("id"))
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or(OrchestratorError::MalformedExecution)?;

    Ok(ExternalExecution {
        id,
        status: body.get("status").and_then(|v| v.as_str()).map(String::from),
        finished: body.get("finished").and_then(|v| v.as_bool()).unwrap_or(false),
        data: body.get("data").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> OrchestratorConfig {
        OrchestratorConfig {
            base_url: base_url.to_string(),
            api_key_header: Some("X-Api-Key".to_string()),
            api_key: Some("secret".to_string()),
            basic_username: None,
            basic_password: None,
            poll_interval_secs: 5,
            execution_timeout_secs: 1800,
        }
    }

    #[tokio::test]
    async fn test_create_workflow_sends_api_key_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workflows"))
            .and(header("X-Api-Key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"id": "wf-1", "name": "Test", "active": false, "nodes": [], "connections": {}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OrchestratorClient::new(&config(&server.uri()));
        let workflow = ExternalWorkflow {
            id: None,
            name: "Test".to_string(),
            active: false,
            nodes: vec![],
            connections: HashMap::new(),
            settings: None,
        };

        let created = client.create_workflow(&workflow).await.unwrap();
        assert_eq!(created.id.as_deref(), Some("wf-1"));
    }

    #[tokio::test]
    async fn test_execute_falls_back_through_endpoint_shapes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workflows/wf-1/run"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/workflows/wf-1/execute"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "executionId": "ex-9" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = OrchestratorClient::new(&config(&server.uri()));
        let execution = client
            .execute_workflow("wf-1", &serde_json::json!({"priority": "high"}))
            .await
            .unwrap();
        assert_eq!(execution.id, "ex-9");
    }

    #[tokio::test]
    async fn test_execute_non_fallback_error_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workflows/wf-1/run"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = OrchestratorClient::new(&config(&server.uri()));
        let err = client
            .execute_workflow("wf-1", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Api { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_get_execution_parses_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/executions/ex-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"id": "ex-9", "status": "success", "finished": true}
            })))
            .mount(&server)
            .await;

        let client = OrchestratorClient::new(&config(&server.uri()));
        let execution = client.get_execution("ex-9").await.unwrap();
        assert_eq!(execution.status.as_deref(), Some("success"));
        assert!(execution.finished);
    }

    #[tokio::test]
    async fn test_list_workflows_accepts_bare_and_enveloped_arrays() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/workflows"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "wf-1", "name": "A", "active": true, "nodes": [], "connections": {}}]
            })))
            .mount(&server)
            .await;

        let client = OrchestratorClient::new(&config(&server.uri()));
        let workflows = client.list_workflows().await.unwrap();
        assert_eq!(workflows.len(), 1);
        assert_eq!(workflows[0].name, "A");
    }
}

// AI analysis service contract
//
// The engine only defines the request/response contract; the analysis
// backend lives elsewhere in the platform and may be absent entirely in a
// deployment. Every step that consumes this service declares an explicit
// no-collaborator fallback path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("AI service unavailable: {0}")]
    Unavailable(String),
    #[error("AI provider error: {0}")]
    Provider(String),
}

/// Result of content analysis
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiAnalysis {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiReply {
    pub content: String,
    pub confidence: f64,
}

#[async_trait]
pub trait AiService: Send + Sync {
    /// Analyze content for the requested analysis types
    /// (intent / sentiment / urgency / summary)
    async fn analyze(
        &self,
        content: &str,
        context: &Value,
        analysis_types: &[String],
    ) -> Result<AiAnalysis, AiError>;

    /// Draft an automatic reply for the given content
    async fn generate_auto_reply(&self, content: &str, context: &Value) -> Result<AiReply, AiError>;

    /// Invoke a named tool with structured arguments
    async fn call_tool(&self, tool: &str, arguments: &Value) -> Result<Value, AiError>;
}

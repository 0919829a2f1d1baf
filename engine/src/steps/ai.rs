// AI-assisted decisioning steps
//
// All five kinds depend on an optional AI collaborator. Deployments without
// one degrade gracefully: the step returns its "unavailable" output path
// instead of failing the run. Collaborator errors are likewise fail-soft and
// route through an "error" path with a fallback flag.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use super::{StepContext, StepError, StepExecutor, StepKind, StepOutcome};
use crate::automation::conditions::{evaluate, ConditionNode, FailurePolicy};
use crate::flows::model::FlowNode;
use crate::services::{AiAnalysis, AiService};

/// Terms the guardrail's basic content check rejects
const BLOCKED_TERMS: &[&str] = &["damn", "hell", "stupid", "idiot", "shut up"];

pub struct AiSteps {
    ai: Option<Arc<dyn AiService>>,
}

impl AiSteps {
    pub fn new(ai: Option<Arc<dyn AiService>>) -> Self {
        Self { ai }
    }

    fn unavailable() -> StepOutcome {
        StepOutcome::routed(json!({ "available": false }), "unavailable")
    }

    fn fallback(error: impl std::fmt::Display) -> StepOutcome {
        StepOutcome::routed(
            json!({ "error": error.to_string(), "fallback": true }),
            "error",
        )
    }

    fn content_for(config: &Value, ctx: &StepContext) -> String {
        if let Some(content) = config["content"].as_str() {
            return content.to_string();
        }
        for field in ["content", "message", "body", "subject"] {
            if let Some(value) = ctx.lookup(field).and_then(|v| v.as_str().map(String::from)) {
                return value;
            }
        }
        String::new()
    }

    fn store_analysis(ctx: &mut StepContext, analysis: &AiAnalysis) {
        if let Some(intent) = &analysis.intent {
            ctx.set_var("aiIntent", json!(intent));
        }
        if let Some(sentiment) = &analysis.sentiment {
            ctx.set_var("aiSentiment", json!(sentiment));
        }
        if let Some(urgency) = &analysis.urgency {
            ctx.set_var("aiUrgency", json!(urgency));
        }
        ctx.set_var("aiConfidence", json!(analysis.confidence));
    }

    async fn execute_decision(&self, node: &FlowNode, ctx: &mut StepContext) -> StepOutcome {
        let Some(ai) = &self.ai else {
            return Self::unavailable();
        };

        let config = ctx.render_config(&node.config);
        let content = Self::content_for(&config, ctx);
        let analysis_types: Vec<String> = config["analysisTypes"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_else(|| {
                vec!["intent".to_string(), "sentiment".to_string(), "urgency".to_string()]
            });

        let analysis = match ai.analyze(&content, &ctx.input, &analysis_types).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("AI decision failed for node {}: {}", node.key, e);
                return Self::fallback(e);
            }
        };

        Self::store_analysis(ctx, &analysis);

        let path = custom_route(&config, &analysis).unwrap_or_else(|| decision_path(&analysis));
        StepOutcome::routed(
            json!({
                "intent": analysis.intent,
                "sentiment": analysis.sentiment,
                "urgency": analysis.urgency,
                "confidence": analysis.confidence
            }),
            &path,
        )
    }

    async fn execute_route(&self, node: &FlowNode, ctx: &mut StepContext) -> StepOutcome {
        let Some(ai) = &self.ai else {
            return Self::unavailable();
        };

        let config = ctx.render_config(&node.config);
        let content = Self::content_for(&config, ctx);

        let analysis = match ai.analyze(&content, &ctx.input, &["intent".to_string()]).await {
            Ok(analysis) => analysis,
            Err(e) => return Self::fallback(e),
        };

        Self::store_analysis(ctx, &analysis);

        let path = analysis
            .intent
            .as_deref()
            .and_then(|intent| config["routes"][intent].as_str())
            .unwrap_or("default")
            .to_string();

        StepOutcome::routed(
            json!({ "intent": analysis.intent, "confidence": analysis.confidence }),
            &path,
        )
    }

    async fn execute_agent(&self, node: &FlowNode, ctx: &mut StepContext) -> StepOutcome {
        let Some(ai) = &self.ai else {
            return Self::unavailable();
        };

        let config = ctx.render_config(&node.config);
        let content = Self::content_for(&config, ctx);

        match ai.generate_auto_reply(&content, &ctx.input).await {
            Ok(reply) => {
                ctx.set_var("aiDraft", json!(reply.content));
                ctx.set_var("aiConfidence", json!(reply.confidence));
                StepOutcome::routed(
                    json!({ "draft": reply.content, "confidence": reply.confidence }),
                    "drafted",
                )
            }
            Err(e) => Self::fallback(e),
        }
    }

    /// Purely local: gates a drafted send on confidence floor, channel
    /// allow-list and a basic content check. Works without the collaborator.
    fn execute_guardrail(&self, node: &FlowNode, ctx: &mut StepContext) -> StepOutcome {
        let config = &node.config;

        let min_confidence = config["minConfidence"]
            .as_f64()
            .or_else(|| config["min_confidence"].as_f64())
            .unwrap_or(0.0);
        let confidence = ctx.var_f64("aiConfidence");

        if min_confidence > 0.0 && confidence.unwrap_or(0.0) < min_confidence {
            return blocked("low_confidence");
        }

        if let Some(channels) = config["allowedChannels"].as_array() {
            let channel = ctx.channel.clone().unwrap_or_default();
            let allowed = channels
                .iter()
                .filter_map(|v| v.as_str())
                .any(|c| c.eq_ignore_ascii_case(&channel));
            if !allowed {
                return blocked("channel_not_allowed");
            }
        }

        let draft = ctx.var_str("aiDraft").unwrap_or_default().to_lowercase();
        let extra_terms: Vec<String> = config["blockedTerms"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_lowercase)).collect())
            .unwrap_or_default();
        let flagged = BLOCKED_TERMS
            .iter()
            .map(|t| t.to_string())
            .chain(extra_terms)
            .find(|term| draft.contains(term.as_str()));
        if flagged.is_some() {
            return blocked("content_blocked");
        }

        StepOutcome::routed(json!({ "outputPath": "allowed" }), "allowed")
    }

    async fn execute_tool_call(&self, node: &FlowNode, ctx: &mut StepContext) -> StepOutcome {
        let Some(ai) = &self.ai else {
            return Self::unavailable();
        };

        let config = ctx.render_config(&node.config);
        let Some(tool) = config["tool"].as_str() else {
            return Self::fallback("missing tool name");
        };
        let arguments = config.get("arguments").cloned().unwrap_or(json!({}));

        match ai.call_tool(tool, &arguments).await {
            Ok(result) => {
                ctx.set_var("aiToolResult", result.clone());
                StepOutcome::routed(json!({ "tool": tool, "result": result }), "success")
            }
            Err(e) => Self::fallback(e),
        }
    }
}

fn blocked(reason: &str) -> StepOutcome {
    StepOutcome::routed(json!({ "outputPath": "blocked", "reason": reason }), "blocked")
}

/// Custom routing rules, when configured, pick the output path before the
/// built-in heuristic runs. Shape: `[{"path": ..., "when": <condition tree>}]`
/// evaluated against the analysis results.
fn custom_route(config: &Value, analysis: &AiAnalysis) -> Option<String> {
    let rules = config["routingRules"].as_array()?;
    let payload = json!({
        "intent": analysis.intent,
        "sentiment": analysis.sentiment,
        "urgency": analysis.urgency,
        "confidence": analysis.confidence
    });

    for rule in rules {
        let path = rule["path"].as_str()?;
        let Ok(tree) = serde_json::from_value::<ConditionNode>(rule["when"].clone()) else {
            continue;
        };
        if evaluate(&tree, &payload, FailurePolicy::Closed) {
            return Some(path.to_string());
        }
    }
    None
}

/// The fixed decision heuristic: urgency first, then sentiment, then
/// intent-keyword buckets, else neutral.
fn decision_path(analysis: &AiAnalysis) -> String {
    let sentiment = analysis.sentiment.as_deref().unwrap_or("");
    let urgency = analysis.urgency.as_deref().unwrap_or("");

    if matches!(urgency, "critical" | "high") {
        return if sentiment == "negative" {
            "urgent_negative".to_string()
        } else {
            "urgent".to_string()
        };
    }
    if sentiment == "negative" {
        return "negative".to_string();
    }
    if sentiment == "positive" {
        return "positive".to_string();
    }

    let intent = analysis.intent.as_deref().unwrap_or("").to_lowercase();
    for bucket in ["complaint", "question", "request"] {
        if intent.contains(bucket) {
            return bucket.to_string();
        }
    }

    "neutral".to_string()
}

#[async_trait]
impl StepExecutor for AiSteps {
    fn can_handle(&self, kind: &StepKind) -> bool {
        matches!(
            kind,
            StepKind::AiDecision
                | StepKind::AiRoute
                | StepKind::AiAgent
                | StepKind::AiGuardrail
                | StepKind::AiToolCall
        )
    }

    async fn execute(&self, node: &FlowNode, ctx: &mut StepContext) -> Result<StepOutcome, StepError> {
        let outcome = match node.kind {
            StepKind::AiDecision => self.execute_decision(node, ctx).await,
            StepKind::AiRoute => self.execute_route(node, ctx).await,
            StepKind::AiAgent => self.execute_agent(node, ctx).await,
            StepKind::AiGuardrail => self.execute_guardrail(node, ctx),
            StepKind::AiToolCall => self.execute_tool_call(node, ctx).await,
            _ => return Err(StepError::NoExecutor(node.kind.as_str().to_string())),
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{AiError, AiReply};
    use uuid::Uuid;

    struct StubAi {
        analysis: AiAnalysis,
        fail: bool,
    }

    #[async_trait]
    impl AiService for StubAi {
        async fn analyze(
            &self,
            _content: &str,
            _context: &Value,
            _analysis_types: &[String],
        ) -> Result<AiAnalysis, AiError> {
            if self.fail {
                Err(AiError::Provider("model overloaded".to_string()))
            } else {
                Ok(self.analysis.clone())
            }
        }

        async fn generate_auto_reply(&self, _content: &str, _context: &Value) -> Result<AiReply, AiError> {
            if self.fail {
                Err(AiError::Provider("model overloaded".to_string()))
            } else {
                Ok(AiReply { content: "Thanks for reaching out!".to_string(), confidence: 0.92 })
            }
        }

        async fn call_tool(&self, tool: &str, arguments: &Value) -> Result<Value, AiError> {
            if self.fail {
                Err(AiError::Provider("tool failure".to_string()))
            } else {
                Ok(json!({ "tool": tool, "echo": arguments }))
            }
        }
    }

    fn with_ai(analysis: AiAnalysis) -> AiSteps {
        AiSteps::new(Some(Arc::new(StubAi { analysis, fail: false })))
    }

    fn failing_ai() -> AiSteps {
        AiSteps::new(Some(Arc::new(StubAi { analysis: AiAnalysis::default(), fail: true })))
    }

    fn ctx(input: Value) -> StepContext {
        StepContext::new(Uuid::new_v4(), Uuid::new_v4(), input)
    }

    fn analysis(intent: &str, sentiment: &str, urgency: &str) -> AiAnalysis {
        AiAnalysis {
            intent: Some(intent.to_string()),
            sentiment: Some(sentiment.to_string()),
            urgency: Some(urgency.to_string()),
            summary: None,
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn test_decision_heuristic_buckets() {
        let node = FlowNode::new("classify", StepKind::AiDecision, json!({}));

        let cases = [
            (analysis("billing_question", "neutral", "critical"), "urgent"),
            (analysis("complaint", "negative", "high"), "urgent_negative"),
            (analysis("complaint", "negative", "low"), "negative"),
            (analysis("praise", "positive", "low"), "positive"),
            (analysis("complaint", "neutral", "low"), "complaint"),
            (analysis("question", "neutral", "low"), "question"),
            (analysis("feature_request", "neutral", "low"), "request"),
            (analysis("greeting", "neutral", "low"), "neutral"),
        ];

        for (a, expected) in cases {
            let steps = with_ai(a);
            let mut ctx = ctx(json!({"content": "hello"}));
            let outcome = steps.execute(&node, &mut ctx).await.unwrap();
            assert_eq!(outcome.path(), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_decision_stores_variables() {
        let steps = with_ai(analysis("question", "neutral", "low"));
        let node = FlowNode::new("classify", StepKind::AiDecision, json!({}));
        let mut ctx = ctx(json!({"content": "how do I reset my password?"}));
        steps.execute(&node, &mut ctx).await.unwrap();

        assert_eq!(ctx.var_str("aiIntent").as_deref(), Some("question"));
        assert_eq!(ctx.var_f64("aiConfidence"), Some(0.9));
    }

    #[tokio::test]
    async fn test_decision_custom_routing_rules_win() {
        let steps = with_ai(analysis("refund", "neutral", "low"));
        let node = FlowNode::new(
            "classify",
            StepKind::AiDecision,
            json!({"routingRules": [
                {"path": "refunds_desk", "when": {"field": "intent", "operator": "equals", "value": "refund"}}
            ]}),
        );
        let mut ctx = ctx(json!({"content": "I want my money back"}));
        let outcome = steps.execute(&node, &mut ctx).await.unwrap();
        assert_eq!(outcome.path(), Some("refunds_desk"));
    }

    #[tokio::test]
    async fn test_decision_without_collaborator_is_unavailable() {
        let steps = AiSteps::new(None);
        let node = FlowNode::new("classify", StepKind::AiDecision, json!({}));
        let outcome = steps.execute(&node, &mut ctx(json!({}))).await.unwrap();
        assert_eq!(outcome.path(), Some("unavailable"));
    }

    #[tokio::test]
    async fn test_decision_collaborator_error_is_fail_soft() {
        let steps = failing_ai();
        let node = FlowNode::new("classify", StepKind::AiDecision, json!({}));
        let outcome = steps.execute(&node, &mut ctx(json!({}))).await.unwrap();
        assert_eq!(outcome.path(), Some("error"));
        match outcome {
            StepOutcome::Complete { output, .. } => assert_eq!(output["fallback"], true),
            _ => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn test_route_uses_configured_routes() {
        let steps = with_ai(analysis("billing", "neutral", "low"));
        let node = FlowNode::new(
            "route",
            StepKind::AiRoute,
            json!({"routes": {"billing": "billing_team", "technical": "tech_team"}}),
        );
        let outcome = steps.execute(&node, &mut ctx(json!({"content": "invoice"}))).await.unwrap();
        assert_eq!(outcome.path(), Some("billing_team"));
    }

    #[tokio::test]
    async fn test_agent_drafts_reply() {
        let steps = with_ai(AiAnalysis::default());
        let node = FlowNode::new("draft", StepKind::AiAgent, json!({}));
        let mut ctx = ctx(json!({"content": "please help"}));
        let outcome = steps.execute(&node, &mut ctx).await.unwrap();
        assert_eq!(outcome.path(), Some("drafted"));
        assert_eq!(ctx.var_str("aiDraft").as_deref(), Some("Thanks for reaching out!"));
        assert_eq!(ctx.var_f64("aiConfidence"), Some(0.92));
    }

    #[tokio::test]
    async fn test_guardrail_blocks_low_confidence() {
        let steps = AiSteps::new(None);
        let node = FlowNode::new("gate", StepKind::AiGuardrail, json!({"minConfidence": 0.8}));
        let mut ctx = ctx(json!({}));
        ctx.set_var("aiConfidence", json!(0.5));

        let outcome = steps.execute(&node, &mut ctx).await.unwrap();
        assert_eq!(outcome.path(), Some("blocked"));
        match outcome {
            StepOutcome::Complete { output, .. } => {
                assert_eq!(output["outputPath"], "blocked");
                assert_eq!(output["reason"], "low_confidence");
            }
            _ => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn test_guardrail_channel_allow_list() {
        let steps = AiSteps::new(None);
        let node = FlowNode::new(
            "gate",
            StepKind::AiGuardrail,
            json!({"allowedChannels": ["chat"]}),
        );
        let mut ctx = ctx(json!({"channel": "sms"}));
        ctx.set_var("aiConfidence", json!(0.95));

        let outcome = steps.execute(&node, &mut ctx).await.unwrap();
        match outcome {
            StepOutcome::Complete { output, .. } => assert_eq!(output["reason"], "channel_not_allowed"),
            _ => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn test_guardrail_content_check() {
        let steps = AiSteps::new(None);
        let node = FlowNode::new("gate", StepKind::AiGuardrail, json!({}));
        let mut ctx = ctx(json!({}));
        ctx.set_var("aiDraft", json!("Well damn, that broke"));

        let outcome = steps.execute(&node, &mut ctx).await.unwrap();
        match outcome {
            StepOutcome::Complete { output, .. } => assert_eq!(output["reason"], "content_blocked"),
            _ => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn test_guardrail_allows_clean_confident_draft() {
        let steps = AiSteps::new(None);
        let node = FlowNode::new(
            "gate",
            StepKind::AiGuardrail,
            json!({"minConfidence": 0.8, "allowedChannels": ["chat"]}),
        );
        let mut ctx = ctx(json!({"channel": "chat"}));
        ctx.set_var("aiConfidence", json!(0.9));
        ctx.set_var("aiDraft", json!("Happy to help with that."));

        let outcome = steps.execute(&node, &mut ctx).await.unwrap();
        assert_eq!(outcome.path(), Some("allowed"));
    }

    #[tokio::test]
    async fn test_tool_call_success_and_unavailable() {
        let steps = with_ai(AiAnalysis::default());
        let node = FlowNode::new(
            "lookup",
            StepKind::AiToolCall,
            json!({"tool": "order_lookup", "arguments": {"order_id": "o-1"}}),
        );
        let mut ctx = ctx(json!({}));
        let outcome = steps.execute(&node, &mut ctx).await.unwrap();
        assert_eq!(outcome.path(), Some("success"));
        assert!(ctx.variables.contains_key("aiToolResult"));

        let absent = AiSteps::new(None);
        let outcome = absent.execute(&node, &mut ctx).await.unwrap();
        assert_eq!(outcome.path(), Some("unavailable"));
    }
}

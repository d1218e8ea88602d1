use crate::adapters::prompts::build_agent_prompt;
use crate::adapters::tools::captured_rows;
use crate::adapters::{AgentMessage, AgentRequest, AgentRuntime};
use crate::dashboard::{backfill_time_series, normalize, resolve_placeholders};
use crate::db::QueryExecutor;
use crate::errors::{AppError, AppResult};
use crate::harness::structured_output::{extract_object, validate_block_props};
use crate::models::{
    AgentTurnResult, DashboardSpec, QueryMetadata, QueryRequest, QueryResponse, QueryResult,
    CONVERSATION_INTENT,
};
use crate::policy::SqlPolicy;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

const SUMMARY_BLOCK: &str = "executive-summary";

/// A turn after reconciliation, before enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedTurn {
    pub spec: Value,
    pub declared_queries: Vec<String>,
    pub safe_queries: Vec<String>,
    pub tool_results_used: usize,
}

pub struct RunnerCore {
    agent: Arc<dyn AgentRuntime>,
    db: Arc<dyn QueryExecutor>,
    policy: SqlPolicy,
}

impl RunnerCore {
    pub fn new(agent: Arc<dyn AgentRuntime>, db: Arc<dyn QueryExecutor>) -> Arc<Self> {
        Arc::new(Self {
            agent,
            db,
            policy: SqlPolicy::new(),
        })
    }

    pub fn agent(&self) -> Arc<dyn AgentRuntime> {
        Arc::clone(&self.agent)
    }

    pub fn agent_request(&self, request: &QueryRequest) -> AgentRequest {
        AgentRequest {
            system_prompt: build_agent_prompt(request.current_chaos.as_ref()),
            message: request.message.clone(),
        }
    }

    /// Single-shot mode: run the agent to completion and reconcile its output.
    pub async fn process_query(&self, request: QueryRequest) -> AppResult<QueryResponse> {
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let agent_request = self.agent_request(&request);
        self.agent.validate(&agent_request)?;

        tracing::info!(request_id = %request_id, "processing query");
        let messages = self.agent.run(&agent_request).await.map_err(|error| {
            tracing::error!(request_id = %request_id, error = %error, "agent processing failed");
            as_turn_failure(error)
        })?;

        let tool_results = collect_tool_results(&messages);
        let turn = parse_turn_blocking(messages, tool_results, request.current_chaos.clone()).await?;
        let response = self
            .respond(turn, request.current_chaos.as_ref(), started)
            .await;
        tracing::info!(
            request_id = %request_id,
            intent = %response.intent,
            blocks = response.dashboard_spec.blocks.len(),
            elapsed_ms = response.query_metadata.execution_time_ms,
            "query completed"
        );
        Ok(response)
    }

    /// Everything after the agent has answered: reconcile, strip, backfill and
    /// shape the client response. Shared by both response modes.
    pub async fn respond(
        &self,
        turn: AgentTurnResult,
        prior_style: Option<&Map<String, Value>>,
        started: Instant,
    ) -> QueryResponse {
        let mut finalized = self.finalize(&turn, prior_style).await;
        strip_blocks_without_data(&mut finalized.spec, &turn.intent, &finalized.safe_queries);
        backfill_time_series(&mut finalized.spec, self.db.as_ref()).await;

        let warnings = catalog_warnings(&finalized.spec);
        for warning in &warnings {
            tracing::warn!(warning = %warning, "dashboard block does not match catalog");
        }

        QueryResponse {
            dashboard_spec: DashboardSpec::from_value(&finalized.spec),
            assistant_message: turn.assistant_message,
            intent: turn.intent,
            query_metadata: QueryMetadata {
                execution_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                sql_queries_requested: finalized.declared_queries.len(),
                sql_queries_executed: finalized.safe_queries.len(),
                tool_results_used: finalized.tool_results_used,
                block_warnings: warnings.len(),
            },
        }
    }

    /// Normalizes the agent's specification and hydrates it from whichever
    /// result channel applies. Captured tool results win outright; declared
    /// SQL is then only counted, never executed.
    pub async fn finalize(
        &self,
        turn: &AgentTurnResult,
        prior_style: Option<&Map<String, Value>>,
    ) -> FinalizedTurn {
        let normalized = normalize(&turn.dashboard_specification);
        let declared_queries = turn.declared_queries.clone();
        let safe_queries = self.policy.filter_safe(&declared_queries);
        if safe_queries.len() < declared_queries.len() {
            tracing::warn!(
                declared = declared_queries.len(),
                safe = safe_queries.len(),
                "dropped unsafe agent queries"
            );
        }

        let results: Vec<QueryResult> = if !turn.tool_results.is_empty() {
            turn.tool_results.clone()
        } else {
            let mut results = Vec::with_capacity(safe_queries.len());
            for sql in &safe_queries {
                match self.db.query(sql).await {
                    Ok(rows) => results.push(rows.into_iter().map(Value::Object).collect()),
                    Err(error) => {
                        tracing::warn!(sql = %sql, error = %error, "residual query failed");
                        results.push(Vec::new());
                    }
                }
            }
            results
        };

        let mut spec = resolve_placeholders(&normalized, &results);
        carry_forward_style(&mut spec, prior_style);

        FinalizedTurn {
            spec,
            declared_queries,
            safe_queries,
            tool_results_used: turn.tool_results.len(),
        }
    }
}

/// Errors from the agent become upstream failures unless they describe the
/// request or configuration.
pub fn as_turn_failure(error: AppError) -> AppError {
    match error {
        AppError::InvalidRequest(_) | AppError::Config(_) | AppError::Upstream(_) => error,
        other => AppError::Upstream(other.to_string()),
    }
}

/// `run_query` outputs that parsed as row arrays, in call order.
pub fn collect_tool_results(messages: &[AgentMessage]) -> Vec<QueryResult> {
    messages
        .iter()
        .filter_map(|message| match message {
            AgentMessage::Tool { name, content, .. } => captured_rows(name, content),
            AgentMessage::Assistant { .. } => None,
        })
        .collect()
}

/// Reads the agent's final JSON payload from the last assistant message that
/// has text. Prose without a recoverable object becomes a conversational reply.
pub fn parse_agent_turn(
    messages: &[AgentMessage],
    tool_results: Vec<QueryResult>,
    prior_style: Option<&Map<String, Value>>,
) -> AppResult<AgentTurnResult> {
    let final_text = messages
        .iter()
        .rev()
        .find_map(|message| match message {
            AgentMessage::Assistant { text, .. } if !text.trim().is_empty() => Some(text.as_str()),
            _ => None,
        })
        .ok_or_else(|| AppError::Upstream("Agent did not produce a text response".to_string()))?;

    match extract_object(final_text) {
        Ok(object) => Ok(AgentTurnResult::from_object(&object, tool_results)),
        Err(error) => {
            tracing::warn!(
                attempts = error.attempts,
                chars = final_text.chars().count(),
                "agent returned non-JSON text; answering conversationally"
            );
            Ok(AgentTurnResult::conversational(final_text, prior_style, tool_results))
        }
    }
}

/// [`parse_agent_turn`] on the blocking pool. Recovering an object from long
/// truncated output tries every brace pair and must stay off the runtime threads.
pub async fn parse_turn_blocking(
    messages: Vec<AgentMessage>,
    tool_results: Vec<QueryResult>,
    prior_style: Option<Map<String, Value>>,
) -> AppResult<AgentTurnResult> {
    tokio::task::spawn_blocking(move || {
        parse_agent_turn(&messages, tool_results, prior_style.as_ref())
    })
    .await
    .map_err(|error| AppError::Internal(format!("turn parsing task failed: {}", error)))?
}

fn carry_forward_style(spec: &mut Value, prior_style: Option<&Map<String, Value>>) {
    let Some(prior) = prior_style.filter(|prior| !prior.is_empty()) else {
        return;
    };
    let has_own = matches!(spec.get("chaos"), Some(Value::Object(chaos)) if !chaos.is_empty());
    if !has_own {
        if let Some(object) = spec.as_object_mut() {
            object.insert("chaos".to_string(), Value::Object(prior.clone()));
        }
    }
}

/// Drops the block list when nothing was fetched and the answer is small talk
/// or a lone summary.
pub fn strip_blocks_without_data(spec: &mut Value, intent: &str, safe_queries: &[String]) {
    if !safe_queries.is_empty() {
        return;
    }
    let Some(blocks) = spec.get_mut("blocks").and_then(Value::as_array_mut) else {
        return;
    };
    let only_summary = blocks.len() == 1
        && blocks[0].get("type").and_then(Value::as_str) == Some(SUMMARY_BLOCK);
    if only_summary || intent == CONVERSATION_INTENT {
        blocks.clear();
    }
}

pub fn catalog_warnings(spec: &Value) -> Vec<String> {
    spec.get("blocks")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| {
                    let block_type = block.get("type")?.as_str()?;
                    let props = block.get("props")?;
                    Some(validate_block_props(block_type, props))
                })
                .flatten()
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{
        collect_tool_results, parse_agent_turn, parse_turn_blocking, strip_blocks_without_data,
        RunnerCore,
    };
    use crate::adapters::{AgentEventStream, AgentMessage, AgentRequest, AgentRuntime};
    use crate::db::testing::ScriptedExecutor;
    use crate::errors::{AppError, AppResult};
    use crate::models::AgentTurnResult;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Instant;

    struct NoAgent;

    #[async_trait]
    impl AgentRuntime for NoAgent {
        async fn run(&self, _request: &AgentRequest) -> AppResult<Vec<AgentMessage>> {
            Err(AppError::Upstream("offline".to_string()))
        }

        fn stream(&self, _request: AgentRequest) -> AgentEventStream {
            Box::pin(futures_util::stream::empty())
        }
    }

    fn turn(value: Value) -> AgentTurnResult {
        AgentTurnResult::from_object(value.as_object().expect("object"), Vec::new())
    }

    fn assistant(text: &str) -> AgentMessage {
        AgentMessage::Assistant {
            text: text.to_string(),
            tool_calls: Vec::new(),
        }
    }

    fn row() -> crate::models::Row {
        json!({"close": 1.5}).as_object().cloned().expect("row")
    }

    #[tokio::test]
    async fn residual_queries_execute_once_each_when_no_tool_results() {
        let db = Arc::new(ScriptedExecutor::returning(vec![row()]));
        let runner = RunnerCore::new(Arc::new(NoAgent), db.clone());
        let finalized = runner
            .finalize(
                &turn(json!({
                    "intent": "data",
                    "declaredQueries": ["SELECT 1", "DROP TABLE news"],
                    "dashboardSpecification": {"blocks": [{"type": "line-chart", "props": {"data": "QUERY_RESULT_0"}}]}
                })),
                None,
            )
            .await;
        assert_eq!(finalized.safe_queries, vec!["SELECT 1".to_string()]);
        assert_eq!(finalized.declared_queries.len(), 2);
        assert_eq!(db.calls(), vec!["SELECT 1".to_string()]);
        assert_eq!(finalized.spec["blocks"][0]["props"]["data"], json!([{"close": 1.5}]));
    }

    // Captured tool results replace residual SQL entirely; they are not merged by position.
    #[tokio::test]
    async fn tool_results_take_precedence_wholesale() {
        let db = Arc::new(ScriptedExecutor::returning(vec![row()]));
        let runner = RunnerCore::new(Arc::new(NoAgent), db.clone());
        let object = json!({
            "declaredQueries": ["SELECT 1", "SELECT 2"],
            "dashboardSpecification": {"blocks": [
                {"type": "a", "props": {"data": "QUERY_RESULT_0"}},
                {"type": "b", "props": {"data": "QUERY_RESULT_1"}}
            ]}
        });
        let turn = AgentTurnResult::from_object(
            object.as_object().expect("object"),
            vec![vec![json!({"tool": true})]],
        );
        let finalized = runner.finalize(&turn, None).await;
        assert!(db.calls().is_empty());
        assert_eq!(finalized.safe_queries.len(), 2);
        assert_eq!(finalized.tool_results_used, 1);
        assert_eq!(finalized.spec["blocks"][0]["props"]["data"], json!([{"tool": true}]));
        assert_eq!(finalized.spec["blocks"][1]["props"]["data"], json!([]));
    }

    #[tokio::test]
    async fn failing_query_degrades_to_empty_without_aborting_siblings() {
        let db = Arc::new(ScriptedExecutor::returning(vec![row()]).failing_on("news"));
        let runner = RunnerCore::new(Arc::new(NoAgent), db.clone());
        let finalized = runner
            .finalize(
                &turn(json!({
                    "declaredQueries": ["SELECT * FROM news", "SELECT * FROM stock_prices"],
                    "dashboardSpecification": {"blocks": [
                        {"type": "a", "props": {"data": "QUERY_RESULT_0"}},
                        {"type": "b", "props": {"data": "QUERY_RESULT_1"}}
                    ]}
                })),
                None,
            )
            .await;
        assert_eq!(db.calls().len(), 2);
        assert_eq!(finalized.spec["blocks"][0]["props"]["data"], json!([]));
        assert_eq!(finalized.spec["blocks"][1]["props"]["data"], json!([{"close": 1.5}]));
    }

    #[tokio::test]
    async fn prior_style_fills_in_only_when_agent_omits_it() {
        let runner = RunnerCore::new(Arc::new(NoAgent), Arc::new(ScriptedExecutor::default()));
        let prior = json!({"rotation": 180}).as_object().cloned().expect("prior");

        let carried = runner
            .finalize(&turn(json!({"dashboardSpecification": {"blocks": []}})), Some(&prior))
            .await;
        assert_eq!(carried.spec["chaos"], json!({"rotation": 180}));

        let empty_chaos = runner
            .finalize(&turn(json!({"dashboardSpecification": {"blocks": [], "chaos": {}}})), Some(&prior))
            .await;
        assert_eq!(empty_chaos.spec["chaos"], json!({"rotation": 180}));

        let own = runner
            .finalize(
                &turn(json!({"dashboardSpecification": {"blocks": [], "chaos": {"theme": "matrix"}}})),
                Some(&prior),
            )
            .await;
        assert_eq!(own.spec["chaos"], json!({"theme": "matrix"}));
    }

    #[test]
    fn strips_small_talk_and_lone_summaries_without_data() {
        let mut spec = json!({"blocks": [{"type": "executive-summary", "props": {"content": "hi"}}]});
        strip_blocks_without_data(&mut spec, "data", &[]);
        assert_eq!(spec["blocks"], json!([]));

        let mut spec = json!({"blocks": [{"type": "kpi-card", "props": {}}, {"type": "executive-summary", "props": {}}]});
        strip_blocks_without_data(&mut spec, "conversation", &[]);
        assert_eq!(spec["blocks"], json!([]));

        let mut spec = json!({"blocks": [{"type": "kpi-card", "props": {}}, {"type": "executive-summary", "props": {}}]});
        strip_blocks_without_data(&mut spec, "data", &[]);
        assert_eq!(spec["blocks"].as_array().map(Vec::len), Some(2));

        let mut spec = json!({"blocks": [{"type": "executive-summary", "props": {}}]});
        strip_blocks_without_data(&mut spec, "conversation", &["SELECT 1".to_string()]);
        assert_eq!(spec["blocks"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn parses_last_assistant_text_and_degrades_prose() {
        let messages = vec![
            assistant("{\"intent\": \"early\"}"),
            AgentMessage::Tool {
                call_id: "c1".to_string(),
                name: "run_query".to_string(),
                content: "[{\"a\": 1}]".to_string(),
            },
            assistant("Here you go\n{\"intent\": \"data\", \"assistantMessage\": \"Done\"}"),
            assistant("   "),
        ];
        let results = collect_tool_results(&messages);
        assert_eq!(results, vec![vec![json!({"a": 1})]]);
        let parsed = parse_agent_turn(&messages, results, None).expect("turn");
        assert_eq!(parsed.intent, "data");
        assert_eq!(parsed.assistant_message, "Done");
        assert_eq!(parsed.tool_results.len(), 1);

        let prior = json!({"theme": "matrix"}).as_object().cloned().expect("prior");
        let prose = parse_agent_turn(&[assistant("Hello there!")], Vec::new(), Some(&prior)).expect("turn");
        assert_eq!(prose.intent, "conversation");
        assert_eq!(prose.assistant_message, "Hello there!");
        assert_eq!(prose.dashboard_specification, json!({"blocks": [], "chaos": {"theme": "matrix"}}));
    }

    #[test]
    fn no_assistant_text_is_a_turn_failure() {
        let error = parse_agent_turn(&[assistant("")], Vec::new(), None).expect_err("no text");
        assert!(matches!(error, AppError::Upstream(_)));
        assert!(parse_agent_turn(&[], Vec::new(), None).is_err());
    }

    #[tokio::test]
    async fn respond_counts_metadata_and_warnings() {
        let runner = RunnerCore::new(Arc::new(NoAgent), Arc::new(ScriptedExecutor::returning(vec![row()])));
        let response = runner
            .respond(
                turn(json!({
                    "intent": "data",
                    "assistantMessage": "Apple is up",
                    "declaredQueries": ["SELECT * FROM stock_prices", "DELETE FROM news"],
                    "dashboardSpecification": {"blocks": [
                        {"type": "executive-summary", "content": "Apple"},
                        {"type": "kpi-card", "ticker": "AAPL"}
                    ]}
                })),
                None,
                Instant::now(),
            )
            .await;
        assert_eq!(response.intent, "data");
        assert_eq!(response.assistant_message, "Apple is up");
        assert_eq!(response.dashboard_spec.blocks.len(), 2);
        assert_eq!(response.query_metadata.sql_queries_requested, 2);
        assert_eq!(response.query_metadata.sql_queries_executed, 1);
        assert!(response.query_metadata.block_warnings >= 1);
    }

    #[tokio::test]
    async fn agent_failure_surfaces_as_upstream_error() {
        let runner = RunnerCore::new(Arc::new(NoAgent), Arc::new(ScriptedExecutor::default()));
        let request = crate::models::QueryRequest {
            message: "How is AAPL doing?".to_string(),
            current_chaos: None,
        };
        assert!(matches!(runner.process_query(request).await, Err(AppError::Upstream(_))));

        let blank = crate::models::QueryRequest {
            message: "  ".to_string(),
            current_chaos: None,
        };
        assert!(matches!(runner.process_query(blank).await, Err(AppError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn long_truncated_output_is_parsed_on_the_blocking_pool() {
        let truncated = format!("Here is the dashboard {}", "{ rows } ".repeat(300));
        let prior = json!({"theme": "matrix"}).as_object().cloned().expect("prior");

        let parsed = parse_turn_blocking(vec![assistant(&truncated)], Vec::new(), Some(prior))
            .await
            .expect("turn");
        assert_eq!(parsed.intent, "conversation");
        assert_eq!(parsed.assistant_message, truncated);
        assert_eq!(parsed.dashboard_specification["chaos"]["theme"], "matrix");

        let parsed = parse_turn_blocking(
            vec![assistant("{\"intent\": \"data\", \"assistantMessage\": \"ok\"}")],
            Vec::new(),
            None,
        )
        .await
        .expect("turn");
        assert_eq!(parsed.intent, "data");
    }
}

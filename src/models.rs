use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub type Row = Map<String, Value>;

/// One query's rows, addressed by `QUERY_RESULT_<n>` placeholders.
pub type QueryResult = Vec<Value>;

pub const CONVERSATION_INTENT: &str = "conversation";
pub const UNKNOWN_INTENT: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosState {
    #[serde(default)]
    pub rotation: Option<f64>,
    #[serde(default)]
    pub font_family: Option<String>,
    #[serde(default)]
    pub animation: Option<String>,
    #[serde(default)]
    pub theme: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub props: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardSpec {
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub chaos: Option<ChaosState>,
}

impl ChaosState {
    /// Reads each style field on its own so one mistyped field does not discard
    /// the others. `None` when no field is readable.
    pub fn from_object(object: &Map<String, Value>) -> Option<Self> {
        let rotation = match object.get("rotation") {
            None | Some(Value::Null) => None,
            Some(value) => {
                let parsed = value
                    .as_f64()
                    .or_else(|| value.as_str().and_then(|text| text.trim().parse::<f64>().ok()))
                    .filter(|rotation| rotation.is_finite());
                if parsed.is_none() {
                    tracing::warn!(value = %value, "dropping unreadable chaos rotation");
                }
                parsed
            }
        };
        let text = |key: &str| match object.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(value)) => Some(value.clone()),
            Some(other) => {
                tracing::warn!(field = key, value = %other, "dropping unreadable chaos field");
                None
            }
        };

        let state = Self {
            rotation,
            font_family: text("fontFamily"),
            animation: text("animation"),
            theme: text("theme"),
        };
        (state != Self::default()).then_some(state)
    }
}

impl DashboardSpec {
    /// Typed view of a normalized, hydrated specification value. Blocks without a
    /// string `type` and chaos values that do not read as a [`ChaosState`] are dropped.
    pub fn from_value(value: &Value) -> Self {
        let blocks = value
            .get("blocks")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|block| {
                        let block_type = block.get("type")?.as_str()?.to_string();
                        let props = block
                            .get("props")
                            .and_then(Value::as_object)
                            .cloned()
                            .unwrap_or_default();
                        Some(Block { block_type, props })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let chaos = match value.get("chaos") {
            None | Some(Value::Null) => None,
            Some(Value::Object(object)) => ChaosState::from_object(object),
            Some(other) => {
                tracing::warn!(chaos = %other, "dropping chaos state that is not an object");
                None
            }
        };

        Self { blocks, chaos }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub message: String,
    #[serde(default)]
    pub current_chaos: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMetadata {
    pub execution_time_ms: u64,
    pub sql_queries_requested: usize,
    pub sql_queries_executed: usize,
    pub tool_results_used: usize,
    pub block_warnings: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub dashboard_spec: DashboardSpec,
    pub assistant_message: String,
    pub intent: String,
    pub query_metadata: QueryMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtsRequest {
    #[serde(default)]
    pub text: Option<String>,
}

/// What one agent turn produced, before reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTurnResult {
    pub intent: String,
    pub assistant_message: String,
    pub dashboard_specification: Value,
    pub declared_queries: Vec<String>,
    pub tool_results: Vec<QueryResult>,
}

impl AgentTurnResult {
    /// Reads the model's JSON payload field by field so one malformed field does
    /// not discard the rest. Accepts the legacy `dashboardSpec`/`sqlQueries` keys.
    pub fn from_object(object: &Map<String, Value>, tool_results: Vec<QueryResult>) -> Self {
        let intent = object
            .get("intent")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_INTENT)
            .to_string();
        let assistant_message = object
            .get("assistantMessage")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let dashboard_specification = object
            .get("dashboardSpecification")
            .or_else(|| object.get("dashboardSpec"))
            .cloned()
            .unwrap_or(Value::Null);
        let declared_queries = object
            .get("declaredQueries")
            .or_else(|| object.get("sqlQueries"))
            .and_then(Value::as_array)
            .map(|queries| {
                queries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            intent,
            assistant_message,
            dashboard_specification,
            declared_queries,
            tool_results,
        }
    }

    /// Synthetic reply used when the model answered in prose instead of JSON.
    pub fn conversational(
        text: &str,
        prior_style: Option<&Map<String, Value>>,
        tool_results: Vec<QueryResult>,
    ) -> Self {
        Self {
            intent: CONVERSATION_INTENT.to_string(),
            assistant_message: text.to_string(),
            dashboard_specification: json!({
                "blocks": [],
                "chaos": prior_style.cloned().unwrap_or_default(),
            }),
            declared_queries: Vec::new(),
            tool_results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEvent {
    ToolCall { step: usize, tool: String, input: String },
    ToolResult { step: usize, tool: String, preview: String },
}

/// Events of the incremental query mode, in the order a client sees them.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Step(StepEvent),
    Content { delta: String },
    Result(Box<QueryResponse>),
    Error { detail: String },
    Done,
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Step(_) => "step",
            Self::Content { .. } => "content",
            Self::Result(_) => "result",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::Step(step) => serde_json::to_value(step).unwrap_or(Value::Null),
            Self::Content { delta } => json!({ "delta": delta }),
            Self::Result(response) => serde_json::to_value(response.as_ref()).unwrap_or(Value::Null),
            Self::Error { detail } => json!({ "detail": detail }),
            Self::Done => json!({}),
        }
    }
}

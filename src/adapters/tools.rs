use crate::db::{describe_schema, QueryExecutor};
use crate::models::QueryResult;
use crate::policy::SqlPolicy;
use serde_json::{json, Value};
use std::sync::Arc;

pub const RUN_QUERY_TOOL: &str = "run_query";
pub const GET_SCHEMA_TOOL: &str = "get_schema";
pub const MAX_TOOL_ROWS: usize = 200;

/// The tools the agent may call. Every tool answers with text the model can
/// read; failures become `{"error": ...}` so the turn can continue.
#[derive(Clone)]
pub struct ToolBox {
    executor: Arc<dyn QueryExecutor>,
    policy: SqlPolicy,
}

impl ToolBox {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            executor,
            policy: SqlPolicy::new(),
        }
    }

    pub fn definitions() -> Value {
        json!([
            {
                "type": "function",
                "function": {
                    "name": RUN_QUERY_TOOL,
                    "description": "Execute a read-only SELECT against stock_prices, financial_metrics or news. Returns a JSON array of row objects (at most 200).",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "sql": { "type": "string", "description": "A single SELECT statement." }
                        },
                        "required": ["sql"]
                    }
                }
            },
            {
                "type": "function",
                "function": {
                    "name": GET_SCHEMA_TOOL,
                    "description": "List the available tables and their columns.",
                    "parameters": { "type": "object", "properties": {} }
                }
            }
        ])
    }

    pub async fn call(&self, name: &str, arguments: &str) -> String {
        match name {
            RUN_QUERY_TOOL => match sql_argument(arguments) {
                Some(sql) => self.run_query(&sql).await,
                None => error_text("run_query requires a string `sql` argument"),
            },
            GET_SCHEMA_TOOL => self.get_schema(),
            other => error_text(&format!("unknown tool: {}", other)),
        }
    }

    pub async fn run_query(&self, sql: &str) -> String {
        if !self.policy.is_safe(sql) {
            tracing::warn!(sql, "agent query rejected by sql policy");
            return error_text("Query rejected: only a single SELECT on the allowed tables is permitted.");
        }

        match self.executor.query(sql).await {
            Ok(mut rows) => {
                rows.truncate(MAX_TOOL_ROWS);
                serde_json::to_string(&rows).unwrap_or_else(|error| error_text(&error.to_string()))
            }
            Err(error) => {
                tracing::warn!(sql, error = %error, "tool run_query failed");
                error_text(&error.to_string())
            }
        }
    }

    pub fn get_schema(&self) -> String {
        describe_schema()
    }
}

/// Rows captured from a finished tool call; only `run_query` answers that
/// parse as a JSON array count.
pub fn captured_rows(tool_name: &str, output: &str) -> Option<QueryResult> {
    if tool_name != RUN_QUERY_TOOL {
        return None;
    }
    match serde_json::from_str::<Value>(output).ok()? {
        Value::Array(rows) => Some(rows),
        _ => None,
    }
}

fn sql_argument(arguments: &str) -> Option<String> {
    serde_json::from_str::<Value>(arguments)
        .ok()?
        .get("sql")?
        .as_str()
        .map(str::to_string)
}

fn error_text(message: &str) -> String {
    json!({ "error": message }).to_string()
}

use crate::db::{QueryExecutor, KNOWN_TICKERS};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

const DEFAULT_DAYS: u32 = 30;
const TIME_SERIES_BLOCKS: [&str; 2] = ["line-chart", "candlestick-chart"];

static LAST_N_DAYS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)last\s+([0-9]+)\s+day").expect("valid day-count regex"));

/// Fills chart blocks that arrived without data with the ticker's most recent
/// daily prices. Returns how many blocks were filled; a failed lookup leaves
/// its block untouched.
pub async fn backfill_time_series(spec: &mut Value, executor: &dyn QueryExecutor) -> usize {
    let Some(blocks) = spec.get_mut("blocks").and_then(Value::as_array_mut) else {
        return 0;
    };

    let mut filled = 0;
    for block in blocks.iter_mut() {
        let is_line_chart = match block.get("type").and_then(Value::as_str) {
            Some(block_type) if TIME_SERIES_BLOCKS.contains(&block_type) => block_type == "line-chart",
            _ => continue,
        };
        let Some(props) = block.get_mut("props").and_then(Value::as_object_mut) else {
            continue;
        };
        if has_rows(props) {
            continue;
        }

        let title = props.get("title").and_then(Value::as_str).unwrap_or_default();
        let Some(ticker) = props
            .get("ticker")
            .and_then(Value::as_str)
            .and_then(known_ticker)
            .or_else(|| ticker_in_text(title))
        else {
            continue;
        };
        let days = days_in_text(title).unwrap_or(DEFAULT_DAYS);

        let sql = recent_prices_sql(ticker, days);
        match executor.query(&sql).await {
            Ok(rows) => {
                props.insert(
                    "data".to_string(),
                    Value::Array(rows.into_iter().map(Value::Object).collect()),
                );
                if is_line_chart {
                    props.entry("xKey").or_insert_with(|| json!("date"));
                    props.entry("yKeys").or_insert_with(|| json!(["close"]));
                }
                filled += 1;
            }
            Err(error) => {
                tracing::warn!(ticker, days, error = %error, "time series backfill failed");
            }
        }
    }
    filled
}

fn has_rows(props: &Map<String, Value>) -> bool {
    matches!(props.get("data"), Some(Value::Array(rows)) if !rows.is_empty())
}

fn known_ticker(candidate: &str) -> Option<&'static str> {
    let candidate = candidate.trim();
    KNOWN_TICKERS
        .iter()
        .copied()
        .find(|ticker| ticker.eq_ignore_ascii_case(candidate))
}

fn ticker_in_text(text: &str) -> Option<&'static str> {
    let upper = text.to_ascii_uppercase();
    KNOWN_TICKERS.iter().copied().find(|ticker| upper.contains(ticker))
}

fn days_in_text(text: &str) -> Option<u32> {
    let captures = LAST_N_DAYS.captures(text)?;
    let days: u32 = captures.get(1)?.as_str().parse().ok()?;
    Some(days.max(1))
}

// `ticker` is always one of KNOWN_TICKERS, never caller text.
fn recent_prices_sql(ticker: &'static str, days: u32) -> String {
    format!(
        "SELECT * FROM (SELECT date, open, high, low, close FROM stock_prices \
         WHERE ticker = '{}' ORDER BY date DESC LIMIT {}) t ORDER BY date ASC",
        ticker, days
    )
}

use crate::errors::{AppError, AppResult};
use crate::models::Row;
use async_trait::async_trait;
use base64::Engine;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Symbols present in the analytical dataset.
pub const KNOWN_TICKERS: [&str; 3] = ["AAPL", "MSFT", "TSLA"];

pub const TABLE_SCHEMA: [(&str, &[&str]); 3] = [
    (
        "stock_prices",
        &[
            "ticker TEXT",
            "date TEXT",
            "open REAL",
            "high REAL",
            "low REAL",
            "close REAL",
            "volume INTEGER",
        ],
    ),
    (
        "financial_metrics",
        &[
            "ticker TEXT",
            "report_period TEXT",
            "market_cap REAL",
            "pe_ratio REAL",
            "pb_ratio REAL",
            "current_ratio REAL",
            "debt_to_equity REAL",
            "revenue_growth REAL",
            "net_income_growth REAL",
            "free_cash_flow_yield REAL",
        ],
    ),
    (
        "news",
        &[
            "ticker TEXT",
            "date TEXT",
            "title TEXT",
            "author TEXT",
            "source TEXT",
            "url TEXT",
            "sentiment REAL",
        ],
    ),
];

/// `table: column TYPE, ...` per table, one line each.
pub fn describe_schema() -> String {
    TABLE_SCHEMA
        .iter()
        .map(|(table, columns)| format!("{}: {}", table, columns.join(", ")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Executes one SQL statement and returns its rows. Failures are returned to the
/// caller, which decides whether they degrade to an empty result.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn query(&self, sql: &str) -> AppResult<Vec<Row>>;
}

#[derive(Debug, Clone)]
pub struct Database {
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> Self {
        Self {
            db_path: path.to_path_buf(),
        }
    }

    /// Creates the database file and analytical tables if they are missing.
    pub fn bootstrap(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

#[async_trait]
impl QueryExecutor for Database {
    async fn query(&self, sql: &str) -> AppResult<Vec<Row>> {
        let path = self.db_path.clone();
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || query_read_only(&path, &sql))
            .await
            .map_err(|error| AppError::Internal(format!("query task failed: {}", error)))?
    }
}

// The connection lives for exactly one statement and is closed on every return path.
fn query_read_only(path: &Path, sql: &str) -> AppResult<Vec<Row>> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let mut statement = conn.prepare(sql)?;
    let columns: Vec<String> = statement
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut rows = statement.query([])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (index, column) in columns.iter().enumerate() {
            record.insert(column.clone(), to_json(row.get_ref(index)?));
        }
        records.push(record);
    }
    Ok(records)
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        // NaN and infinities have no JSON form.
        ValueRef::Real(number) => serde_json::Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{describe_schema, Database, QueryExecutor};
    use crate::errors::AppError;
    use rusqlite::{params, Connection};
    use serde_json::json;

    fn seeded() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("finance.db");
        let db = Database::bootstrap(&db_path).expect("bootstrap");
        let conn = Connection::open(&db_path).expect("open");
        for (date, close) in [("2024-01-02", 185.64), ("2024-01-03", 184.25)] {
            conn.execute(
                "INSERT INTO stock_prices (ticker, date, open, high, low, close, volume)
                 VALUES ('AAPL', ?1, ?2, ?2, ?2, ?2, 1000)",
                params![date, close],
            )
            .expect("insert");
        }
        (dir, db)
    }

    #[tokio::test]
    async fn query_returns_rows_in_order_with_native_types() {
        let (_dir, db) = seeded();
        let rows = db
            .query("SELECT date, close, volume, NULL AS missing FROM stock_prices ORDER BY date")
            .await
            .expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(
            serde_json::Value::Object(rows[0].clone()),
            json!({"date": "2024-01-02", "close": 185.64, "volume": 1000, "missing": null})
        );
    }

    #[tokio::test]
    async fn non_finite_reals_become_null_and_blobs_base64() {
        let (_dir, db) = seeded();
        let rows = db
            .query("SELECT 9e999 AS overflow, X'0102' AS raw")
            .await
            .expect("rows");
        assert_eq!(rows[0]["overflow"], json!(null));
        assert_eq!(rows[0]["raw"], json!("AQI="));
    }

    #[tokio::test]
    async fn connection_is_read_only() {
        let (_dir, db) = seeded();
        let error = db
            .query("DELETE FROM stock_prices")
            .await
            .expect_err("read-only connection");
        assert!(matches!(error, AppError::Database(_)));

        let rows = db.query("SELECT COUNT(*) AS n FROM stock_prices").await.expect("count");
        assert_eq!(rows[0]["n"], json!(2));
    }

    #[tokio::test]
    async fn missing_file_and_bad_sql_are_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("absent.db"));
        assert!(db.query("SELECT 1").await.is_err());
        assert!(!dir.path().join("absent.db").exists());

        let (_dir, db) = seeded();
        assert!(matches!(
            db.query("SELECT nope FROM stock_prices").await,
            Err(AppError::Database(_))
        ));
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("finance.db");
        Database::bootstrap(&db_path).expect("first");
        let db = Database::bootstrap(&db_path).expect("second");
        assert_eq!(db.path(), db_path.as_path());
    }

    #[test]
    fn schema_description_lists_every_table() {
        let description = describe_schema();
        assert_eq!(description.lines().count(), 3);
        assert!(description.starts_with("stock_prices: ticker TEXT, date TEXT"));
        assert!(description.contains("news: ticker TEXT"));
    }
}

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

pub const ALLOWED_TABLES: [&str; 3] = ["stock_prices", "financial_metrics", "news"];

static DISALLOWED_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(insert|update|delete|drop|alter|create|copy|export|import|attach|detach|pragma|set)\b",
    )
    .expect("valid keyword regex")
});

static READ_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(select|with)\b").expect("valid prefix regex"));

// One SQL token: string literal, (possibly qualified, possibly quoted) identifier, or a single symbol.
static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"'(?:[^']|'')*'|(?:"[^"]*"|`[^`]*`|\[[^\]]*\]|[A-Za-z_][\w$]*)(?:\s*\.\s*(?:"[^"]*"|`[^`]*`|\[[^\]]*\]|[A-Za-z_][\w$]*))*|\S"#,
    )
    .expect("valid token regex")
});

const FROM_LIST_TERMINATORS: [&str; 17] = [
    "where", "group", "order", "limit", "having", "window", "union", "except", "intersect", "join",
    "inner", "left", "right", "full", "cross", "natural", "on",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Literal,
    Comma,
    Open,
    Close,
    Other,
}

/// Static allow-list policy for SQL proposed by the agent.
///
/// Rejection is preferred whenever a statement cannot be classified with confidence;
/// a safe query that gets refused only costs a missing chart.
#[derive(Debug, Clone)]
pub struct SqlPolicy {
    allowed_tables: BTreeSet<String>,
}

impl Default for SqlPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlPolicy {
    pub fn new() -> Self {
        Self::with_tables(ALLOWED_TABLES)
    }

    pub fn with_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_tables: tables
                .into_iter()
                .map(|table| table.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_safe(&self, sql: &str) -> bool {
        let stripped = sql.trim();
        if stripped.is_empty() {
            return false;
        }

        let body = stripped.strip_suffix(';').unwrap_or(stripped);
        if body.contains(';') {
            return false;
        }

        if DISALLOWED_KEYWORDS.is_match(body) {
            return false;
        }

        if !READ_PREFIX.is_match(body) {
            return false;
        }

        match referenced_tables(body) {
            Some(tables) => tables
                .iter()
                .all(|table| self.allowed_tables.contains(table)),
            None => false,
        }
    }

    /// Keeps the safe subset in its original relative order.
    pub fn filter_safe(&self, queries: &[String]) -> Vec<String> {
        queries
            .iter()
            .filter(|query| self.is_safe(query))
            .cloned()
            .collect()
    }
}

static DEFAULT_POLICY: Lazy<SqlPolicy> = Lazy::new(SqlPolicy::new);

pub fn is_safe_sql(sql: &str) -> bool {
    DEFAULT_POLICY.is_safe(sql)
}

pub fn filter_safe_queries(queries: &[String]) -> Vec<String> {
    DEFAULT_POLICY.filter_safe(queries)
}

fn tokenize(sql: &str) -> Vec<Token> {
    TOKEN
        .find_iter(sql)
        .map(|found| {
            let text = found.as_str();
            match text {
                "," => Token::Comma,
                "(" => Token::Open,
                ")" => Token::Close,
                _ if text.starts_with('\'') => Token::Literal,
                _ if text.starts_with(|c: char| c.is_ascii_alphabetic() || matches!(c, '_' | '"' | '`' | '[')) => {
                    Token::Ident(text.to_string())
                }
                _ => Token::Other,
            }
        })
        .collect()
}

fn is_keyword(token: &Token, keyword: &str) -> bool {
    matches!(token, Token::Ident(text) if text.eq_ignore_ascii_case(keyword))
}

/// Base table name of a possibly qualified, possibly quoted reference.
fn base_table_name(reference: &str) -> String {
    let last = reference.rsplit('.').next().unwrap_or(reference).trim();
    last.trim_matches(|c| matches!(c, '"' | '`' | '[' | ']'))
        .to_ascii_lowercase()
}

/// Index just past the parenthesized group opening at `open`.
fn skip_group(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    for (index, token) in tokens.iter().enumerate().skip(open) {
        match token {
            Token::Open => depth += 1,
            Token::Close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return index + 1;
                }
            }
            _ => {}
        }
    }
    tokens.len()
}

/// Start of the next comma-separated item of a `FROM` list, skipping aliases.
fn next_list_item(tokens: &[Token], mut cursor: usize) -> Option<usize> {
    while let Some(token) = tokens.get(cursor) {
        match token {
            Token::Comma => return Some(cursor + 1),
            Token::Open => cursor = skip_group(tokens, cursor),
            Token::Close => return None,
            Token::Ident(word)
                if FROM_LIST_TERMINATORS
                    .iter()
                    .any(|keyword| word.eq_ignore_ascii_case(keyword)) =>
            {
                return None
            }
            _ => cursor += 1,
        }
    }
    None
}

/// Tables named after `FROM`/`JOIN`, including comma-separated `FROM` lists.
/// `None` means a reference could not be read, which callers treat as unsafe.
fn referenced_tables(sql: &str) -> Option<Vec<String>> {
    let tokens = tokenize(sql);
    let mut tables = Vec::new();

    for (index, token) in tokens.iter().enumerate() {
        let is_from = is_keyword(token, "from");
        if !is_from && !is_keyword(token, "join") {
            continue;
        }

        let mut cursor = index + 1;
        loop {
            match tokens.get(cursor) {
                Some(Token::Ident(name)) => {
                    tables.push(base_table_name(name));
                    cursor += 1;
                }
                // Subqueries are scanned by the outer loop.
                Some(Token::Open) => cursor = skip_group(&tokens, cursor),
                _ => return None,
            }
            if !is_from {
                break;
            }
            match next_list_item(&tokens, cursor) {
                Some(next) => cursor = next,
                None => break,
            }
        }
    }

    Some(tables)
}

#[cfg(test)]
mod tests {
    use super::{filter_safe_queries, is_safe_sql, SqlPolicy};

    #[test]
    fn accepts_plain_select_on_allowed_table() {
        assert!(is_safe_sql("SELECT * FROM stock_prices"));
        assert!(is_safe_sql("  select close from stock_prices where ticker = 'AAPL';"));
        assert!(is_safe_sql("SELECT 1"));
    }

    #[test]
    fn rejects_empty_input() {
        assert!(!is_safe_sql(""));
        assert!(!is_safe_sql("   \n\t"));
    }

    #[test]
    fn rejects_statement_stacking() {
        assert!(!is_safe_sql("SELECT * FROM news; DROP TABLE news"));
        assert!(!is_safe_sql("SELECT * FROM news; SELECT * FROM news"));
        assert!(!is_safe_sql("SELECT * FROM news;;"));
    }

    #[test]
    fn rejects_mutation_keywords_case_insensitively() {
        for sql in [
            "INSERT INTO news VALUES (1)",
            "select * from news where 1=1 UNION select * from news; delete from news",
            "WITH x AS (DELETE FROM news) SELECT 1",
            "SELECT * FROM stock_prices WHERE ticker IN (SELECT 1) -- Pragma",
            "with t as (select 1) select * from t set",
        ] {
            assert!(!is_safe_sql(sql), "{sql}");
        }
    }

    #[test]
    fn keywords_match_whole_words_only() {
        assert!(is_safe_sql("SELECT offset_days, created_at FROM news"));
        assert!(is_safe_sql("SELECT * FROM stock_prices LIMIT 5 OFFSET 10"));
    }

    #[test]
    fn rejects_non_read_prefix() {
        assert!(!is_safe_sql("EXPLAIN SELECT * FROM news"));
        assert!(!is_safe_sql("VALUES (1)"));
    }

    #[test]
    fn rejects_tables_outside_allow_list() {
        assert!(!is_safe_sql("SELECT * FROM users"));
        assert!(!is_safe_sql("SELECT * FROM sqlite_master"));
        assert!(!is_safe_sql("SELECT * FROM news JOIN secrets ON news.ticker = secrets.ticker"));
        assert!(!is_safe_sql("SELECT * FROM stock_prices, secrets"));
        assert!(!is_safe_sql("SELECT * FROM stock_prices s, \"secrets\" x"));
        assert!(!is_safe_sql("SELECT * FROM pragma_table_info('news')"));
    }

    #[test]
    fn accepts_joins_qualified_and_quoted_names() {
        assert!(is_safe_sql(
            "SELECT p.close, m.pe_ratio FROM main.stock_prices p JOIN financial_metrics m ON p.ticker = m.ticker"
        ));
        assert!(is_safe_sql("SELECT * FROM \"news\" n, stock_prices s WHERE n.ticker = s.ticker"));
        assert!(is_safe_sql(
            "SELECT * FROM (SELECT date, close FROM stock_prices ORDER BY date DESC LIMIT 5) t ORDER BY date"
        ));
    }

    #[test]
    fn rejects_dangling_from() {
        assert!(!is_safe_sql("SELECT * FROM"));
        assert!(!is_safe_sql("SELECT * FROM 'news'"));
    }

    #[test]
    fn filter_preserves_relative_order() {
        let queries = vec![
            "SELECT * FROM news".to_string(),
            "DROP TABLE news".to_string(),
            "SELECT * FROM stock_prices".to_string(),
            "SELECT * FROM users".to_string(),
        ];
        assert_eq!(
            filter_safe_queries(&queries),
            vec!["SELECT * FROM news".to_string(), "SELECT * FROM stock_prices".to_string()]
        );
    }

    #[test]
    fn custom_allow_list_is_respected() {
        let policy = SqlPolicy::with_tables(["ledger"]);
        assert!(policy.is_safe("SELECT * FROM Ledger"));
        assert!(!policy.is_safe("SELECT * FROM news"));
    }
}

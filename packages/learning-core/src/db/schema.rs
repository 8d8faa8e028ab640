use sqlx::SqlitePool;

use super::SCHEMA_VERSION;

pub const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

/// Tables rebuilt from the event log
pub const LOG_DERIVED_TABLES: &[&str] = &[
    "quiz_session_progress",
    "session_answer_log",
    "memory_stats",
    "memory_review_log",
    "lesson_completions",
    "course_completions",
    "scoring_entries",
];

pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut in_comment = false;

    for ch in sql.chars() {
        if in_comment {
            if ch == '\n' {
                in_comment = false;
                current.push(ch);
            }
            continue;
        }

        match ch {
            '-' if !in_single_quote && !in_double_quote && current.ends_with('-') => {
                current.pop();
                in_comment = true;
                continue;
            }
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
            }
            ';' if !in_single_quote && !in_double_quote => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }

        current.push(ch);
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }

    statements
}

/// Create missing tables and indexes, then stamp the schema version
pub async fn apply_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for stmt in split_sql_statements(SCHEMA_SQL) {
        sqlx::query(&stmt).execute(&mut *tx).await?;
    }

    sqlx::query(r#"INSERT OR REPLACE INTO "_db_metadata" ("key", "value") VALUES ('schema_version', ?)"#)
        .bind(SCHEMA_VERSION)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ignores_comments_and_quoted_semicolons() {
        let sql = "-- header; with semicolon\nCREATE TABLE a (x TEXT DEFAULT ';');\n\n-- trailing\nCREATE INDEX i ON a (x);";
        let statements = split_sql_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE a"));
        assert!(statements[0].contains("';'"));
        assert_eq!(statements[1], "CREATE INDEX i ON a (x)");
    }

    #[test]
    fn test_embedded_schema_splits_into_statements() {
        let statements = split_sql_statements(SCHEMA_SQL);
        assert!(statements.iter().any(|s| s.contains(r#"CREATE TABLE IF NOT EXISTS "events""#)));
        assert!(statements.iter().all(|s| !s.trim_start().starts_with("--")));
    }
}

pub const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

/// Splits a script on `;`, ignoring separators inside quoted strings. Comment-only
/// fragments are dropped.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_single_quote = false;
    let mut in_double_quote = false;

    for line in sql.lines() {
        let trimmed = line.trim_start();
        if !in_single_quote && !in_double_quote && trimmed.starts_with("--") {
            continue;
        }
        for ch in line.chars() {
            match ch {
                '\'' if !in_double_quote => in_single_quote = !in_single_quote,
                '"' if !in_single_quote => in_double_quote = !in_double_quote,
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
        current.push('\n');
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }

    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_respects_quotes_and_comments() {
        let sql = "-- header\nCREATE TABLE a (x TEXT DEFAULT ';');\n\nINSERT INTO a VALUES ('b;c');\n";
        let statements = split_sql_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE a"));
        assert_eq!(statements[1], "INSERT INTO a VALUES ('b;c')");
    }

    #[test]
    fn test_schema_has_all_tables() {
        let statements = split_sql_statements(SCHEMA_SQL);
        for table in [
            "outcome_records",
            "topic_models",
            "user_parameters",
            "embedding_artifacts",
            "training_tracker",
        ] {
            assert!(
                statements
                    .iter()
                    .any(|s| s.contains(&format!("CREATE TABLE IF NOT EXISTS {table}"))),
                "missing {table}"
            );
        }
    }
}

//! Database query and schema introspection tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Number, Value};

use crate::error::ToolError;
use crate::store::Database;
use crate::tools::tool::{Tool, ToolContext};

/// Maximum rows materialized by a select.
const MAX_ROWS: usize = 1000;

const FORBIDDEN_PREFIXES: &[&str] = &["DROP ", "TRUNCATE ", "ALTER ", "CREATE "];

/// Executes SQL queries against the application database.
pub struct DatabaseTool {
    db: Arc<Database>,
    allowed_tables: Vec<String>,
    read_only: bool,
}

impl DatabaseTool {
    pub fn new(db: Arc<Database>, allowed_tables: Vec<String>, read_only: bool) -> Self {
        Self {
            db,
            allowed_tables,
            read_only,
        }
    }

    fn run_select(&self, query: &str, params: &[String]) -> Result<Value, ToolError> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare(query)
            .map_err(|e| ToolError::Execution(format!("query failed: {e}")))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter()))
            .map_err(|e| ToolError::Execution(format!("query failed: {e}")))?;

        let mut result_rows: Vec<Value> = Vec::new();
        while result_rows.len() < MAX_ROWS {
            let row = match rows
                .next()
                .map_err(|e| ToolError::Execution(format!("failed to scan row: {e}")))?
            {
                Some(row) => row,
                None => break,
            };
            let mut object = Map::new();
            for (idx, column) in columns.iter().enumerate() {
                let value = row
                    .get_ref(idx)
                    .map_err(|e| ToolError::Execution(format!("failed to scan row: {e}")))?;
                object.insert(column.clone(), value_ref_to_json(value));
            }
            result_rows.push(Value::Object(object));
        }

        Ok(json!({"columns": columns, "rows": result_rows}))
    }

    fn run_modify(&self, query: &str, params: &[String]) -> Result<Value, ToolError> {
        let conn = self.db.conn();
        let affected = conn
            .execute(query, rusqlite::params_from_iter(params.iter()))
            .map_err(|e| ToolError::Execution(format!("query failed: {e}")))?;
        Ok(json!({
            "rows_affected": affected as i64,
            "last_insert_id": conn.last_insert_rowid(),
        }))
    }

    /// Table and column metadata, filtered by the allowed-tables list
    /// (empty = all non-internal tables).
    pub fn schema(&self) -> Result<SchemaInfo, ToolError> {
        let conn = self.db.conn();
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(|e| ToolError::Execution(e.to_string()))?
            .collect::<Result<_, _>>()
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        let mut schema = SchemaInfo { tables: Vec::new() };
        for name in names {
            if !self.allowed_tables.is_empty() && !self.allowed_tables.contains(&name) {
                continue;
            }
            let mut col_stmt = conn
                .prepare(&format!("PRAGMA table_info({name})"))
                .map_err(|e| ToolError::Execution(e.to_string()))?;
            let columns = col_stmt
                .query_map([], |row| {
                    Ok(ColumnInfo {
                        name: row.get(1)?,
                        kind: row.get(2)?,
                        nullable: row.get::<_, i64>(3)? == 0,
                        pk: row.get::<_, i64>(5)? == 1,
                    })
                })
                .map_err(|e| ToolError::Execution(e.to_string()))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ToolError::Execution(e.to_string()))?;
            schema.tables.push(TableInfo { name, columns });
        }
        Ok(schema)
    }
}

/// Database schema description.
#[derive(Debug, Serialize)]
pub struct SchemaInfo {
    pub tables: Vec<TableInfo>,
}

#[derive(Debug, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub nullable: bool,
    pub pk: bool,
}

#[async_trait]
impl Tool for DatabaseTool {
    fn name(&self) -> &str {
        "database_query"
    }

    fn description(&self) -> String {
        let mut desc = String::from("Executes SQL queries against the database. ");
        if self.read_only {
            desc.push_str("Only SELECT queries are allowed. ");
        } else {
            desc.push_str("Supports SELECT, INSERT, UPDATE, and DELETE queries. ");
        }
        if !self.allowed_tables.is_empty() {
            desc.push_str(&format!("Allowed tables: {}", self.allowed_tables.join(", ")));
        }
        desc
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "SQL query to execute"
                },
                "params": {
                    "type": "array",
                    "description": "Query parameters (for parameterized queries)",
                    "items": {"type": "string"}
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if query.is_empty() {
            return Err(ToolError::InvalidArguments("query is required".into()));
        }
        let params: Vec<String> = args
            .get("params")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let query_upper = query.trim().to_uppercase();
        let is_select = query_upper.starts_with("SELECT");

        if self.read_only && !is_select {
            return Err(ToolError::Forbidden(
                "only SELECT queries are allowed in read-only mode".into(),
            ));
        }
        if FORBIDDEN_PREFIXES.iter().any(|p| query_upper.starts_with(p)) {
            return Err(ToolError::Forbidden("DDL operations are not allowed".into()));
        }

        if is_select {
            self.run_select(&query, &params)
        } else {
            self.run_modify(&query, &params)
        }
    }
}

/// Schema-introspection companion to `database_query`.
pub struct DatabaseSchemaTool {
    inner: Arc<DatabaseTool>,
}

impl DatabaseSchemaTool {
    pub fn new(inner: Arc<DatabaseTool>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Tool for DatabaseSchemaTool {
    fn name(&self) -> &str {
        "database_schema"
    }

    fn description(&self) -> String {
        "Returns table and column metadata for the database, so queries can be \
         written against the actual schema."
            .into()
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _ctx: &ToolContext, _args: Value) -> Result<Value, ToolError> {
        let schema = self.inner.schema()?;
        serde_json::to_value(schema).map_err(|e| ToolError::Execution(e.to_string()))
    }
}

fn value_ref_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        // Byte strings are coerced to text for readability.
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(read_only: bool) -> DatabaseTool {
        let db = Arc::new(Database::open_in_memory().unwrap());
        DatabaseTool::new(db, Vec::new(), read_only)
    }

    #[tokio::test]
    async fn rejects_ddl_operations() {
        let tool = tool(false);
        for query in [
            "DROP TABLE emails",
            "truncate table emails",
            "ALTER TABLE emails ADD COLUMN x",
            "CREATE TABLE evil (id)",
        ] {
            let err = tool
                .execute(&ToolContext::detached(), json!({"query": query}))
                .await
                .unwrap_err();
            assert_eq!(err.to_string(), "DDL operations are not allowed", "{query}");
        }
    }

    #[tokio::test]
    async fn read_only_rejects_non_select() {
        let tool = tool(true);
        let err = tool
            .execute(
                &ToolContext::detached(),
                json!({"query": "DELETE FROM emails"}),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "only SELECT queries are allowed in read-only mode"
        );
    }

    #[tokio::test]
    async fn read_only_allows_select() {
        let tool = tool(true);
        let result = tool
            .execute(
                &ToolContext::detached(),
                json!({"query": "SELECT COUNT(*) AS n FROM emails"}),
            )
            .await
            .unwrap();
        assert_eq!(result["rows"][0]["n"], 0);
    }

    #[tokio::test]
    async fn empty_query_is_invalid() {
        let err = tool(false)
            .execute(&ToolContext::detached(), json!({"query": ""}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid arguments: query is required");
    }

    #[tokio::test]
    async fn modify_returns_rows_affected_and_last_id() {
        let tool = tool(false);
        let ctx = ToolContext::detached();
        let result = tool
            .execute(
                &ctx,
                json!({
                    "query": "INSERT INTO emails (message_id, from_addr, to_addrs, received_at)
                              VALUES (?1, ?2, ?3, ?4)",
                    "params": ["<t@x>", "a@b.com", "[]", "2026-01-01T00:00:00Z"]
                }),
            )
            .await
            .unwrap();
        assert_eq!(result["rows_affected"], 1);
        assert!(result["last_insert_id"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn select_materializes_rows_with_columns() {
        let tool = tool(false);
        let ctx = ToolContext::detached();
        tool.execute(
            &ctx,
            json!({
                "query": "INSERT INTO emails (message_id, from_addr, to_addrs, received_at)
                          VALUES ('<s@x>', 'a@b.com', '[]', '2026-01-01T00:00:00Z')"
            }),
        )
        .await
        .unwrap();

        let result = tool
            .execute(
                &ctx,
                json!({"query": "SELECT message_id, from_addr FROM emails"}),
            )
            .await
            .unwrap();
        assert_eq!(result["columns"], json!(["message_id", "from_addr"]));
        assert_eq!(result["rows"][0]["message_id"], "<s@x>");
        assert_eq!(result["rows"][0]["from_addr"], "a@b.com");
    }

    #[tokio::test]
    async fn schema_lists_tables_and_respects_allow_list() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let open = DatabaseTool::new(Arc::clone(&db), Vec::new(), true);
        let all = open.schema().unwrap();
        let names: Vec<&str> = all.tables.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"emails"));
        assert!(names.contains(&"tool_calls"));

        let restricted = DatabaseTool::new(db, vec!["emails".into()], true);
        let filtered = restricted.schema().unwrap();
        assert_eq!(filtered.tables.len(), 1);
        assert_eq!(filtered.tables[0].name, "emails");
        assert!(filtered.tables[0].columns.iter().any(|c| c.name == "message_id"));
    }
}

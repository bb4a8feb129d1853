//! Driver abstraction.
//!
//! The unit of work never builds SQL text itself. It hands drivers
//! structured [`Statement`]s (one table, a column list and one or more
//! rows) and reads back a [`QueryResult`]. Drivers that speak SQL can
//! render a statement with [`Statement::to_sql`]; others (document stores,
//! the in-memory driver) interpret the structure directly.
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation and timeout handling.

use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// What a driver can do in a single statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// `INSERT` may carry more than one row
    pub multi_row_insert: bool,
    /// `UPDATE` may carry more than one keyed row
    pub multi_row_update: bool,
    /// `DELETE` may carry more than one key
    pub batch_delete: bool,
    /// Inserts can return generated columns inline
    pub returning: bool,
    /// A multi-row insert assigns auto-increment keys consecutively from
    /// `insert_id`
    pub sequential_insert_ids: bool,
}

impl Capabilities {
    /// Everything enabled.
    pub const fn all() -> Self {
        Self {
            multi_row_insert: true,
            multi_row_update: true,
            batch_delete: true,
            returning: true,
            sequential_insert_ids: true,
        }
    }
}

/// Row-lock request passed through to the driver on reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Plain read
    #[default]
    None,
    /// Shared lock (`FOR SHARE`)
    PessimisticRead,
    /// Exclusive lock (`FOR UPDATE`)
    PessimisticWrite,
}

impl LockMode {
    /// SQL suffix for this lock mode.
    pub const fn as_sql(self) -> &'static str {
        match self {
            LockMode::None => "",
            LockMode::PessimisticRead => " FOR SHARE",
            LockMode::PessimisticWrite => " FOR UPDATE",
        }
    }
}

/// Optimistic-lock predicate attached to an update or delete row.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionCheck {
    pub column: String,
    pub expected: Value,
}

/// A (possibly multi-row) insert into one table.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    pub columns: Vec<String>,
    /// One value per column, per row
    pub rows: Vec<Vec<Value>>,
    /// Columns the driver should return for each inserted row
    pub returning: Vec<String>,
}

/// One keyed row of an update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRow {
    /// Values of the key columns
    pub key: Vec<Value>,
    /// One value per updated column
    pub values: Vec<Value>,
    pub version: Option<VersionCheck>,
}

/// A (possibly multi-row) update of one table.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub key_columns: Vec<String>,
    pub columns: Vec<String>,
    pub rows: Vec<UpdateRow>,
}

/// One keyed row of a delete.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRow {
    pub key: Vec<Value>,
    pub version: Option<VersionCheck>,
}

/// A (possibly multi-key) delete from one table.
///
/// `key_columns` need not be the table's primary key: pivot cleanup deletes
/// every link row of an owner by the owner columns alone.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub key_columns: Vec<String>,
    pub rows: Vec<DeleteRow>,
}

/// A write statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

impl Statement {
    /// Target table.
    pub fn table(&self) -> &str {
        match self {
            Statement::Insert(s) => &s.table,
            Statement::Update(s) => &s.table,
            Statement::Delete(s) => &s.table,
        }
    }

    /// Number of rows the statement carries.
    pub fn row_count(&self) -> usize {
        match self {
            Statement::Insert(s) => s.rows.len(),
            Statement::Update(s) => s.rows.len(),
            Statement::Delete(s) => s.rows.len(),
        }
    }

    /// Short verb for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Insert(_) => "insert",
            Statement::Update(_) => "update",
            Statement::Delete(_) => "delete",
        }
    }

    /// Render as parameterized SQL with `$n` placeholders and quoted identifiers.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = match self {
            Statement::Insert(s) => render_insert(s, &mut params),
            Statement::Update(s) => render_update(s, &mut params),
            Statement::Delete(s) => render_delete(s, &mut params),
        };
        (sql, params)
    }
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn placeholder(params: &mut Vec<Value>, value: &Value) -> String {
    params.push(value.clone());
    format!("${}", params.len())
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_insert(s: &InsertStatement, params: &mut Vec<Value>) -> String {
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ",
        quote_ident(&s.table),
        column_list(&s.columns)
    );
    let groups: Vec<String> = s
        .rows
        .iter()
        .map(|row| {
            let ph: Vec<String> = row.iter().map(|v| placeholder(params, v)).collect();
            format!("({})", ph.join(", "))
        })
        .collect();
    sql.push_str(&groups.join(", "));
    if !s.returning.is_empty() {
        sql.push_str(" RETURNING ");
        sql.push_str(&column_list(&s.returning));
    }
    sql
}

fn key_condition(
    columns: &[String],
    key: &[Value],
    version: Option<&VersionCheck>,
    params: &mut Vec<Value>,
) -> String {
    let mut parts: Vec<String> = columns
        .iter()
        .zip(key)
        .map(|(c, v)| format!("{} = {}", quote_ident(c), placeholder(params, v)))
        .collect();
    if let Some(check) = version {
        parts.push(format!(
            "{} = {}",
            quote_ident(&check.column),
            placeholder(params, &check.expected)
        ));
    }
    parts.join(" AND ")
}

fn render_update(s: &UpdateStatement, params: &mut Vec<Value>) -> String {
    let table = quote_ident(&s.table);
    if let [row] = s.rows.as_slice() {
        let set: Vec<String> = s
            .columns
            .iter()
            .zip(&row.values)
            .map(|(c, v)| format!("{} = {}", quote_ident(c), placeholder(params, v)))
            .collect();
        let cond = key_condition(&s.key_columns, &row.key, row.version.as_ref(), params);
        return format!("UPDATE {} SET {} WHERE {}", table, set.join(", "), cond);
    }

    // UPDATE t SET c = CASE WHEN <key> THEN $n ... ELSE c END WHERE (<key>) OR ...
    let mut set = Vec::with_capacity(s.columns.len());
    for (i, column) in s.columns.iter().enumerate() {
        let mut case = format!("{} = CASE", quote_ident(column));
        for row in &s.rows {
            let cond = key_condition(&s.key_columns, &row.key, row.version.as_ref(), params);
            let value = row.values.get(i).cloned().unwrap_or(Value::Null);
            case.push_str(&format!(" WHEN {} THEN {}", cond, placeholder(params, &value)));
        }
        case.push_str(&format!(" ELSE {} END", quote_ident(column)));
        set.push(case);
    }
    let conds: Vec<String> = s
        .rows
        .iter()
        .map(|row| {
            format!(
                "({})",
                key_condition(&s.key_columns, &row.key, row.version.as_ref(), params)
            )
        })
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {}",
        table,
        set.join(", "),
        conds.join(" OR ")
    )
}

fn render_delete(s: &DeleteStatement, params: &mut Vec<Value>) -> String {
    let table = quote_ident(&s.table);
    let simple = s.key_columns.len() == 1 && s.rows.iter().all(|r| r.version.is_none());
    if simple && s.rows.len() > 1 {
        let ph: Vec<String> = s
            .rows
            .iter()
            .filter_map(|r| r.key.first())
            .map(|v| placeholder(params, v))
            .collect();
        return format!(
            "DELETE FROM {} WHERE {} IN ({})",
            table,
            quote_ident(&s.key_columns[0]),
            ph.join(", ")
        );
    }
    let conds: Vec<String> = s
        .rows
        .iter()
        .map(|row| key_condition(&s.key_columns, &row.key, row.version.as_ref(), params))
        .collect();
    if conds.len() == 1 {
        format!("DELETE FROM {} WHERE {}", table, conds[0])
    } else {
        let wrapped: Vec<String> = conds.into_iter().map(|c| format!("({})", c)).collect();
        format!("DELETE FROM {} WHERE {}", table, wrapped.join(" OR "))
    }
}

/// Filter on a read.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `column = value`
    Eq(String, Value),
    /// `column IN (values)`
    In(String, Vec<Value>),
    /// `column IS NULL`
    IsNull(String),
}

impl Condition {
    /// Equality shorthand.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Eq(column.into(), value.into())
    }

    /// Whether a stored value satisfies this condition.
    pub fn matches(&self, lookup: impl Fn(&str) -> Option<Value>) -> bool {
        match self {
            Condition::Eq(column, expected) => {
                lookup(column).is_some_and(|v| !v.is_null() && values_match(&v, expected))
            }
            Condition::In(column, candidates) => lookup(column)
                .is_some_and(|v| !v.is_null() && candidates.iter().any(|c| values_match(&v, c))),
            Condition::IsNull(column) => lookup(column).is_none_or(|v| v.is_null()),
        }
    }
}

/// SQL-style equality: integers compare across widths.
pub fn values_match(a: &Value, b: &Value) -> bool {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) if !matches!(a, Value::Bool(_)) && !matches!(b, Value::Bool(_)) => {
            x == y
        }
        _ => a == b,
    }
}

/// A keyed read.
#[derive(Debug, Clone, PartialEq)]
pub struct FindRequest {
    pub table: String,
    /// Conjunction of conditions
    pub conditions: Vec<Condition>,
    pub lock: LockMode,
    pub limit: Option<usize>,
}

impl FindRequest {
    /// Read every row of a table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            conditions: Vec::new(),
            lock: LockMode::None,
            limit: None,
        }
    }

    /// Add a condition.
    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Request a row lock.
    pub fn lock(mut self, lock: LockMode) -> Self {
        self.lock = lock;
        self
    }

    /// Cap the number of rows.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Render as parameterized SQL.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!("SELECT * FROM {}", quote_ident(&self.table));
        let conds: Vec<String> = self
            .conditions
            .iter()
            .map(|c| match c {
                Condition::Eq(column, v) => {
                    format!("{} = {}", quote_ident(column), placeholder(&mut params, v))
                }
                Condition::In(column, vs) => {
                    let ph: Vec<String> = vs.iter().map(|v| placeholder(&mut params, v)).collect();
                    format!("{} IN ({})", quote_ident(column), ph.join(", "))
                }
                Condition::IsNull(column) => format!("{} IS NULL", quote_ident(column)),
            })
            .collect();
        if !conds.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conds.join(" AND "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        sql.push_str(self.lock.as_sql());
        (sql, params)
    }
}

/// Outcome of executing a write statement.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub affected_rows: u64,
    /// Generated key of the first inserted row
    pub insert_id: Option<i64>,
    /// `RETURNING` rows, one per inserted row, in insertion order
    pub rows: Vec<Row>,
}

/// A database connection the unit of work can flush through.
///
/// Implementations must be safe to share across tasks; concurrent sessions
/// may hold the same connection behind an `Arc`.
pub trait Connection: Send + Sync {
    /// Statement shapes this driver accepts.
    fn capabilities(&self) -> Capabilities;

    /// Execute one write statement.
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<QueryResult, crate::Error>> + Send;

    /// Execute a keyed read.
    fn find(
        &self,
        cx: &Cx,
        request: &FindRequest,
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Begin a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Commit the current transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Roll back the current transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_multi_row_insert_with_returning() {
        let stmt = Statement::Insert(InsertStatement {
            table: "book".into(),
            columns: vec!["title".into(), "author_id".into()],
            rows: vec![
                vec![Value::from("B1"), Value::BigInt(1)],
                vec![Value::from("B2"), Value::BigInt(1)],
            ],
            returning: vec!["id".into()],
        });
        let (sql, params) = stmt.to_sql();
        assert_eq!(
            sql,
            "INSERT INTO \"book\" (\"title\", \"author_id\") VALUES ($1, $2), ($3, $4) RETURNING \"id\""
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn renders_versioned_update() {
        let stmt = Statement::Update(UpdateStatement {
            table: "post".into(),
            key_columns: vec!["id".into()],
            columns: vec!["title".into(), "version".into()],
            rows: vec![UpdateRow {
                key: vec![Value::BigInt(7)],
                values: vec![Value::from("t"), Value::BigInt(3)],
                version: Some(VersionCheck {
                    column: "version".into(),
                    expected: Value::BigInt(2),
                }),
            }],
        });
        let (sql, params) = stmt.to_sql();
        assert_eq!(
            sql,
            "UPDATE \"post\" SET \"title\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4"
        );
        assert_eq!(params[3], Value::BigInt(2));
    }

    #[test]
    fn renders_batched_delete_as_in_list() {
        let stmt = Statement::Delete(DeleteStatement {
            table: "tag".into(),
            key_columns: vec!["id".into()],
            rows: vec![
                DeleteRow {
                    key: vec![Value::BigInt(1)],
                    version: None,
                },
                DeleteRow {
                    key: vec![Value::BigInt(2)],
                    version: None,
                },
            ],
        });
        assert_eq!(stmt.to_sql().0, "DELETE FROM \"tag\" WHERE \"id\" IN ($1, $2)");
        assert_eq!(stmt.row_count(), 2);
    }

    #[test]
    fn find_request_renders_lock_mode() {
        let req = FindRequest::new("author")
            .filter(Condition::eq("id", 1_i64))
            .lock(LockMode::PessimisticWrite);
        assert_eq!(
            req.to_sql().0,
            "SELECT * FROM \"author\" WHERE \"id\" = $1 FOR UPDATE"
        );
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn conditions_match_across_integer_widths() {
        let cond = Condition::eq("id", 5_i32);
        assert!(cond.matches(|_| Some(Value::BigInt(5))));
        assert!(!cond.matches(|_| Some(Value::Null)));
        assert!(Condition::IsNull("x".into()).matches(|_| None));
    }
}

//! In-memory relational driver for entmodel.
//!
//! [`MemoryConnection`] keeps each table as a list of rows and enforces the
//! integrity rules a relational database would: primary keys are unique,
//! NOT NULL columns hold values, and every non-null foreign key points at an
//! existing row. Violations come back as [`Error::Query`] carrying the
//! standard SQLSTATE code, so the session translates them exactly as it would
//! for a network driver.
//!
//! Each statement is atomic: one that breaks a constraint leaves the tables
//! untouched. Transactions nest; `begin` saves a copy of every table and
//! `rollback` restores it.
//!
//! The connection also records every statement and read it receives, which
//! is what most session tests assert against.
//!
//! # Example
//!
//! ```ignore
//! let conn = Arc::new(MemoryConnection::from_registry(&registry));
//! let session = Session::new(Arc::clone(&conn), Arc::new(registry));
//! // ... persist and flush ...
//! assert_eq!(conn.rows("author").len(), 1);
//! ```

#![allow(clippy::result_large_err)]

use entmodel_core::{
    Capabilities, Connection, Cx, DeleteStatement, Error, FindRequest, InsertStatement,
    LockMode, MetadataRegistry, Outcome, QueryError, QueryErrorKind, QueryResult, Result, Row,
    Statement, UpdateStatement, Value, VersionCheck, values_match,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const NOT_NULL_VIOLATION: &str = "23502";

/// A column of an in-memory table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub nullable: bool,
    /// Value stored when an insert omits the column
    pub default: Option<Value>,
    /// Filled from the table's sequence when omitted
    pub auto_increment: bool,
    /// Filled by the database when omitted, from a sequence separate from
    /// the key's
    pub generated: bool,
}

impl ColumnSchema {
    /// A nullable column with no default.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nullable: true,
            default: None,
            auto_increment: false,
            generated: false,
        }
    }

    /// Reject NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Fill from the table's sequence.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self.nullable = false;
        self
    }

    /// Fill from the table's generated-value sequence.
    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    /// Store `value` when an insert omits the column.
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// A foreign key from `columns` to `references` in `table`.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub table: String,
    pub references: Vec<String>,
}

/// Shape and constraints of an in-memory table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    /// An empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Add a column, ignoring it if one with the same name exists.
    pub fn column(mut self, column: ColumnSchema) -> Self {
        self.add_column(column);
        self
    }

    /// Set the primary-key columns.
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Add a foreign key.
    pub fn foreign_key(mut self, fk: ForeignKey) -> Self {
        self.add_foreign_key(fk);
        self
    }

    fn add_column(&mut self, column: ColumnSchema) {
        if self.index_of(&column.name).is_none() {
            self.columns.push(column);
        }
    }

    fn add_foreign_key(&mut self, fk: ForeignKey) {
        if !self.foreign_keys.contains(&fk) {
            self.foreign_keys.push(fk);
        }
    }

    fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Derive table schemas from entity metadata.
///
/// Entities sharing a table (single-table inheritance) contribute the union
/// of their columns; columns only subtypes declare are nullable. Owning
/// to-one relations become foreign keys and owning many-to-many relations
/// become pivot tables keyed on both sides.
pub fn schema_from_registry(registry: &MetadataRegistry) -> Vec<TableSchema> {
    let mut tables: BTreeMap<String, TableSchema> = BTreeMap::new();

    // Roots first so inherited columns keep the root's nullability.
    let mut entities: Vec<_> = registry.entities().collect();
    entities.sort_by_key(|meta| meta.extends.is_some());

    for meta in entities {
        let subtype = meta.extends.is_some();
        let table = tables
            .entry(meta.table.clone())
            .or_insert_with(|| TableSchema::new(meta.table.clone()));
        if table.primary_key.is_empty() {
            table.primary_key = meta.primary_key_columns();
        }
        if let Some(column) = &meta.discriminator_column {
            table.add_column(ColumnSchema::new(column.clone()).not_null());
        }
        for prop in &meta.properties {
            table.add_column(ColumnSchema {
                name: prop.column.clone(),
                nullable: prop.nullable || subtype,
                default: prop.default.clone(),
                auto_increment: prop.auto_increment,
                generated: prop.generated,
            });
        }
        for rel in meta.owning_to_one() {
            let Some(target) = registry.get(&rel.target) else {
                continue;
            };
            for column in &rel.join_columns {
                let mut schema = ColumnSchema::new(column.clone());
                schema.nullable = rel.nullable || subtype;
                table.add_column(schema);
            }
            table.add_foreign_key(ForeignKey {
                columns: rel.join_columns.clone(),
                table: target.table.clone(),
                references: target.primary_key_columns(),
            });
        }

        let pivots: Vec<_> = meta
            .relations
            .iter()
            .filter(|r| r.is_owning_many_to_many())
            .filter_map(|r| Some((r.pivot.clone()?, registry.get(&r.target)?)))
            .collect();
        for (pivot, target) in pivots {
            let mut schema = TableSchema::new(pivot.table.clone())
                .primary_key(pivot.owner_columns.iter().chain(&pivot.target_columns).cloned())
                .foreign_key(ForeignKey {
                    columns: pivot.owner_columns.clone(),
                    table: meta.table.clone(),
                    references: meta.primary_key_columns(),
                })
                .foreign_key(ForeignKey {
                    columns: pivot.target_columns.clone(),
                    table: target.table.clone(),
                    references: target.primary_key_columns(),
                });
            for column in pivot.owner_columns.iter().chain(&pivot.target_columns) {
                schema.add_column(ColumnSchema::new(column.clone()).not_null());
            }
            tables.entry(pivot.table.clone()).or_insert(schema);
        }
    }
    tables.into_values().collect()
}

/// Options for a [`MemoryConnection`].
#[derive(Debug, Clone, Copy)]
pub struct MemoryOptions {
    /// Statement shapes the connection advertises
    pub capabilities: Capabilities,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            capabilities: Capabilities::all(),
        }
    }
}

impl MemoryOptions {
    /// Advertise `capabilities`.
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Where an injected failure fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailurePoint {
    /// An insert into the table
    Insert(String),
    /// An update of the table
    Update(String),
    /// A delete from the table
    Delete(String),
    /// A read of the table
    Find(String),
    Begin,
    Commit,
    Rollback,
}

impl FailurePoint {
    fn matches_statement(&self, statement: &Statement) -> bool {
        match (self, statement) {
            (FailurePoint::Insert(t), Statement::Insert(s)) => *t == s.table,
            (FailurePoint::Update(t), Statement::Update(s)) => *t == s.table,
            (FailurePoint::Delete(t), Statement::Delete(s)) => *t == s.table,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct Table {
    schema: TableSchema,
    rows: Vec<Vec<Value>>,
    /// Auto-increment key sequence
    next_id: i64,
    /// Sequence for other database-generated columns
    next_generated: i64,
}

impl Table {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
            next_id: 1,
            next_generated: 1,
        }
    }

    fn lookup<'a>(&'a self, row: &'a [Value]) -> impl Fn(&str) -> Option<Value> + 'a {
        move |column| {
            self.schema
                .index_of(column)
                .and_then(|i| row.get(i))
                .cloned()
        }
    }

    fn key_matches(&self, row: &[Value], columns: &[String], key: &[Value]) -> bool {
        columns.len() == key.len()
            && columns.iter().zip(key).all(|(column, expected)| {
                self.schema
                    .index_of(column)
                    .and_then(|i| row.get(i))
                    .is_some_and(|v| !v.is_null() && values_match(v, expected))
            })
    }

    fn version_matches(&self, row: &[Value], check: Option<&VersionCheck>) -> bool {
        let Some(check) = check else {
            return true;
        };
        self.schema
            .index_of(&check.column)
            .and_then(|i| row.get(i))
            .is_some_and(|v| values_match(v, &check.expected))
    }

    fn values_of(&self, row: &[Value], columns: &[String]) -> Vec<Value> {
        columns
            .iter()
            .map(|c| {
                self.schema
                    .index_of(c)
                    .and_then(|i| row.get(i))
                    .cloned()
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    fn to_row(&self, row: &[Value]) -> Row {
        Row::new(self.schema.column_names(), row.to_vec())
    }
}

type Tables = BTreeMap<String, Table>;

#[derive(Debug, Default)]
struct MemoryState {
    tables: Tables,
    savepoints: Vec<Tables>,
    statements: Vec<Statement>,
    reads: Vec<FindRequest>,
    failures: Vec<(FailurePoint, Error)>,
}

impl MemoryState {
    fn take_failure(&mut self, matches: impl Fn(&FailurePoint) -> bool) -> Option<Error> {
        let index = self.failures.iter().position(|(point, _)| matches(point))?;
        Some(self.failures.remove(index).1)
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables.get_mut(name).ok_or_else(|| no_table(name))
    }
}

fn query_error(sqlstate: Option<&str>, message: String) -> Error {
    Error::Query(QueryError {
        kind: if sqlstate.is_some() {
            QueryErrorKind::Constraint
        } else {
            QueryErrorKind::Database
        },
        sql: None,
        sqlstate: sqlstate.map(str::to_string),
        message,
        source: None,
    })
}

fn no_table(name: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::NotFound,
        sql: None,
        sqlstate: Some("42P01".to_string()),
        message: format!("relation \"{}\" does not exist", name),
        source: None,
    })
}

fn no_column(table: &str, column: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::NotFound,
        sql: None,
        sqlstate: Some("42703".to_string()),
        message: format!("column \"{}\" of relation \"{}\" does not exist", column, table),
        source: None,
    })
}

fn render(values: &[Value]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Check every table against its constraints.
fn check_integrity(tables: &Tables) -> Result<()> {
    for table in tables.values() {
        let schema = &table.schema;
        for row in &table.rows {
            for (column, value) in schema.columns.iter().zip(row) {
                if !column.nullable && value.is_null() {
                    return Err(query_error(
                        Some(NOT_NULL_VIOLATION),
                        format!(
                            "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                            column.name, schema.name
                        ),
                    ));
                }
            }
        }

        if !schema.primary_key.is_empty() {
            for (i, row) in table.rows.iter().enumerate() {
                let key = table.values_of(row, &schema.primary_key);
                let duplicate = table.rows[..i]
                    .iter()
                    .any(|other| table.key_matches(other, &schema.primary_key, &key));
                if duplicate {
                    return Err(query_error(
                        Some(UNIQUE_VIOLATION),
                        format!(
                            "duplicate key value violates unique constraint \"{}_pkey\": ({})",
                            schema.name,
                            render(&key)
                        ),
                    ));
                }
            }
        }

        for fk in &schema.foreign_keys {
            let Some(target) = tables.get(&fk.table) else {
                return Err(no_table(&fk.table));
            };
            for row in &table.rows {
                let key = table.values_of(row, &fk.columns);
                if key.iter().any(Value::is_null) {
                    continue;
                }
                let found = target
                    .rows
                    .iter()
                    .any(|candidate| target.key_matches(candidate, &fk.references, &key));
                if !found {
                    return Err(query_error(
                        Some(FOREIGN_KEY_VIOLATION),
                        format!(
                            "foreign key on table \"{}\" references a missing row of \"{}\": ({}) = ({})",
                            schema.name,
                            fk.table,
                            fk.columns.join(", "),
                            render(&key)
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn apply_insert(state: &mut MemoryState, s: &InsertStatement) -> Result<QueryResult> {
    let table = state.table_mut(&s.table)?;
    let mut positions = Vec::with_capacity(s.columns.len());
    for column in &s.columns {
        positions.push(
            table
                .schema
                .index_of(column)
                .ok_or_else(|| no_column(&s.table, column))?,
        );
    }
    for column in &s.returning {
        if table.schema.index_of(column).is_none() {
            return Err(no_column(&s.table, column));
        }
    }

    let mut result = QueryResult::default();
    for values in &s.rows {
        let mut row: Vec<Value> = vec![Value::Null; table.schema.columns.len()];
        let mut provided = vec![false; row.len()];
        for (&i, value) in positions.iter().zip(values) {
            row[i] = value.clone();
            provided[i] = true;
        }

        let mut generated_id = None;
        for (i, column) in table.schema.columns.iter().enumerate() {
            if provided[i] {
                if column.auto_increment {
                    if let Some(id) = row[i].as_i64() {
                        table.next_id = table.next_id.max(id.saturating_add(1));
                    }
                }
                continue;
            }
            if column.auto_increment {
                let id = table.next_id;
                table.next_id = id.saturating_add(1);
                row[i] = Value::BigInt(id);
                generated_id = Some(id);
            } else if let Some(default) = &column.default {
                row[i] = default.clone();
            } else if column.generated {
                let value = table.next_generated;
                table.next_generated = value.saturating_add(1);
                row[i] = Value::BigInt(value);
            }
        }

        if result.insert_id.is_none() {
            result.insert_id = generated_id;
        }
        if !s.returning.is_empty() {
            let returned = table.values_of(&row, &s.returning);
            result.rows.push(Row::new(s.returning.clone(), returned));
        }
        table.rows.push(row);
        result.affected_rows += 1;
    }
    Ok(result)
}

fn apply_update(state: &mut MemoryState, s: &UpdateStatement) -> Result<QueryResult> {
    let table = state.table_mut(&s.table)?;
    let mut positions = Vec::with_capacity(s.columns.len());
    for column in &s.columns {
        positions.push(
            table
                .schema
                .index_of(column)
                .ok_or_else(|| no_column(&s.table, column))?,
        );
    }

    let mut affected = 0;
    for update in &s.rows {
        let mut targets = Vec::new();
        for (index, row) in table.rows.iter().enumerate() {
            if table.key_matches(row, &s.key_columns, &update.key)
                && table.version_matches(row, update.version.as_ref())
            {
                targets.push(index);
            }
        }
        for index in targets {
            for (&i, value) in positions.iter().zip(&update.values) {
                table.rows[index][i] = value.clone();
            }
            affected += 1;
        }
    }
    Ok(QueryResult {
        affected_rows: affected,
        ..QueryResult::default()
    })
}

fn apply_delete(state: &mut MemoryState, s: &DeleteStatement) -> Result<QueryResult> {
    let table = state.table_mut(&s.table)?;
    let before = table.rows.len();
    let rows = std::mem::take(&mut table.rows);
    let kept: Vec<Vec<Value>> = rows
        .into_iter()
        .filter(|row| {
            !s.rows.iter().any(|delete| {
                table.key_matches(row, &s.key_columns, &delete.key)
                    && table.version_matches(row, delete.version.as_ref())
            })
        })
        .collect();
    let affected = before - kept.len();
    table.rows = kept;
    Ok(QueryResult {
        affected_rows: affected as u64,
        ..QueryResult::default()
    })
}

/// In-memory relational connection.
///
/// Cloning shares the underlying tables, so a test can hand one clone to a
/// session and inspect the database through another.
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
    options: MemoryOptions,
}

impl MemoryConnection {
    /// Create a connection over explicit table schemas.
    pub fn new(schemas: Vec<TableSchema>, options: MemoryOptions) -> Self {
        let tables = schemas
            .into_iter()
            .map(|schema| (schema.name.clone(), Table::new(schema)))
            .collect();
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                tables,
                ..MemoryState::default()
            })),
            options,
        }
    }

    /// Create a connection whose tables mirror the registry's entities.
    pub fn from_registry(registry: &MetadataRegistry) -> Self {
        Self::with_options(registry, MemoryOptions::default())
    }

    /// Like [`from_registry`](Self::from_registry), with options.
    pub fn with_options(registry: &MetadataRegistry, options: MemoryOptions) -> Self {
        Self::new(schema_from_registry(registry), options)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schema of a table.
    pub fn schema(&self, table: &str) -> Option<TableSchema> {
        self.lock().tables.get(table).map(|t| t.schema.clone())
    }

    /// Current rows of a table, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        let state = self.lock();
        state
            .tables
            .get(table)
            .map(|t| t.rows.iter().map(|r| t.to_row(r)).collect())
            .unwrap_or_default()
    }

    /// Insert a row directly, bypassing the statement log.
    ///
    /// Constraints are still enforced.
    pub fn raw_insert<I, S>(&self, table: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let (columns, values): (Vec<String>, Vec<Value>) =
            values.into_iter().map(|(c, v)| (c.into(), v)).unzip();
        let statement = InsertStatement {
            table: table.to_string(),
            columns,
            rows: vec![values],
            returning: Vec::new(),
        };
        let mut state = self.lock();
        atomically(&mut state, |s| apply_insert(s, &statement)).map(|_| ())
    }

    /// Set one column of the rows matching `key` directly, bypassing the
    /// statement log. Returns the number of rows changed.
    ///
    /// Stands in for a write made by another process.
    pub fn raw_update(
        &self,
        table: &str,
        key: Vec<(String, Value)>,
        column: &str,
        value: impl Into<Value>,
    ) -> Result<u64> {
        let (key_columns, key): (Vec<String>, Vec<Value>) = key.into_iter().unzip();
        let statement = UpdateStatement {
            table: table.to_string(),
            key_columns,
            columns: vec![column.to_string()],
            rows: vec![entmodel_core::UpdateRow {
                key,
                values: vec![value.into()],
                version: None,
            }],
        };
        let mut state = self.lock();
        atomically(&mut state, |s| apply_update(s, &statement)).map(|r| r.affected_rows)
    }

    /// Statements executed so far.
    pub fn statements(&self) -> Vec<Statement> {
        self.lock().statements.clone()
    }

    /// Reads executed so far.
    pub fn reads(&self) -> Vec<FindRequest> {
        self.lock().reads.clone()
    }

    /// Lock modes of the reads executed so far.
    pub fn lock_modes(&self) -> Vec<LockMode> {
        self.lock().reads.iter().map(|r| r.lock).collect()
    }

    /// Forget recorded statements and reads.
    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.statements.clear();
        state.reads.clear();
    }

    /// Fail the next operation matching `point` with `error`.
    ///
    /// Each injected failure fires once.
    pub fn fail_on(&self, point: FailurePoint, error: Error) {
        self.lock().failures.push((point, error));
    }

    /// Whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        !self.lock().savepoints.is_empty()
    }

    fn execute_sync(&self, statement: &Statement) -> Result<QueryResult> {
        let mut state = self.lock();
        if let Some(error) = state.take_failure(|p| p.matches_statement(statement)) {
            tracing::debug!(table = statement.table(), "Injected failure");
            return Err(error);
        }
        state.statements.push(statement.clone());
        let result = atomically(&mut state, |s| match statement {
            Statement::Insert(insert) => apply_insert(s, insert),
            Statement::Update(update) => apply_update(s, update),
            Statement::Delete(delete) => apply_delete(s, delete),
        })?;
        tracing::trace!(
            kind = statement.kind(),
            table = statement.table(),
            rows = statement.row_count(),
            affected = result.affected_rows,
            "Executed statement"
        );
        Ok(result)
    }

    fn find_sync(&self, request: &FindRequest) -> Result<Vec<Row>> {
        let mut state = self.lock();
        if let Some(error) =
            state.take_failure(|p| matches!(p, FailurePoint::Find(t) if *t == request.table))
        {
            return Err(error);
        }
        state.reads.push(request.clone());
        let table = state
            .tables
            .get(&request.table)
            .ok_or_else(|| no_table(&request.table))?;
        let limit = request.limit.unwrap_or(usize::MAX);
        let rows = table
            .rows
            .iter()
            .filter(|row| {
                request
                    .conditions
                    .iter()
                    .all(|condition| condition.matches(table.lookup(row)))
            })
            .take(limit)
            .map(|row| table.to_row(row))
            .collect();
        Ok(rows)
    }

    fn begin_sync(&self) -> Result<()> {
        let mut state = self.lock();
        if let Some(error) = state.take_failure(|p| *p == FailurePoint::Begin) {
            return Err(error);
        }
        let saved = state.tables.clone();
        state.savepoints.push(saved);
        tracing::trace!(depth = state.savepoints.len(), "Began transaction");
        Ok(())
    }

    fn commit_sync(&self) -> Result<()> {
        let mut state = self.lock();
        if let Some(error) = state.take_failure(|p| *p == FailurePoint::Commit) {
            return Err(error);
        }
        if state.savepoints.pop().is_none() {
            return Err(query_error(None, "Not in a transaction".to_string()));
        }
        Ok(())
    }

    fn rollback_sync(&self) -> Result<()> {
        let mut state = self.lock();
        if let Some(error) = state.take_failure(|p| *p == FailurePoint::Rollback) {
            return Err(error);
        }
        match state.savepoints.pop() {
            Some(saved) => {
                state.tables = saved;
                Ok(())
            }
            None => Err(query_error(None, "Not in a transaction".to_string())),
        }
    }
}

/// Run `f` and check constraints, restoring the tables if either fails.
fn atomically(
    state: &mut MemoryState,
    f: impl FnOnce(&mut MemoryState) -> Result<QueryResult>,
) -> Result<QueryResult> {
    let saved = state.tables.clone();
    let result = f(state).and_then(|r| check_integrity(&state.tables).map(|()| r));
    if result.is_err() {
        state.tables = saved;
    }
    result
}

impl Connection for MemoryConnection {
    fn capabilities(&self) -> Capabilities {
        self.options.capabilities
    }

    fn execute(
        &self,
        _cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<QueryResult, Error>> + Send {
        let result = self.execute_sync(statement);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn find(
        &self,
        _cx: &Cx,
        request: &FindRequest,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.find_sync(request);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.begin_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.commit_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.rollback_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }
}

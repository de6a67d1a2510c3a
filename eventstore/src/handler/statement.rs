//! Statement builder for the SQL dialect of projection tables.
//!
//! `reduce` functions describe their side effect with the builders in this
//! module and return a [`Statement`]. The SQL is rendered when the statement
//! is executed, against the table named after the projection, so builder
//! contract violations ([`StatementError::NoProjection`],
//! [`StatementError::NoValues`], [`StatementError::NoCondition`]) surface
//! from [`Statement::execute`].

use std::fmt::Write as _;

use crate::errors::StatementError;
use crate::event::Event;
use crate::types::{AggregateType, InstanceId};

use super::executor::{Executor, SqlValue};

/// How a column's value is rendered.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    /// A bound parameter.
    Bind(SqlValue),
    /// A bare reference to another column.
    Reference(String),
    /// `array_append(column, $n)`
    ArrayAppend(SqlValue),
    /// `array_remove(column, $n)`
    ArrayRemove(SqlValue),
}

/// A column and the value written to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name. Empty for literals in a copy statement.
    pub name: String,
    /// Value.
    pub value: ColumnValue,
}

impl Column {
    /// Binds `value` to `name`.
    pub fn new(name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self {
            name: name.into(),
            value: ColumnValue::Bind(value.into()),
        }
    }

    /// An unnamed value, selected as a literal by copy statements.
    pub fn literal(value: impl Into<SqlValue>) -> Self {
        Self::new("", value)
    }

    /// A column selected by name by copy statements.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, SqlValue::Null)
    }
}

/// Writes the current value of column `from` into `column`.
pub fn new_copy_col(column: impl Into<String>, from: impl Into<String>) -> Column {
    Column {
        name: column.into(),
        value: ColumnValue::Reference(from.into()),
    }
}

/// Appends `value` to the array in `column`.
pub fn new_array_append_col(column: impl Into<String>, value: impl Into<SqlValue>) -> Column {
    Column {
        name: column.into(),
        value: ColumnValue::ArrayAppend(value.into()),
    }
}

/// Removes `value` from the array in `column`.
pub fn new_array_remove_col(column: impl Into<String>, value: impl Into<SqlValue>) -> Column {
    Column {
        name: column.into(),
        value: ColumnValue::ArrayRemove(value.into()),
    }
}

/// A row predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `column = $n`
    Equals(String, SqlValue),
    /// `column <> $n`
    NotEquals(String, SqlValue),
    /// `column IS NULL`
    IsNull(String),
    /// `column @> $n`, the array column contains the value.
    TextArrayContains(String, String),
    /// `column = ANY($n)`
    OneOf(String, Vec<String>),
}

impl Condition {
    /// `column = value`
    pub fn equals(column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self::Equals(column.into(), value.into())
    }

    /// `column <> value`
    pub fn not_equals(column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self::NotEquals(column.into(), value.into())
    }

    /// `column IS NULL`
    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull(column.into())
    }

    /// The text array in `column` contains `value`.
    pub fn text_array_contains(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::TextArrayContains(column.into(), value.into())
    }

    /// `column` is one of `values`.
    pub fn one_of<I, T>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::OneOf(column.into(), values.into_iter().map(Into::into).collect())
    }

    fn render(&self, namespace: &str, params: &mut Params) -> String {
        match self {
            Self::Equals(column, value) => {
                format!("{namespace}{column} = {}", params.bind(value.clone()))
            }
            Self::NotEquals(column, value) => {
                format!("{namespace}{column} <> {}", params.bind(value.clone()))
            }
            Self::IsNull(column) => format!("{namespace}{column} IS NULL"),
            Self::TextArrayContains(column, value) => format!(
                "{namespace}{column} @> {}",
                params.bind(SqlValue::TextArray(vec![value.clone()]))
            ),
            Self::OneOf(column, values) => format!(
                "{namespace}{column} = ANY({})",
                params.bind(SqlValue::TextArray(values.clone()))
            ),
        }
    }
}

#[derive(Debug, Default)]
struct Params {
    args: Vec<SqlValue>,
}

impl Params {
    fn bind(&mut self, value: SqlValue) -> String {
        self.args.push(value);
        format!("${}", self.args.len())
    }

    fn placeholder(&self) -> String {
        format!("${}", self.args.len())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    NoOp,
    Create {
        values: Vec<Column>,
    },
    Upsert {
        conflict: Vec<String>,
        values: Vec<Column>,
    },
    Update {
        values: Vec<Column>,
        conditions: Vec<Condition>,
    },
    Delete {
        conditions: Vec<Condition>,
    },
    Copy {
        conflict: Vec<String>,
        from: Vec<Column>,
        to: Vec<Column>,
        conditions: Vec<Condition>,
    },
}

/// One SQL side effect on a projection table.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    kind: Kind,
    table_suffix: Option<String>,
}

impl Operation {
    const fn new(kind: Kind) -> Self {
        Self {
            kind,
            table_suffix: None,
        }
    }

    /// Targets `<projection>_<suffix>` instead of the projection table.
    #[must_use]
    pub fn with_table_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.table_suffix = Some(suffix.into());
        self
    }

    /// Whether the operation does nothing.
    pub const fn is_no_op(&self) -> bool {
        matches!(self.kind, Kind::NoOp)
    }

    fn table(&self, projection: &str) -> String {
        match &self.table_suffix {
            Some(suffix) if !suffix.is_empty() => format!("{projection}_{suffix}"),
            _ => projection.to_string(),
        }
    }

    /// Renders the SQL and arguments for `projection`.
    pub fn render(&self, projection: &str) -> Result<(String, Vec<SqlValue>), StatementError> {
        if projection.is_empty() {
            return Err(StatementError::NoProjection);
        }
        let table = self.table(projection);
        let mut params = Params::default();
        let sql = match &self.kind {
            Kind::NoOp => String::new(),
            Kind::Create { values } => render_insert(&table, values, &mut params)?,
            Kind::Upsert { conflict, values } => {
                render_upsert(&table, conflict, values, &mut params)?
            }
            Kind::Update { values, conditions } => {
                render_update(&table, values, conditions, &mut params)?
            }
            Kind::Delete { conditions } => {
                if conditions.is_empty() {
                    return Err(StatementError::NoCondition);
                }
                format!(
                    "DELETE FROM {table} WHERE {}",
                    render_where(conditions, &mut params)
                )
            }
            Kind::Copy {
                conflict,
                from,
                to,
                conditions,
            } => render_copy(&table, conflict, from, to, conditions, &mut params)?,
        };
        Ok((sql, params.args))
    }

    async fn execute(
        &self,
        executor: &mut dyn Executor,
        projection: &str,
    ) -> Result<(), StatementError> {
        if self.is_no_op() {
            return Ok(());
        }
        let (sql, args) = self.render(projection)?;
        executor.exec(&sql, &args).await?;
        Ok(())
    }
}

fn render_value(column: &Column, params: &mut Params) -> String {
    match &column.value {
        ColumnValue::Bind(value) => params.bind(value.clone()),
        ColumnValue::Reference(from) => from.clone(),
        ColumnValue::ArrayAppend(value) => {
            format!("array_append({}, {})", column.name, params.bind(value.clone()))
        }
        ColumnValue::ArrayRemove(value) => {
            format!("array_remove({}, {})", column.name, params.bind(value.clone()))
        }
    }
}

fn names(columns: &[Column]) -> String {
    columns
        .iter()
        .map(|column| column.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_insert(
    table: &str,
    values: &[Column],
    params: &mut Params,
) -> Result<String, StatementError> {
    if values.is_empty() {
        return Err(StatementError::NoValues);
    }
    let mut placeholders = Vec::with_capacity(values.len());
    for column in values {
        let ColumnValue::Bind(value) = &column.value else {
            return Err(StatementError::NotInsertable(column.name.clone()));
        };
        placeholders.push(params.bind(value.clone()));
    }
    Ok(format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        names(values),
        placeholders.join(", ")
    ))
}

fn render_upsert(
    table: &str,
    conflict: &[String],
    values: &[Column],
    params: &mut Params,
) -> Result<String, StatementError> {
    let mut sql = render_insert(table, values, params)?;
    let (update_columns, update_values): (Vec<&str>, Vec<String>) = values
        .iter()
        .filter(|column| !conflict.contains(&column.name))
        .map(|column| (column.name.as_str(), format!("EXCLUDED.{}", column.name)))
        .unzip();

    let _ = write!(sql, " ON CONFLICT ({})", conflict.join(", "));
    match update_columns.as_slice() {
        [] => sql.push_str(" DO NOTHING"),
        [single] => {
            let _ = write!(sql, " DO UPDATE SET {single} = {}", update_values[0]);
        }
        _ => {
            let _ = write!(
                sql,
                " DO UPDATE SET ({}) = ({})",
                update_columns.join(", "),
                update_values.join(", ")
            );
        }
    }
    Ok(sql)
}

fn render_update(
    table: &str,
    values: &[Column],
    conditions: &[Condition],
    params: &mut Params,
) -> Result<String, StatementError> {
    if values.is_empty() {
        return Err(StatementError::NoValues);
    }
    if conditions.is_empty() {
        return Err(StatementError::NoCondition);
    }
    let placeholders: Vec<String> = values
        .iter()
        .map(|column| render_value(column, params))
        .collect();
    let set = match (values, placeholders.as_slice()) {
        ([column], [placeholder]) => format!("{} = {placeholder}", column.name),
        _ => format!("({}) = ({})", names(values), placeholders.join(", ")),
    };
    Ok(format!(
        "UPDATE {table} SET {set} WHERE {}",
        render_where(conditions, params)
    ))
}

fn render_where(conditions: &[Condition], params: &mut Params) -> String {
    let rendered: Vec<String> = conditions
        .iter()
        .map(|condition| condition.render("", params))
        .collect();
    format!("({})", rendered.join(") AND ("))
}

fn render_copy(
    table: &str,
    conflict: &[String],
    from: &[Column],
    to: &[Column],
    conditions: &[Condition],
    params: &mut Params,
) -> Result<String, StatementError> {
    if from.is_empty() || from.len() != to.len() {
        return Err(StatementError::NoValues);
    }
    if conditions.is_empty() {
        return Err(StatementError::NoCondition);
    }

    let mut selected = Vec::with_capacity(from.len());
    let mut updated = Vec::with_capacity(from.len());
    for column in from {
        if column.name.is_empty() {
            let value = match &column.value {
                ColumnValue::Bind(value)
                | ColumnValue::ArrayAppend(value)
                | ColumnValue::ArrayRemove(value) => value.clone(),
                ColumnValue::Reference(_) => SqlValue::Null,
            };
            params.bind(value);
            selected.push(params.placeholder());
            updated.push(params.placeholder());
        } else {
            selected.push(column.name.clone());
            updated.push(format!("EXCLUDED.{}", column.name));
        }
    }
    let conditions: Vec<String> = conditions
        .iter()
        .map(|condition| condition.render("copy_table.", params))
        .collect();

    Ok(format!(
        "INSERT INTO {table} ({to_names}) SELECT {} FROM {table} AS copy_table WHERE {} ON CONFLICT ({}) DO UPDATE SET ({to_names}) = ({})",
        selected.join(", "),
        conditions.join(" AND "),
        conflict.join(", "),
        updated.join(", "),
        to_names = names(to),
    ))
}

/// Inserts a row.
pub fn add_create_statement(values: Vec<Column>) -> Operation {
    Operation::new(Kind::Create { values })
}

/// Inserts a row or updates the non-conflict columns of the existing one.
pub fn add_upsert_statement(conflict_columns: &[Column], values: Vec<Column>) -> Operation {
    Operation::new(Kind::Upsert {
        conflict: conflict_columns.iter().map(|c| c.name.clone()).collect(),
        values,
    })
}

/// Updates the rows matching all conditions.
pub fn add_update_statement(values: Vec<Column>, conditions: Vec<Condition>) -> Operation {
    Operation::new(Kind::Update { values, conditions })
}

/// Deletes the rows matching all conditions.
pub fn add_delete_statement(conditions: Vec<Condition>) -> Operation {
    Operation::new(Kind::Delete { conditions })
}

/// Copies the rows matching all conditions, writing column `from[i]` into
/// `to[i]`. Unnamed `from` columns are written as literals.
pub fn add_copy_statement(
    conflict_columns: &[Column],
    from: Vec<Column>,
    to: Vec<Column>,
    conditions: Vec<Condition>,
) -> Operation {
    Operation::new(Kind::Copy {
        conflict: conflict_columns.iter().map(|c| c.name.clone()).collect(),
        from,
        to,
        conditions,
    })
}

/// An operation that does nothing. Dropped from multi statements.
pub const fn add_no_op_statement() -> Operation {
    Operation::new(Kind::NoOp)
}

/// The side effect of a statement: operations run in order on one executor.
#[derive(Debug, Clone, PartialEq)]
pub struct Execute {
    operations: Vec<Operation>,
}

impl Execute {
    /// The operations, in execution order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Runs every operation against the projection's tables.
    pub async fn run(&self, executor: &mut dyn Executor, projection: &str) -> Result<(), StatementError> {
        if projection.is_empty() {
            return Err(StatementError::NoProjection);
        }
        for operation in &self.operations {
            operation.execute(executor, projection).await?;
        }
        Ok(())
    }
}

/// The result of reducing one event: an optional side effect plus the event
/// position it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Aggregate type of the reduced event.
    pub aggregate_type: AggregateType,
    /// Sequence of the reduced event.
    pub sequence: u64,
    /// Previous sequence of the same aggregate type.
    pub previous_sequence: u64,
    /// Instance of the reduced event.
    pub instance_id: InstanceId,
    execute: Option<Execute>,
}

impl Statement {
    fn from_event(event: &dyn Event, execute: Option<Execute>) -> Self {
        let aggregate = event.aggregate();
        Self {
            aggregate_type: aggregate.aggregate_type.clone(),
            sequence: event.sequence(),
            previous_sequence: event.previous_aggregate_type_sequence(),
            instance_id: aggregate.instance_id.clone(),
            execute,
        }
    }

    /// The side effect, `None` for no-op statements.
    pub const fn execute_fn(&self) -> Option<&Execute> {
        self.execute.as_ref()
    }

    /// Whether executing the statement does nothing.
    pub const fn is_no_op(&self) -> bool {
        self.execute.is_none()
    }

    /// Executes the side effect against the projection's tables.
    pub async fn execute(&self, executor: &mut dyn Executor, projection: &str) -> Result<(), StatementError> {
        match &self.execute {
            Some(execute) => execute.run(executor, projection).await,
            None => Ok(()),
        }
    }
}

/// A statement running a single operation.
pub fn new_statement(event: &dyn Event, operation: Operation) -> Statement {
    new_multi_statement(event, vec![operation])
}

/// `INSERT INTO t (a, b) VALUES ($1, $2)`
pub fn new_create_statement(event: &dyn Event, values: Vec<Column>) -> Statement {
    new_statement(event, add_create_statement(values))
}

/// `INSERT ... ON CONFLICT (k) DO UPDATE SET ...`
pub fn new_upsert_statement(event: &dyn Event, conflict_columns: &[Column], values: Vec<Column>) -> Statement {
    new_statement(event, add_upsert_statement(conflict_columns, values))
}

/// `UPDATE t SET ... WHERE ...`
pub fn new_update_statement(event: &dyn Event, values: Vec<Column>, conditions: Vec<Condition>) -> Statement {
    new_statement(event, add_update_statement(values, conditions))
}

/// `DELETE FROM t WHERE ...`
pub fn new_delete_statement(event: &dyn Event, conditions: Vec<Condition>) -> Statement {
    new_statement(event, add_delete_statement(conditions))
}

/// `INSERT ... SELECT ... FROM t AS copy_table WHERE ... ON CONFLICT ...`
pub fn new_copy_statement(
    event: &dyn Event,
    conflict_columns: &[Column],
    from: Vec<Column>,
    to: Vec<Column>,
    conditions: Vec<Condition>,
) -> Statement {
    new_statement(event, add_copy_statement(conflict_columns, from, to, conditions))
}

/// Runs several operations in order. If every operation is a no-op the
/// statement has no side effect.
pub fn new_multi_statement(event: &dyn Event, operations: Vec<Operation>) -> Statement {
    let operations: Vec<Operation> = operations
        .into_iter()
        .filter(|operation| !operation.is_no_op())
        .collect();
    let execute = (!operations.is_empty()).then_some(Execute { operations });
    Statement::from_event(event, execute)
}

/// A statement that only advances the projection's position.
pub fn new_no_op_statement(event: &dyn Event) -> Statement {
    Statement::from_event(event, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_support::raw_event;
    use crate::event::BaseEvent;
    use crate::handler::executor::test_support::RecordingExecutor;

    fn event() -> BaseEvent {
        BaseEvent::from_raw(raw_event("test.aggregate", "1", "test.event", 1))
    }

    async fn run(statement: &Statement, projection: &str) -> Result<Vec<(String, Vec<SqlValue>)>, StatementError> {
        let mut executor = RecordingExecutor::default();
        statement.execute(&mut executor, projection).await?;
        Ok(executor.executed)
    }

    fn text(value: &str) -> SqlValue {
        SqlValue::Text(value.to_string())
    }

    #[tokio::test]
    async fn create_statement_renders_insert() {
        let statement = new_create_statement(&event(), vec![Column::new("col1", "val")]);

        let executed = run(&statement, "my_table").await.unwrap();
        assert_eq!(
            executed,
            vec![("INSERT INTO my_table (col1) VALUES ($1)".to_string(), vec![text("val")])]
        );
        assert_eq!(statement.sequence, 1);
        assert_eq!(statement.aggregate_type.as_str(), "test.aggregate");
    }

    #[tokio::test]
    async fn create_statement_without_projection_fails() {
        let statement = new_create_statement(&event(), vec![Column::new("col1", "val")]);
        assert_eq!(run(&statement, "").await, Err(StatementError::NoProjection));
    }

    #[tokio::test]
    async fn create_statement_without_values_fails() {
        let statement = new_create_statement(&event(), vec![]);
        assert_eq!(run(&statement, "my_table").await, Err(StatementError::NoValues));
    }

    #[tokio::test]
    async fn upsert_with_single_update_column() {
        let statement = new_upsert_statement(
            &event(),
            &[Column::named("col1")],
            vec![Column::new("col1", "val"), Column::new("col2", "val2")],
        );

        let (sql, args) = run(&statement, "my_table").await.unwrap().remove(0);
        assert_eq!(
            sql,
            "INSERT INTO my_table (col1, col2) VALUES ($1, $2) ON CONFLICT (col1) DO UPDATE SET col2 = EXCLUDED.col2"
        );
        assert_eq!(args, vec![text("val"), text("val2")]);
    }

    #[tokio::test]
    async fn upsert_with_multiple_update_columns() {
        let statement = new_upsert_statement(
            &event(),
            &[Column::named("col1")],
            vec![
                Column::new("col1", "val"),
                Column::new("col2", "val2"),
                Column::new("col3", "val3"),
            ],
        );

        let (sql, _) = run(&statement, "my_table").await.unwrap().remove(0);
        assert_eq!(
            sql,
            "INSERT INTO my_table (col1, col2, col3) VALUES ($1, $2, $3) ON CONFLICT (col1) DO UPDATE SET (col2, col3) = (EXCLUDED.col2, EXCLUDED.col3)"
        );
    }

    #[tokio::test]
    async fn upsert_with_only_conflict_columns_does_nothing_on_conflict() {
        let statement = new_upsert_statement(&event(), &[Column::named("col1")], vec![Column::new("col1", "val")]);

        let (sql, _) = run(&statement, "my_table").await.unwrap().remove(0);
        assert_eq!(
            sql,
            "INSERT INTO my_table (col1) VALUES ($1) ON CONFLICT (col1) DO NOTHING"
        );
    }

    #[tokio::test]
    async fn upsert_without_values_fails() {
        let statement = new_upsert_statement(&event(), &[Column::named("col1")], vec![]);
        assert_eq!(run(&statement, "my_table").await, Err(StatementError::NoValues));
    }

    #[tokio::test]
    async fn update_statement_forms() {
        let single = new_update_statement(
            &event(),
            vec![Column::new("col1", "val")],
            vec![Condition::equals("col2", 1_i64)],
        );
        let multi = new_update_statement(
            &event(),
            vec![Column::new("a", "1"), Column::new("b", "2")],
            vec![Condition::equals("c", "3")],
        );

        let (sql, args) = run(&single, "my_table").await.unwrap().remove(0);
        assert_eq!(sql, "UPDATE my_table SET col1 = $1 WHERE (col2 = $2)");
        assert_eq!(args, vec![text("val"), SqlValue::Int(1)]);

        let (sql, _) = run(&multi, "t").await.unwrap().remove(0);
        assert_eq!(sql, "UPDATE t SET (a, b) = ($1, $2) WHERE (c = $3)");
    }

    #[tokio::test]
    async fn update_statement_contract() {
        let no_values = new_update_statement(&event(), vec![], vec![Condition::equals("c", "3")]);
        let no_conditions = new_update_statement(&event(), vec![Column::new("a", "1")], vec![]);

        assert_eq!(run(&no_values, "t").await, Err(StatementError::NoValues));
        assert_eq!(run(&no_conditions, "t").await, Err(StatementError::NoCondition));
    }

    #[tokio::test]
    async fn delete_statement_requires_condition() {
        let statement = new_delete_statement(&event(), vec![]);
        assert_eq!(run(&statement, "t").await, Err(StatementError::NoCondition));

        let statement = new_delete_statement(
            &event(),
            vec![Condition::equals("c", "1"), Condition::is_null("d")],
        );
        let (sql, args) = run(&statement, "t").await.unwrap().remove(0);
        assert_eq!(sql, "DELETE FROM t WHERE (c = $1) AND (d IS NULL)");
        assert_eq!(args, vec![text("1")]);
    }

    #[tokio::test]
    async fn copy_statement_maps_columns() {
        let statement = new_copy_statement(
            &event(),
            &[],
            vec![
                Column::literal("state"),
                Column::named("id"),
                Column::named("col_a"),
                Column::named("col_b"),
            ],
            vec![
                Column::named("state"),
                Column::named("id"),
                Column::named("col_c"),
                Column::named("col_d"),
            ],
            vec![Condition::equals("id", 2_i64), Condition::equals("state", 3_i64)],
        );

        let (sql, args) = run(&statement, "my_table").await.unwrap().remove(0);
        assert_eq!(
            sql,
            "INSERT INTO my_table (state, id, col_c, col_d) SELECT $1, id, col_a, col_b FROM my_table AS copy_table WHERE copy_table.id = $2 AND copy_table.state = $3 ON CONFLICT () DO UPDATE SET (state, id, col_c, col_d) = ($1, EXCLUDED.id, EXCLUDED.col_a, EXCLUDED.col_b)"
        );
        assert_eq!(args, vec![text("state"), SqlValue::Int(2), SqlValue::Int(3)]);
    }

    #[tokio::test]
    async fn copy_statement_contract() {
        let mismatched = new_copy_statement(
            &event(),
            &[],
            vec![Column::named("id")],
            vec![],
            vec![Condition::equals("id", 1_i64)],
        );
        let unconditioned = new_copy_statement(&event(), &[], vec![Column::named("id")], vec![Column::named("id")], vec![]);

        assert_eq!(run(&mismatched, "t").await, Err(StatementError::NoValues));
        assert_eq!(run(&unconditioned, "t").await, Err(StatementError::NoCondition));
    }

    #[tokio::test]
    async fn multi_statement_runs_operations_in_order() {
        let statement = new_multi_statement(
            &event(),
            vec![
                add_create_statement(vec![Column::new("a", "1")]),
                add_no_op_statement(),
                add_delete_statement(vec![Condition::equals("a", "0")]).with_table_suffix("members"),
            ],
        );

        let executed = run(&statement, "proj").await.unwrap();
        let sql: Vec<&str> = executed.iter().map(|(sql, _)| sql.as_str()).collect();
        assert_eq!(
            sql,
            vec![
                "INSERT INTO proj (a) VALUES ($1)",
                "DELETE FROM proj_members WHERE (a = $1)"
            ]
        );
    }

    #[test]
    fn multi_statement_of_no_ops_has_no_side_effect() {
        let statement = new_multi_statement(&event(), vec![add_no_op_statement(), add_no_op_statement()]);
        assert!(statement.is_no_op());
        assert!(new_multi_statement(&event(), vec![]).is_no_op());
        assert!(new_no_op_statement(&event()).is_no_op());
    }

    #[tokio::test]
    async fn special_columns_render_as_expressions() {
        let statement = new_update_statement(
            &event(),
            vec![
                new_array_append_col("roles", "admin"),
                new_array_remove_col("grants", "g1"),
                new_copy_col("owner", "creator"),
            ],
            vec![Condition::text_array_contains("roles", "user"), Condition::one_of("id", ["1", "2"])],
        );

        let (sql, args) = run(&statement, "t").await.unwrap().remove(0);
        assert_eq!(
            sql,
            "UPDATE t SET (roles, grants, owner) = (array_append(roles, $1), array_remove(grants, $2), creator) WHERE (roles @> $3) AND (id = ANY($4))"
        );
        assert_eq!(
            args,
            vec![
                text("admin"),
                text("g1"),
                SqlValue::TextArray(vec!["user".into()]),
                SqlValue::TextArray(vec!["1".into(), "2".into()]),
            ]
        );
    }

    #[tokio::test]
    async fn inserts_reject_columns_reading_the_current_row() {
        let create = new_create_statement(
            &event(),
            vec![Column::new("id", "1"), new_array_append_col("roles", "admin")],
        );
        assert_eq!(
            run(&create, "t").await,
            Err(StatementError::NotInsertable("roles".into()))
        );

        let upsert = new_upsert_statement(
            &event(),
            &[Column::named("id")],
            vec![Column::new("id", "1"), new_copy_col("owner", "creator")],
        );
        assert_eq!(
            run(&upsert, "t").await,
            Err(StatementError::NotInsertable("owner".into()))
        );

        let multi = new_multi_statement(
            &event(),
            vec![
                add_create_statement(vec![Column::new("id", "1")]),
                add_create_statement(vec![new_array_remove_col("grants", "g1")]),
            ],
        );
        assert_eq!(
            run(&multi, "t").await,
            Err(StatementError::NotInsertable("grants".into()))
        );
    }

    #[tokio::test]
    async fn no_op_statement_executes_nothing() {
        let executed = run(&new_no_op_statement(&event()), "t").await.unwrap();
        assert!(executed.is_empty());
    }
}

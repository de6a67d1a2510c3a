//! Projection table definitions and the init check creating them.

use std::fmt::Write as _;

/// SQL type of a projection column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// `TEXT`
    Text,
    /// `TEXT[]`
    TextArray,
    /// `JSONB`
    Jsonb,
    /// `BYTEA`
    Bytes,
    /// `TIMESTAMPTZ`
    Timestamp,
    /// `INTERVAL`
    Interval,
    /// `SMALLINT`, for enum discriminants
    Enum,
    /// `SMALLINT[]`
    EnumArray,
    /// `BIGINT`
    Int64,
    /// `BOOLEAN`
    Bool,
}

impl ColumnType {
    const fn sql(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::TextArray => "TEXT[]",
            Self::Jsonb => "JSONB",
            Self::Bytes => "BYTEA",
            Self::Timestamp => "TIMESTAMPTZ",
            Self::Interval => "INTERVAL",
            Self::Enum => "SMALLINT",
            Self::EnumArray => "SMALLINT[]",
            Self::Int64 => "BIGINT",
            Self::Bool => "BOOLEAN",
        }
    }
}

/// Definition of a projection column. Columns are `NOT NULL` unless marked
/// nullable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    name: String,
    column_type: ColumnType,
    nullable: bool,
    default: Option<String>,
}

impl ColumnDef {
    /// A required column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: None,
        }
    }

    /// Allows `NULL`.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Sets a default expression, e.g. `0` or `now()`.
    #[must_use]
    pub fn with_default(mut self, expression: impl Into<String>) -> Self {
        self.default = Some(expression.into());
        self
    }

    fn render(&self) -> String {
        let mut sql = format!("{} {}", self.name, self.column_type.sql());
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            let _ = write!(sql, " DEFAULT {default}");
        }
        sql
    }
}

/// A secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    name: String,
    columns: Vec<String>,
}

impl Index {
    /// Index `name` over `columns`.
    pub fn new<I, T>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }
}

/// A projection table: the projection's own table or a suffixed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    columns: Vec<ColumnDef>,
    primary_key: Vec<String>,
    indices: Vec<Index>,
    suffix: Option<String>,
    references_primary: bool,
}

impl Table {
    /// The table named after the projection.
    pub fn new<I, T>(columns: Vec<ColumnDef>, primary_key: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            columns,
            primary_key: primary_key.into_iter().map(Into::into).collect(),
            indices: Vec::new(),
            suffix: None,
            references_primary: false,
        }
    }

    /// A table named `<projection>_<suffix>`.
    pub fn suffixed<I, T>(columns: Vec<ColumnDef>, primary_key: I, suffix: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            suffix: Some(suffix.into()),
            ..Self::new(columns, primary_key)
        }
    }

    /// Adds a secondary index.
    #[must_use]
    pub fn with_index(mut self, index: Index) -> Self {
        self.indices.push(index);
        self
    }

    /// Rows are deleted together with the primary table's row sharing its key.
    #[must_use]
    pub const fn with_foreign_key_to_primary(mut self) -> Self {
        self.references_primary = true;
        self
    }

    fn name(&self, projection: &str) -> String {
        match &self.suffix {
            Some(suffix) => format!("{projection}_{suffix}"),
            None => projection.to_string(),
        }
    }

    fn statements(&self, projection: &str, primary_key: &[String]) -> Vec<String> {
        let name = self.name(projection);
        let mut definitions: Vec<String> = self.columns.iter().map(ColumnDef::render).collect();
        if !self.primary_key.is_empty() {
            definitions.push(format!("PRIMARY KEY ({})", self.primary_key.join(", ")));
        }
        if self.references_primary && self.suffix.is_some() && !primary_key.is_empty() {
            let key = primary_key.join(", ");
            definitions.push(format!(
                "FOREIGN KEY ({key}) REFERENCES {projection} ({key}) ON DELETE CASCADE"
            ));
        }

        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {name} ({})",
            definitions.join(", ")
        )];
        let index_prefix = name.replace('.', "_");
        statements.extend(self.indices.iter().map(|index| {
            format!(
                "CREATE INDEX IF NOT EXISTS {index_prefix}_{} ON {name} ({})",
                index.name,
                index.columns.join(", ")
            )
        }));
        statements
    }
}

/// Creates a projection's tables before it processes events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCheck {
    primary: Table,
    secondary: Vec<Table>,
}

impl TableCheck {
    /// Checks a single table.
    pub const fn new(table: Table) -> Self {
        Self {
            primary: table,
            secondary: Vec::new(),
        }
    }

    /// Checks a primary table and its suffixed tables.
    pub const fn multi(primary: Table, secondary: Vec<Table>) -> Self {
        Self { primary, secondary }
    }

    /// Idempotent DDL for the projection, primary table first.
    pub fn statements(&self, projection: &str) -> Vec<String> {
        let mut statements = self.primary.statements(projection, &[]);
        for table in &self.secondary {
            statements.extend(table.statements(projection, &self.primary.primary_key));
        }
        statements
    }
}

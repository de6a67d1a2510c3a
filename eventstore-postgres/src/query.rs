//! Renders compiled search queries as SQL against `eventstore.events`.

use chrono::{DateTime, Utc};
use eventstore::repository::Operation;
use eventstore::{Columns, EventstoreResult, Field, Filter, FilterValue, Query};
use sqlx::postgres::PgArguments;
use sqlx::Postgres;

use crate::to_i64;

pub(crate) const EVENT_COLUMNS: &str = "event_sequence, instance_id, aggregate_type, aggregate_id, \
     aggregate_version, event_type, previous_aggregate_sequence, previous_aggregate_type_sequence, \
     creation_date, editor_user, editor_service, resource_owner, event_data";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Arg {
    Text(String),
    TextList(Vec<String>),
    BigInt(i64),
    Date(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SqlQuery {
    pub sql: String,
    pub args: Vec<Arg>,
}

impl SqlQuery {
    pub fn bound(&self) -> sqlx::query::Query<'_, Postgres, PgArguments> {
        self.args
            .iter()
            .fold(sqlx::query(&self.sql), |query, arg| match arg {
                Arg::Text(value) => query.bind(value.as_str()),
                Arg::TextList(values) => query.bind(values.as_slice()),
                Arg::BigInt(value) => query.bind(*value),
                Arg::Date(value) => query.bind(*value),
            })
    }
}

const fn column(field: Field) -> &'static str {
    match field {
        Field::AggregateType => "aggregate_type",
        Field::AggregateId => "aggregate_id",
        Field::EventType => "event_type",
        Field::Sequence => "event_sequence",
        Field::CreationDate => "creation_date",
        Field::ResourceOwner => "resource_owner",
        Field::InstanceId => "instance_id",
        Field::EditorUser => "editor_user",
    }
}

const fn operator(operation: Operation) -> &'static str {
    match operation {
        Operation::Equals | Operation::In => "=",
        Operation::Greater => ">",
        Operation::Less => "<",
    }
}

fn render_filter(filter: &Filter, args: &mut Vec<Arg>) -> EventstoreResult<String> {
    let column = column(filter.field);
    let arg = match (filter.field, &filter.value) {
        (Field::Sequence, FilterValue::Sequence(sequence)) => Arg::BigInt(to_i64(*sequence, "sequence")?),
        (Field::CreationDate, FilterValue::Date(date)) => Arg::Date(*date),
        (Field::Sequence | Field::CreationDate, _) => return Ok("FALSE".to_string()),
        (_, FilterValue::Text(value)) => Arg::Text(value.clone()),
        (_, FilterValue::TextList(values)) => {
            args.push(Arg::TextList(values.clone()));
            return Ok(format!("{column} = ANY(${})", args.len()));
        }
        (_, FilterValue::Sequence(_) | FilterValue::Date(_)) => return Ok("FALSE".to_string()),
    };
    args.push(arg);
    Ok(format!("{column} {} ${}", operator(filter.operation), args.len()))
}

fn render_where(query: &Query, args: &mut Vec<Arg>) -> EventstoreResult<String> {
    if query.filters.is_empty() {
        return Ok(String::new());
    }
    let mut groups = Vec::with_capacity(query.filters.len());
    for group in &query.filters {
        if group.is_empty() {
            groups.push("(TRUE)".to_string());
            continue;
        }
        let conditions = group
            .iter()
            .map(|filter| render_filter(filter, args))
            .collect::<EventstoreResult<Vec<_>>>()?;
        groups.push(format!("({})", conditions.join(" AND ")));
    }
    Ok(format!(" WHERE {}", groups.join(" OR ")))
}

/// Compiles the query into a statement selecting what its columns ask for.
pub(crate) fn compile(query: &Query) -> EventstoreResult<SqlQuery> {
    let mut args = Vec::new();
    let condition = render_where(query, &mut args)?;
    let sql = match query.columns {
        Columns::Event => {
            let order = if query.desc { "DESC" } else { "ASC" };
            let mut sql = format!(
                "SELECT {EVENT_COLUMNS} FROM eventstore.events{condition} ORDER BY event_sequence {order}"
            );
            if query.limit > 0 {
                args.push(Arg::BigInt(to_i64(query.limit, "limit")?));
                sql.push_str(&format!(" LIMIT ${}", args.len()));
            }
            sql
        }
        Columns::MaxSequence => {
            format!("SELECT MAX(event_sequence) FROM eventstore.events{condition}")
        }
        Columns::InstanceIds => {
            format!("SELECT DISTINCT instance_id FROM eventstore.events{condition} ORDER BY instance_id")
        }
    };
    Ok(SqlQuery { sql, args })
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventstore::{InstanceId, SearchQueryBuilder};

    #[test]
    fn event_query_renders_groups_order_and_limit() {
        let query = SearchQueryBuilder::new(Columns::Event)
            .limit(10)
            .order_desc()
            .add_query()
            .aggregate_types(["user"])
            .event_types(["user.added", "user.removed"])
            .sequence_greater(4)
            .or()
            .aggregate_types(["org"])
            .builder()
            .build(Some(&InstanceId::from("i1")))
            .unwrap();

        let compiled = compile(&query).unwrap();

        assert_eq!(
            compiled.sql,
            format!(
                "SELECT {EVENT_COLUMNS} FROM eventstore.events WHERE \
                 (aggregate_type = $1 AND event_type = ANY($2) AND event_sequence > $3 AND instance_id = $4) \
                 OR (aggregate_type = $5 AND instance_id = $6) \
                 ORDER BY event_sequence DESC LIMIT $7"
            )
        );
        assert_eq!(compiled.args[2], Arg::BigInt(4));
        assert_eq!(compiled.args[6], Arg::BigInt(10));
    }

    #[test]
    fn max_sequence_query_ignores_order_and_limit() {
        let query = SearchQueryBuilder::new(Columns::MaxSequence)
            .limit(3)
            .add_query()
            .aggregate_types(["user"])
            .builder()
            .build(None)
            .unwrap();

        let compiled = compile(&query).unwrap();

        assert_eq!(
            compiled.sql,
            "SELECT MAX(event_sequence) FROM eventstore.events WHERE (aggregate_type = $1)"
        );
        assert_eq!(compiled.args, vec![Arg::Text("user".into())]);
    }

    #[test]
    fn instance_id_query_is_distinct() {
        let query = SearchQueryBuilder::new(Columns::InstanceIds)
            .add_query()
            .aggregate_types(["instance"])
            .builder()
            .build(None)
            .unwrap();

        assert_eq!(
            compile(&query).unwrap().sql,
            "SELECT DISTINCT instance_id FROM eventstore.events WHERE (aggregate_type = $1) ORDER BY instance_id"
        );
    }

    #[test]
    fn mismatched_filter_values_never_match() {
        let query = Query {
            columns: Columns::Event,
            limit: 0,
            desc: false,
            filters: vec![vec![Filter::new(
                Field::Sequence,
                Operation::Equals,
                FilterValue::Text("1".into()),
            )]],
        };

        let compiled = compile(&query).unwrap();
        assert!(compiled.sql.contains("WHERE (FALSE)"));
        assert!(compiled.args.is_empty());
    }
}

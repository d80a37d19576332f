//! Filtering, ordering and pagination for `Store::fetch`
use crate::id::{BenchmarkId, GroupId};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use tracing::debug;

/// Restriction on the fetched benchmarks, all filters of one query must hold
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Ids(Vec<BenchmarkId>),
    GroupIds(Vec<GroupId>),
    Clients(Vec<u32>),
    RecordedAfter(DateTime<Utc>),
}

#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum Direction {
    Descending = -1,
    Ascending = 1,
}

/// Sortable benchmark columns, the position in `COLUMNS` is the stable numeric index
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Id,
    GroupId,
    Comment,
    Version,
    Command,
    TransactionType,
    ScalingFactor,
    QueryMode,
    Clients,
    Threads,
    RecordedAt,
    CreatedAt,
}

pub const COLUMNS: [(&str, Column); 12] = [
    ("id", Column::Id),
    ("group_id", Column::GroupId),
    ("comment", Column::Comment),
    ("version", Column::Version),
    ("command", Column::Command),
    ("transaction_type", Column::TransactionType),
    ("scaling_factor", Column::ScalingFactor),
    ("query_mode", Column::QueryMode),
    ("clients", Column::Clients),
    ("threads", Column::Threads),
    ("recorded_at", Column::RecordedAt),
    ("created_at", Column::CreatedAt),
];

impl Column {
    pub fn name(self) -> &'static str {
        COLUMNS
            .iter()
            .find(|(_, column)| *column == self)
            .map(|(name, _)| *name)
            .unwrap_or("id")
    }

    /// resolve a column by name or by stable index
    pub fn from_identifier(identifier: &str) -> Option<Self> {
        let identifier = identifier.trim();

        match identifier.parse::<usize>() {
            Ok(index) => COLUMNS.get(index).map(|(_, column)| *column),
            Err(_) => COLUMNS
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(identifier))
                .map(|(_, column)| *column),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Order {
    pub column: Column,
    pub direction: Direction,
}

impl Order {
    pub fn asc(column: Column) -> Self {
        Self {
            column,
            direction: Direction::Ascending,
        }
    }

    pub fn desc(column: Column) -> Self {
        Self {
            column,
            direction: Direction::Descending,
        }
    }

    /// `-clients` sorts descending, `+clients`, `clients` and `8` ascending
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        let (direction, identifier) = match spec.strip_prefix('-') {
            Some(rest) => (Direction::Descending, rest),
            None => (
                Direction::Ascending,
                spec.strip_prefix('+').unwrap_or(spec),
            ),
        };

        Column::from_identifier(identifier).map(|column| Self { column, direction })
    }
}

/// Parse a list of order specs, unknown identifiers are skipped
pub fn parse_order<S: AsRef<str>>(specs: &[S]) -> Vec<Order> {
    specs
        .iter()
        .filter_map(|spec| {
            let order = Order::parse(spec.as_ref());
            if order.is_none() {
                debug!(spec = spec.as_ref(), "Ignoring unknown order column");
            }
            order
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub filters: Vec<Filter>,
    // empty means group id descending, then id descending
    pub order: Vec<Order>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryOptions {
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order(mut self, order: Order) -> Self {
        self.order.push(order);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// `where` clause over the `b` alias of the benchmarks table and its parameters
    pub(crate) fn where_clause(&self) -> (String, Vec<Value>) {
        let mut values = Vec::new();

        if self.filters.is_empty() {
            return (String::new(), values);
        }

        let conditions = self
            .filters
            .iter()
            .map(|filter| {
                let (column, parameters) = match filter {
                    Filter::Ids(ids) => (
                        "b.id",
                        ids.iter()
                            .map(|id| Value::Text(id.to_string()))
                            .collect_vec(),
                    ),
                    Filter::GroupIds(ids) => (
                        "b.group_id",
                        ids.iter()
                            .map(|id| Value::Text(id.to_string()))
                            .collect_vec(),
                    ),
                    Filter::Clients(clients) => (
                        "b.clients",
                        clients
                            .iter()
                            .map(|clients| Value::Integer(i64::from(*clients)))
                            .collect_vec(),
                    ),
                    Filter::RecordedAfter(after) => {
                        // same text layout rusqlite uses to store timestamps
                        values.push(Value::Text(after.format("%F %T%.f%:z").to_string()));

                        return "b.recorded_at >= ?".to_owned();
                    }
                };

                if parameters.is_empty() {
                    // an empty set matches nothing
                    return "0".to_owned();
                }

                let placeholders = parameters.iter().map(|_| "?").join(", ");
                values.extend(parameters);

                format!("{column} in ({placeholders})")
            })
            .join(" and ");

        (format!("where {conditions}"), values)
    }

    pub(crate) fn order_clause(&self) -> String {
        if self.order.is_empty() {
            return "order by b.group_id desc, b.id desc".to_owned();
        }

        let columns = self
            .order
            .iter()
            .map(|order| {
                let direction = match order.direction {
                    Direction::Ascending => "asc",
                    Direction::Descending => "desc",
                };

                format!("b.{} {direction}", order.column.name())
            })
            .join(", ");

        format!("order by {columns}")
    }

    pub(crate) fn page_clause(&self) -> String {
        // sqlite integers are signed, a negative limit would mean "no limit"
        let clamp = |value: u64| i64::try_from(value).unwrap_or(i64::MAX);

        match (self.limit.map(clamp), self.offset.map(clamp)) {
            (None, None) => String::new(),
            (Some(limit), None) => format!("limit {limit}"),
            (limit, Some(offset)) => format!("limit {} offset {offset}", limit.unwrap_or(-1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_order, Column, Direction, Filter, Order, QueryOptions};

    #[test]
    fn parses_order_specs() {
        assert_eq!(Order::parse("-clients"), Some(Order::desc(Column::Clients)));
        assert_eq!(Order::parse("+clients"), Some(Order::asc(Column::Clients)));
        assert_eq!(Order::parse("Clients"), Some(Order::asc(Column::Clients)));
        assert_eq!(Order::parse("-0"), Some(Order::desc(Column::Id)));
        assert_eq!(Order::parse("8"), Some(Order::asc(Column::Clients)));
        assert_eq!(Order::parse("-99"), None);
        assert_eq!(Order::parse("tps"), None);
    }

    #[test]
    fn unknown_columns_are_skipped() {
        let order = parse_order(&["-recorded_at", "bogus", "1"]);

        assert_eq!(
            order,
            vec![
                Order {
                    column: Column::RecordedAt,
                    direction: Direction::Descending
                },
                Order::asc(Column::GroupId)
            ]
        );
    }

    #[test]
    fn default_order() {
        assert_eq!(
            QueryOptions::default().order_clause(),
            "order by b.group_id desc, b.id desc"
        );
    }

    #[test]
    fn filters_compose() {
        let (clause, values) = QueryOptions::default()
            .with_filter(Filter::Clients(vec![1, 2]))
            .with_filter(Filter::GroupIds(Vec::new()))
            .where_clause();

        assert_eq!(clause, "where b.clients in (?, ?) and 0");
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn pagination() {
        assert_eq!(QueryOptions::default().page_clause(), "");
        assert_eq!(QueryOptions::default().with_limit(5).page_clause(), "limit 5");
        assert_eq!(
            QueryOptions::default().with_offset(3).page_clause(),
            "limit -1 offset 3"
        );
        assert_eq!(
            QueryOptions::default()
                .with_limit(u64::MAX)
                .with_offset(u64::MAX)
                .page_clause(),
            format!("limit {0} offset {0}", i64::MAX)
        );
    }
}

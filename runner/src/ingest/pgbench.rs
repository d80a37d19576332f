//! Parser for the report printed by a pgbench run with `-M extended`
//!
//! The report is plain text, one `key: value` or `key = value` pair per line. Lines are matched by
//! prefix against a fixed table, everything else (progress output, vacuum notices, ...) is
//! skipped. A recognized line whose value can't be parsed fails the whole report, values are never
//! defaulted. Output without the transaction count or the tps line is not a report and fails too.
use super::IngestorError;
use std::time::Duration;

/// Everything a single report yields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PgbenchOutput {
    pub version: String,
    pub transaction_type: String,
    pub scaling_factor: f64,
    pub query_mode: String,
    pub clients: u32,
    pub threads: u32,
    pub transactions: u64,
    pub failed_transactions: u64,
    pub average_latency: Duration,
    pub connection_time: Duration,
    pub transactions_per_second: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Version,
    TransactionType,
    ScalingFactor,
    QueryMode,
    Clients,
    Threads,
    Transactions,
    FailedTransactions,
    AverageLatency,
    ConnectionTime,
    TransactionsPerSecond,
}

const PREFIXES: [(&str, Field); 11] = [
    ("pgbench (", Field::Version),
    ("transaction type:", Field::TransactionType),
    ("scaling factor:", Field::ScalingFactor),
    ("query mode:", Field::QueryMode),
    ("number of clients:", Field::Clients),
    ("number of threads:", Field::Threads),
    ("number of transactions actually processed:", Field::Transactions),
    ("number of failed transactions:", Field::FailedTransactions),
    ("latency average =", Field::AverageLatency),
    ("initial connection time =", Field::ConnectionTime),
    ("tps =", Field::TransactionsPerSecond),
];

impl Field {
    fn name(self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::TransactionType => "transaction type",
            Self::ScalingFactor => "scaling factor",
            Self::QueryMode => "query mode",
            Self::Clients => "number of clients",
            Self::Threads => "number of threads",
            Self::Transactions => "number of transactions actually processed",
            Self::FailedTransactions => "number of failed transactions",
            Self::AverageLatency => "latency average",
            Self::ConnectionTime => "initial connection time",
            Self::TransactionsPerSecond => "tps",
        }
    }

    fn recognize(line: &str) -> Option<Self> {
        PREFIXES
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix))
            .map(|(_, field)| *field)
    }
}

/// Tokenized view on one recognized line
struct Line<'a> {
    field: Field,
    raw: &'a str,
    tokens: Vec<&'a str>,
}

impl<'a> Line<'a> {
    fn token(&self, index: usize) -> Result<&'a str, IngestorError> {
        self.tokens
            .get(index)
            .copied()
            .ok_or_else(|| IngestorError::MissingToken {
                field: self.field.name(),
                index,
                line: self.raw.to_owned(),
            })
    }

    /// all tokens from `index` on, joined by a single space
    fn rest(&self, index: usize) -> Result<String, IngestorError> {
        self.token(index)?;

        Ok(self.tokens[index..].join(" "))
    }

    fn integer<T: std::str::FromStr<Err = std::num::ParseIntError>>(
        &self,
        index: usize,
    ) -> Result<T, IngestorError> {
        // "processed: 1000/1000" is printed when a transaction limit was given
        let token = self.token(index)?;
        let token = token.split_once('/').map_or(token, |(done, _)| done);

        token
            .parse()
            .map_err(|source| IngestorError::InvalidInteger {
                field: self.field.name(),
                source,
            })
    }

    fn float(&self, index: usize) -> Result<f64, IngestorError> {
        self.token(index)?
            .parse()
            .map_err(|source| IngestorError::InvalidFloat {
                field: self.field.name(),
                source,
            })
    }

    fn duration(&self, index: usize) -> Result<Duration, IngestorError> {
        let value = self.float(index)?;
        let unit = self.token(index + 1)?;

        parse_duration(self.field.name(), value, unit)
    }
}

/// Scale a value with a `us`, `ms` or `s` unit to a duration
pub fn parse_duration(
    field: &'static str,
    value: f64,
    unit: &str,
) -> Result<Duration, IngestorError> {
    let nanos_per_unit = match unit {
        "us" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        _ => {
            return Err(IngestorError::UnknownUnit {
                field,
                unit: unit.to_owned(),
            })
        }
    };
    let nanos = (value * nanos_per_unit).round();

    if !nanos.is_finite() || nanos < 0.0 || nanos > u64::MAX as f64 {
        return Err(IngestorError::InvalidDuration { field, value });
    }

    Ok(Duration::from_nanos(nanos as u64))
}

fn strip_wrapping(value: &str, open: char, close: char) -> String {
    let value = value.strip_prefix(open).unwrap_or(value);

    value.strip_suffix(close).unwrap_or(value).to_owned()
}

/// Lines without which the output is not a report at all
const REQUIRED: [Field; 2] = [Field::Transactions, Field::TransactionsPerSecond];

/// Parse a complete report, pure and re-entrant
pub fn parse(output: &str) -> Result<PgbenchOutput, IngestorError> {
    let mut parsed = PgbenchOutput::default();
    let mut seen = Vec::with_capacity(PREFIXES.len());

    for raw in output.lines() {
        let tokens = raw.split_whitespace().collect::<Vec<_>>();
        if tokens.is_empty() {
            continue;
        }

        let Some(field) = Field::recognize(raw) else {
            continue;
        };
        seen.push(field);
        let line = Line { field, raw, tokens };

        match field {
            // pgbench (16.2 (Ubuntu 16.2-1.pgdg22.04+1))
            Field::Version => {
                parsed.version = strip_wrapping(&line.rest(1)?, '(', ')');
            }
            // transaction type: <builtin: TPC-B (sort of)>
            Field::TransactionType => {
                parsed.transaction_type = strip_wrapping(&line.rest(2)?, '<', '>');
            }
            Field::ScalingFactor => parsed.scaling_factor = line.float(2)?,
            Field::QueryMode => parsed.query_mode = line.token(2)?.to_owned(),
            Field::Clients => parsed.clients = line.integer(3)?,
            Field::Threads => parsed.threads = line.integer(3)?,
            Field::Transactions => parsed.transactions = line.integer(5)?,
            // number of failed transactions: 0 (0.000%)
            Field::FailedTransactions => parsed.failed_transactions = line.integer(4)?,
            // latency average = 5.359 ms
            Field::AverageLatency => parsed.average_latency = line.duration(3)?,
            // initial connection time = 3.105 ms
            Field::ConnectionTime => parsed.connection_time = line.duration(4)?,
            // older versions print two tps lines, the last one wins
            Field::TransactionsPerSecond => parsed.transactions_per_second = line.float(2)?,
        }
    }

    if let Some(missing) = REQUIRED.iter().find(|field| !seen.contains(*field)) {
        return Err(IngestorError::MissingField(missing.name()));
    }

    Ok(parsed)
}

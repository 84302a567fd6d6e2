//! Column descriptions: storage type per dialect and value materialization.

use super::Dialect;
use crate::clock::Timestamp;
use crate::error::{ConfigError, EnqueueError};
use crate::value::{SqlValue, ValueStore};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Text layout used for every datetime value the engine produces
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    /// Formatted timestamp stored as text
    TimestampText,
    /// Milliseconds since the Unix epoch
    EpochMillis,
    /// Insert-time local datetime
    LocalDatetimeNow,
    /// Insert-time UTC datetime
    UtcDatetimeNow,
    /// Datetime supplied by the producer or the value store
    ExplicitDatetime,
}

impl ColumnType {
    /// Types whose value is the enqueue time when the producer leaves it NULL
    pub fn is_auto_time(&self) -> bool {
        matches!(
            self,
            ColumnType::TimestampText
                | ColumnType::EpochMillis
                | ColumnType::LocalDatetimeNow
                | ColumnType::UtcDatetimeNow
        )
    }

    /// Best-effort mapping of a declared SQL type back to a column type
    pub fn from_declared(declared: &str) -> ColumnType {
        let upper = declared.to_ascii_uppercase();
        if upper.contains("INT") {
            ColumnType::Integer
        } else if ["REAL", "DOUB", "FLOA", "NUMERIC", "DECIMAL"]
            .iter()
            .any(|t| upper.contains(t))
        {
            ColumnType::Real
        } else if upper.contains("TIMESTAMP") || upper.contains("DATE") {
            ColumnType::ExplicitDatetime
        } else {
            ColumnType::Text
        }
    }
}

impl FromStr for ColumnType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(&['-', ' '][..], "_").as_str() {
            "integer" | "int" | "long" => Ok(ColumnType::Integer),
            "real" | "double" | "float" => Ok(ColumnType::Real),
            "text" | "string" | "varchar" => Ok(ColumnType::Text),
            "timestamp" | "timestamp_text" => Ok(ColumnType::TimestampText),
            "epochmillis" | "epoch_millis" => Ok(ColumnType::EpochMillis),
            "localdatetime" | "local_datetime_now" | "now" => Ok(ColumnType::LocalDatetimeNow),
            "utcdatetime" | "utc_datetime_now" | "utcnow" => Ok(ColumnType::UtcDatetimeNow),
            "datetime" | "explicit_datetime" => Ok(ColumnType::ExplicitDatetime),
            _ => Err(ConfigError::InvalidColumnType(s.to_string())),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::Text => "text",
            ColumnType::TimestampText => "timestamp",
            ColumnType::EpochMillis => "epochmillis",
            ColumnType::LocalDatetimeNow => "localdatetime",
            ColumnType::UtcDatetimeNow => "utcdatetime",
            ColumnType::ExplicitDatetime => "datetime",
        };
        f.write_str(name)
    }
}

/// One column of a table
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub unique: bool,
    pub primary_key: bool,
    pub default: Option<SqlValue>,
    /// Name looked up in the value store; the column name when absent
    pub reference: Option<String>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        ColumnSchema {
            name: name.into(),
            column_type,
            nullable: true,
            unique: false,
            primary_key: false,
            default: None,
            reference: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, value: impl Into<SqlValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn bound_to(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Storage type of this column on the given dialect
    pub fn sql_type(&self, dialect: Dialect) -> &'static str {
        use ColumnType::*;
        match dialect {
            Dialect::Sqlite => match self.column_type {
                Integer | EpochMillis => "INTEGER",
                Real => "REAL",
                Text | TimestampText | LocalDatetimeNow | UtcDatetimeNow | ExplicitDatetime => {
                    "TEXT"
                }
            },
            Dialect::Postgres => match self.column_type {
                Integer | EpochMillis => "BIGINT",
                Real => "DOUBLE PRECISION",
                Text | TimestampText => "TEXT",
                LocalDatetimeNow | UtcDatetimeNow | ExplicitDatetime => "TIMESTAMP",
            },
            Dialect::MySql => match self.column_type {
                Integer | EpochMillis => "BIGINT",
                Real => "DOUBLE",
                // MySQL cannot index unbounded TEXT
                Text if self.unique || self.primary_key => "VARCHAR(255)",
                Text => "TEXT",
                TimestampText => "VARCHAR(32)",
                LocalDatetimeNow | UtcDatetimeNow | ExplicitDatetime => "DATETIME(3)",
            },
        }
    }

    /// Column definition fragment for CREATE TABLE
    pub fn render_ddl(&self, dialect: Dialect) -> String {
        let mut ddl = format!("{} {}", dialect.quote(&self.name), self.sql_type(dialect));
        if !self.nullable {
            ddl.push_str(" NOT NULL");
        }
        if self.unique && !self.primary_key {
            ddl.push_str(" UNIQUE");
        }
        if let Some(default) = &self.default {
            ddl.push_str(" DEFAULT ");
            ddl.push_str(&sql_literal(default));
        }
        ddl
    }

    /// Placeholder for this column at 1-based `position` in an insert
    pub fn placeholder(&self, dialect: Dialect, position: usize) -> String {
        match dialect {
            Dialect::Sqlite => format!("?{}", position),
            // Parameters arrive as text or int8; the cast lets NULLs and
            // datetime strings land in typed columns
            Dialect::Postgres => format!("CAST(${} AS {})", position, self.sql_type(dialect)),
            Dialect::MySql => "?".to_string(),
        }
    }

    /// Produce the bound value for this column from the value store.
    ///
    /// Absent value with a default yields the default; absent value without
    /// one aborts the row being built.
    pub fn materialize(
        &self,
        lookup: &dyn ValueStore,
        now: Timestamp,
    ) -> Result<SqlValue, EnqueueError> {
        match self.column_type {
            ColumnType::LocalDatetimeNow | ColumnType::UtcDatetimeNow => {
                return Ok(self.auto_value(now));
            }
            ColumnType::EpochMillis | ColumnType::TimestampText if self.reference.is_none() => {
                return Ok(self.auto_value(now));
            }
            _ => {}
        }

        let key = self.reference.as_deref().unwrap_or(&self.name);
        match lookup.value(key) {
            Some(value) => Ok(self.coerce(value)),
            None => self.default.clone().ok_or_else(|| EnqueueError::MissingValue {
                column: self.name.clone(),
            }),
        }
    }

    /// Replace a NULL in an auto-time column with the enqueue time
    pub fn fill_auto(&self, value: SqlValue, now: Timestamp) -> SqlValue {
        if value.is_null() && self.column_type.is_auto_time() {
            self.auto_value(now)
        } else {
            value
        }
    }

    fn auto_value(&self, now: Timestamp) -> SqlValue {
        match self.column_type {
            ColumnType::EpochMillis => SqlValue::Integer(now.as_millis() as i64),
            ColumnType::LocalDatetimeNow => SqlValue::Text(format_datetime(now.to_local())),
            _ => SqlValue::Text(format_datetime(now.to_utc().naive_utc())),
        }
    }

    fn coerce(&self, value: SqlValue) -> SqlValue {
        if value.is_null() {
            return value;
        }
        match self.column_type {
            ColumnType::Integer | ColumnType::EpochMillis => {
                value.as_i64().map(SqlValue::Integer).unwrap_or(value)
            }
            ColumnType::Real => value.as_f64().map(SqlValue::Real).unwrap_or(value),
            _ => match value {
                SqlValue::Text(_) => value,
                other => SqlValue::Text(other.to_string()),
            },
        }
    }
}

pub fn format_datetime(dt: NaiveDateTime) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

fn sql_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Integer(v) => v.to_string(),
        SqlValue::Real(v) => v.to_string(),
        SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::InMemoryValueStore;

    #[test]
    fn test_epoch_millis_ddl_per_dialect() {
        let col = ColumnSchema::new("ts", ColumnType::EpochMillis);
        assert_eq!(col.render_ddl(Dialect::Sqlite), "\"ts\" INTEGER");
        assert_eq!(col.render_ddl(Dialect::Postgres), "\"ts\" BIGINT");
        assert_eq!(col.render_ddl(Dialect::MySql), "`ts` BIGINT");
    }

    #[test]
    fn test_now_types_render_text_on_sqlite_and_datetime_on_servers() {
        let col = ColumnSchema::new("at", ColumnType::UtcDatetimeNow);
        assert_eq!(col.sql_type(Dialect::Sqlite), "TEXT");
        assert_eq!(col.sql_type(Dialect::Postgres), "TIMESTAMP");
        assert_eq!(col.sql_type(Dialect::MySql), "DATETIME(3)");
    }

    #[test]
    fn test_flags_and_default_in_ddl() {
        let col = ColumnSchema::new("tag", ColumnType::Text)
            .not_null()
            .unique()
            .with_default("it's");
        assert_eq!(
            col.render_ddl(Dialect::Sqlite),
            "\"tag\" TEXT NOT NULL UNIQUE DEFAULT 'it''s'"
        );
        assert_eq!(
            col.render_ddl(Dialect::MySql),
            "`tag` VARCHAR(255) NOT NULL UNIQUE DEFAULT 'it''s'"
        );
    }

    #[test]
    fn test_placeholders() {
        let col = ColumnSchema::new("v", ColumnType::Real);
        assert_eq!(col.placeholder(Dialect::Sqlite, 2), "?2");
        assert_eq!(col.placeholder(Dialect::Postgres, 2), "CAST($2 AS DOUBLE PRECISION)");
        assert_eq!(col.placeholder(Dialect::MySql, 2), "?");
    }

    #[test]
    fn test_materialize_uses_reference_then_default() {
        let store = InMemoryValueStore::new();
        let col = ColumnSchema::new("value", ColumnType::Real).bound_to("sensor.temp");
        let now = Timestamp(1_000);

        assert_eq!(
            col.materialize(&store, now),
            Err(EnqueueError::MissingValue {
                column: "value".into()
            })
        );

        let with_default = col.clone().with_default(-1.0);
        assert_eq!(with_default.materialize(&store, now), Ok(SqlValue::Real(-1.0)));

        store.set("sensor.temp", 20);
        assert_eq!(col.materialize(&store, now), Ok(SqlValue::Real(20.0)));
    }

    #[test]
    fn test_materialize_unreferenced_uses_column_name() {
        let store = InMemoryValueStore::new();
        store.set("count", "17");
        let col = ColumnSchema::new("count", ColumnType::Integer);
        assert_eq!(
            col.materialize(&store, Timestamp::ZERO),
            Ok(SqlValue::Integer(17))
        );
    }

    #[test]
    fn test_auto_time_columns() {
        let store = InMemoryValueStore::new();
        let now = Timestamp(1_700_000_000_250);

        let millis = ColumnSchema::new("ts", ColumnType::EpochMillis);
        assert_eq!(
            millis.materialize(&store, now),
            Ok(SqlValue::Integer(1_700_000_000_250))
        );

        let utc = ColumnSchema::new("at", ColumnType::UtcDatetimeNow);
        assert_eq!(
            utc.materialize(&store, now),
            Ok(SqlValue::Text("2023-11-14 22:13:20.250".into()))
        );

        assert_eq!(
            millis.fill_auto(SqlValue::Null, now),
            SqlValue::Integer(1_700_000_000_250)
        );
        assert_eq!(millis.fill_auto(SqlValue::Integer(5), now), SqlValue::Integer(5));
    }

    #[test]
    fn test_parse_column_types() {
        assert_eq!("epochmillis".parse::<ColumnType>().unwrap(), ColumnType::EpochMillis);
        assert_eq!("REAL".parse::<ColumnType>().unwrap(), ColumnType::Real);
        assert_eq!(
            "local-datetime-now".parse::<ColumnType>().unwrap(),
            ColumnType::LocalDatetimeNow
        );
        assert!("blob".parse::<ColumnType>().is_err());
    }

    #[test]
    fn test_declared_type_mapping() {
        assert_eq!(ColumnType::from_declared("bigint"), ColumnType::Integer);
        assert_eq!(ColumnType::from_declared("double precision"), ColumnType::Real);
        assert_eq!(
            ColumnType::from_declared("timestamp without time zone"),
            ColumnType::ExplicitDatetime
        );
        assert_eq!(ColumnType::from_declared("character varying"), ColumnType::Text);
    }
}

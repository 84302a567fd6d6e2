//! Table and column model, DDL generation and the per-statement row buffers.

pub mod column;
pub mod queue;
pub mod table;

pub use column::{ColumnSchema, ColumnType, DATETIME_FORMAT};
pub use queue::{PendingRow, StatementQueue};
pub use table::{SchemaOrigin, Statement, StatementId, TableSchema};

use serde::{Deserialize, Serialize};

/// SQL flavor spoken by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    /// Quote an identifier, doubling any embedded quote character
    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::Sqlite | Dialect::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
            Dialect::MySql => format!("`{}`", ident.replace('`', "``")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(Dialect::Sqlite.quote("temp"), "\"temp\"");
        assert_eq!(Dialect::Postgres.quote("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(Dialect::MySql.quote("a`b"), "`a``b`");
    }
}

//! The few places where generated SQL depends on the engine.

use crate::models::ResourceType;

pub trait SqlDialect: Send + Sync {
    /// Text of the `index`-th (1-based) bound parameter.
    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn resource_type_literal(&self, level: ResourceType) -> String {
        level.code().to_string()
    }

    /// Appended to every `LIKE` built from a wildcard.
    fn wildcard_escape(&self) -> &'static str {
        " ESCAPE '\\'"
    }

    /// Brackets are character classes in some `LIKE` implementations.
    fn escape_brackets(&self) -> bool;

    /// Native `NULLS LAST` in `ORDER BY`. Without it an `IS NULL` key is
    /// sorted first.
    fn supports_nulls_last(&self) -> bool;

    /// `OFFSET` requires a `LIMIT`; `-1` means unbounded.
    fn limits(&self, since: Option<usize>, count: Option<usize>) -> String {
        match (since, count) {
            (None, None) => String::new(),
            (None, Some(c)) => format!(" LIMIT {}", self.placeholder(c)),
            (Some(s), None) => format!(" LIMIT -1 OFFSET {}", self.placeholder(s)),
            (Some(s), Some(c)) => format!(
                " LIMIT {} OFFSET {}",
                self.placeholder(c),
                self.placeholder(s)
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SqliteDialect {
    pub escape_brackets: bool,
    pub nulls_last: bool,
}

impl Default for SqliteDialect {
    fn default() -> Self {
        Self {
            escape_brackets: false,
            nulls_last: true,
        }
    }
}

impl SqlDialect for SqliteDialect {
    fn escape_brackets(&self) -> bool {
        self.escape_brackets
    }

    fn supports_nulls_last(&self) -> bool {
        self.nulls_last
    }
}

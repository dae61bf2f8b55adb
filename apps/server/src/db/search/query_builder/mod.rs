//! SQL query builder for index lookups.
//!
//! Lookups are first assembled as a small representation (joins,
//! predicates, ordering keys) and only turned into text by `render`,
//! where the dialect decides placeholders, limits and null ordering.
//! Values are always bound, never inlined.

use dicom_core::Tag;

use super::constraint::{ConstraintType, OrderingCast, OrderingDirection, ValueConstraint};
use super::escape::wildcard_to_like;
use crate::models::{LabelsConstraint, MetadataType, ResourceType};

mod apply;
mod bind;
mod dialect;
mod find;

use bind::{push_integer, push_text};
pub use apply::ApplyLookupBuilder;
pub use dialect::{SqlDialect, SqliteDialect};
pub use find::FindQueryBuilder;

/// Bind values for `sqlx` queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindValue {
    Text(String),
    Integer(i64),
}

/// Alias of the `Resources` row at `level`, optionally prefixed
/// (`parentstudies`).
pub(crate) fn level_alias(prefix: &str, level: ResourceType) -> String {
    let name = match level {
        ResourceType::Patient => "patients",
        ResourceType::Study => "studies",
        ResourceType::Series => "series",
        ResourceType::Instance => "instances",
    };
    format!("{prefix}{name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JoinKind {
    Inner,
    Left,
}

impl JoinKind {
    fn mandatory(mandatory: bool) -> Self {
        if mandatory {
            JoinKind::Inner
        } else {
            JoinKind::Left
        }
    }

    fn as_sql(self) -> &'static str {
        match self {
            JoinKind::Inner => " INNER JOIN ",
            JoinKind::Left => " LEFT JOIN ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TagTable {
    DicomIdentifiers,
    MainDicomTags,
}

impl TagTable {
    pub(crate) fn for_identifier(is_identifier: bool) -> Self {
        if is_identifier {
            TagTable::DicomIdentifiers
        } else {
            TagTable::MainDicomTags
        }
    }

    fn as_sql(self) -> &'static str {
        match self {
            TagTable::DicomIdentifiers => "DicomIdentifiers",
            TagTable::MainDicomTags => "MainDicomTags",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Join {
    /// `alias` is the parent of `child`.
    Parent { alias: String, child: String },
    /// `alias` is a child of `parent`.
    Child { alias: String, parent: String },
    Tag {
        kind: JoinKind,
        table: TagTable,
        alias: String,
        owner: String,
        tag: Tag,
    },
    Metadata {
        kind: JoinKind,
        alias: String,
        owner: String,
        metadata: MetadataType,
    },
}

impl Join {
    fn render(&self, sql: &mut String) {
        match self {
            Join::Parent { alias, child } => {
                sql.push_str(&format!(
                    " INNER JOIN Resources {alias} ON {alias}.internalId = {child}.parentId"
                ));
            }
            Join::Child { alias, parent } => {
                sql.push_str(&format!(
                    " INNER JOIN Resources {alias} ON {parent}.internalId = {alias}.parentId"
                ));
            }
            Join::Tag {
                kind,
                table,
                alias,
                owner,
                tag,
            } => {
                sql.push_str(kind.as_sql());
                sql.push_str(&format!(
                    "{} {alias} ON {alias}.id = {owner}.internalId AND {alias}.tagGroup = {} AND {alias}.tagElement = {}",
                    table.as_sql(),
                    tag.group(),
                    tag.element()
                ));
            }
            Join::Metadata {
                kind,
                alias,
                owner,
                metadata,
            } => {
                sql.push_str(kind.as_sql());
                sql.push_str(&format!(
                    "Metadata {alias} ON {alias}.id = {owner}.internalId AND {alias}.type = {}",
                    metadata.code()
                ));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ComparisonOp {
    Equal,
    SmallerOrEqual,
    GreaterOrEqual,
    In,
    Like,
}

/// One value test on a column, with the bound parameters it uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Comparison {
    pub column: String,
    pub op: ComparisonOp,
    pub params: Vec<usize>,
    pub case_sensitive: bool,
    /// A missing value also satisfies the comparison.
    pub nullable: bool,
}

impl Comparison {
    /// `None` when the constraint accepts any value: a lone `*`. The
    /// caller then drops the join too unless the constraint is mandatory.
    pub(crate) fn from_constraint<C: ValueConstraint>(
        constraint: &C,
        column: String,
        escape_brackets: bool,
        bind_params: &mut Vec<BindValue>,
    ) -> Option<Self> {
        let values = constraint.values();
        let op = match constraint.constraint_type() {
            ConstraintType::Equal => ComparisonOp::Equal,
            ConstraintType::SmallerOrEqual => ComparisonOp::SmallerOrEqual,
            ConstraintType::GreaterOrEqual => ComparisonOp::GreaterOrEqual,
            ConstraintType::List => ComparisonOp::In,
            ConstraintType::Wildcard => {
                if values.first().map(String::as_str) == Some("*") {
                    return None;
                }
                ComparisonOp::Like
            }
        };

        let params = values
            .iter()
            .map(|value| {
                let value = if op == ComparisonOp::Like {
                    wildcard_to_like(value, escape_brackets)
                } else {
                    value.clone()
                };
                push_text(bind_params, value)
            })
            .collect();

        Some(Self {
            column,
            op,
            params,
            case_sensitive: constraint.is_case_sensitive(),
            nullable: !constraint.is_mandatory(),
        })
    }

    fn render(&self, dialect: &dyn SqlDialect) -> String {
        let value = |index: usize| {
            let p = dialect.placeholder(index);
            if self.case_sensitive {
                p
            } else {
                format!("lower({p})")
            }
        };
        let column = if self.case_sensitive {
            self.column.clone()
        } else {
            format!("lower({})", self.column)
        };

        let comparison = match self.op {
            ComparisonOp::Equal => format!("{column} = {}", value(self.params[0])),
            ComparisonOp::SmallerOrEqual => format!("{column} <= {}", value(self.params[0])),
            ComparisonOp::GreaterOrEqual => format!("{column} >= {}", value(self.params[0])),
            ComparisonOp::In => {
                let items: Vec<String> = self.params.iter().map(|p| value(*p)).collect();
                format!("{column} IN ({})", items.join(", "))
            }
            ComparisonOp::Like => format!(
                "{column} LIKE {}{}",
                value(self.params[0]),
                dialect.wildcard_escape()
            ),
        };

        if self.nullable {
            format!("({} IS NULL OR {comparison})", self.column)
        } else {
            comparison
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Predicate {
    ResourceType {
        alias: String,
        level: ResourceType,
    },
    PublicId {
        alias: String,
        param: usize,
    },
    Compare(Comparison),
    /// Some child of `parent` has a tag satisfying `comparison`.
    ChildExists {
        child: String,
        parent: String,
        join: Join,
        comparison: Comparison,
    },
    /// `alias.internalId` in the rows of `table` carrying `tag`, filtered
    /// by `comparison` on the bare `value` column.
    TagSubselect {
        owner: String,
        table: TagTable,
        tag: Tag,
        comparison: Option<Comparison>,
    },
    /// Correlated count of the matching labels.
    LabelsCount {
        alias: String,
        params: Vec<usize>,
        constraint: LabelsConstraint,
    },
    /// Same filter, as a grouped sub-select usable without aliases.
    LabelsGroup {
        column: String,
        params: Vec<usize>,
        constraint: LabelsConstraint,
    },
}

impl Predicate {
    fn render(&self, dialect: &dyn SqlDialect) -> String {
        match self {
            Predicate::ResourceType { alias, level } => {
                let column = if alias.is_empty() {
                    "resourceType".to_string()
                } else {
                    format!("{alias}.resourceType")
                };
                format!("{column} = {}", dialect.resource_type_literal(*level))
            }
            Predicate::PublicId { alias, param } => {
                format!("{alias}.publicId = {}", dialect.placeholder(*param))
            }
            Predicate::Compare(comparison) => comparison.render(dialect),
            Predicate::ChildExists {
                child,
                parent,
                join,
                comparison,
            } => {
                let mut sql = format!("EXISTS (SELECT 1 FROM Resources AS {child}");
                join.render(&mut sql);
                sql.push_str(&format!(
                    " WHERE {} AND {child}.parentId = {parent}.internalId)",
                    comparison.render(dialect)
                ));
                sql
            }
            Predicate::TagSubselect {
                owner,
                table,
                tag,
                comparison,
            } => {
                let select = format!(
                    "SELECT id FROM {} WHERE tagGroup = {} AND tagElement = {}",
                    table.as_sql(),
                    tag.group(),
                    tag.element()
                );
                match comparison {
                    None => format!("{owner} IN ({select})"),
                    Some(c) if c.nullable => format!(
                        "({owner} IN ({select} AND {}) OR {owner} NOT IN ({select}))",
                        c.render(dialect)
                    ),
                    Some(c) => format!("{owner} IN ({select} AND {})", c.render(dialect)),
                }
            }
            Predicate::LabelsCount {
                alias,
                params,
                constraint,
            } => {
                let threshold = match constraint {
                    LabelsConstraint::All => format!("= {}", params.len()),
                    LabelsConstraint::Any => "> 0".to_string(),
                    LabelsConstraint::None => "= 0".to_string(),
                };
                format!(
                    "(SELECT COUNT(1) FROM Labels AS selectedLabels WHERE selectedLabels.id = {alias}.internalId AND selectedLabels.label IN ({})) {threshold}",
                    placeholders(dialect, params)
                )
            }
            Predicate::LabelsGroup {
                column,
                params,
                constraint,
            } => {
                let (membership, threshold) = match constraint {
                    LabelsConstraint::All => ("IN", format!("= {}", params.len())),
                    LabelsConstraint::Any => ("IN", "> 0".to_string()),
                    LabelsConstraint::None => ("NOT IN", "> 0".to_string()),
                };
                format!(
                    "{column} {membership} (SELECT id FROM (SELECT id, COUNT(1) AS labelsCount FROM Labels WHERE label IN ({}) GROUP BY id) AS temp WHERE labelsCount {threshold})",
                    placeholders(dialect, params)
                )
            }
        }
    }
}

fn placeholders(dialect: &dyn SqlDialect, params: &[usize]) -> String {
    params
        .iter()
        .map(|p| dialect.placeholder(*p))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One key of the `ROW_NUMBER()` window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OrderKey {
    pub column: String,
    pub cast: OrderingCast,
    pub direction: OrderingDirection,
}

impl OrderKey {
    fn render(&self, dialect: &dyn SqlDialect) -> String {
        let mut sql = String::new();
        if !dialect.supports_nulls_last() {
            sql.push_str(&format!("{} IS NULL, ", self.column));
        }
        match self.cast {
            OrderingCast::Int => sql.push_str(&format!("CAST({} AS INTEGER)", self.column)),
            OrderingCast::Float => sql.push_str(&format!("CAST({} AS REAL)", self.column)),
            OrderingCast::String => sql.push_str(&self.column),
        }
        sql.push_str(match self.direction {
            OrderingDirection::Ascending => " ASC",
            OrderingDirection::Descending => " DESC",
        });
        if dialect.supports_nulls_last() {
            sql.push_str(" NULLS LAST");
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Projection {
    /// `publicId, internalId` plus the `rowNumber` window.
    Ranked { alias: String, order: Vec<OrderKey> },
    Plain { alias: String, distinct: bool },
    /// Unaliased single-table select.
    Bare,
}

/// A complete `SELECT` over `Resources`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SelectQuery {
    pub projection: Projection,
    pub joins: Vec<Join>,
    pub predicates: Vec<Predicate>,
    pub since: Option<usize>,
    pub count: Option<usize>,
}

impl SelectQuery {
    pub(crate) fn new(projection: Projection) -> Self {
        Self {
            projection,
            joins: Vec::new(),
            predicates: Vec::new(),
            since: None,
            count: None,
        }
    }

    pub(crate) fn set_limits(
        &mut self,
        since: u64,
        count: u64,
        bind_params: &mut Vec<BindValue>,
    ) {
        if since > 0 {
            self.since = Some(push_integer(bind_params, since as i64));
        }
        if count > 0 {
            self.count = Some(push_integer(bind_params, count as i64));
        }
    }

    pub(crate) fn render(&self, dialect: &dyn SqlDialect) -> String {
        let mut sql = match &self.projection {
            Projection::Ranked { alias, order } => {
                // publicId breaks ties: every query reusing the lookup
                // must see the same page.
                let window = order
                    .iter()
                    .map(|key| key.render(dialect))
                    .chain(std::iter::once(format!("{alias}.publicId")))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "SELECT {alias}.publicId, {alias}.internalId, ROW_NUMBER() OVER (ORDER BY {window}) AS rowNumber FROM Resources AS {alias}"
                )
            }
            Projection::Plain { alias, distinct } => format!(
                "SELECT {}{alias}.publicId, {alias}.internalId FROM Resources AS {alias}",
                if *distinct { "DISTINCT " } else { "" }
            ),
            Projection::Bare => "SELECT publicId, internalId FROM Resources".to_string(),
        };

        for join in &self.joins {
            join.render(&mut sql);
        }

        let predicates: Vec<String> = self.predicates.iter().map(|p| p.render(dialect)).collect();
        if !predicates.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&predicates.join(" AND "));
        }

        if matches!(self.projection, Projection::Ranked { .. }) {
            sql.push_str(" ORDER BY rowNumber");
        }

        sql.push_str(&dialect.limits(self.since, self.count));
        sql
    }
}

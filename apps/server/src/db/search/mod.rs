//! Query model and SQL generation for index lookups.

pub mod constraint;
pub(crate) mod escape;
pub mod lookup;
pub mod query_builder;

pub use constraint::{
    ConstraintType, DatabaseDicomTagConstraint, DatabaseDicomTagConstraints,
    DatabaseMetadataConstraint, OrderBy, OrderingCast, OrderingDirection, OrderingKey,
    ValueConstraint,
};
pub use lookup::{DatabaseLookup, DicomTagConstraint};
pub use query_builder::{
    ApplyLookupBuilder, BindValue, FindQueryBuilder, SqlDialect, SqliteDialect,
};

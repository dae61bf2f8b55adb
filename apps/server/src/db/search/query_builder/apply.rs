//! Constraint lookup without ordering or scope, used by the generic find
//! of backends that have no native find.

use std::collections::BTreeSet;

use super::bind::push_text;
use super::{
    level_alias, BindValue, Comparison, Join, JoinKind, Predicate, Projection, SelectQuery,
    SqlDialect, TagTable,
};
use crate::db::search::constraint::{DatabaseDicomTagConstraints, ValueConstraint};
use crate::models::{LabelsConstraint, ResourceType};
use crate::Result;

pub struct ApplyLookupBuilder<'a> {
    constraints: &'a DatabaseDicomTagConstraints,
    level: ResourceType,
    labels: &'a BTreeSet<String>,
    labels_constraint: LabelsConstraint,
    limit: u64,
}

impl<'a> ApplyLookupBuilder<'a> {
    pub fn new(
        constraints: &'a DatabaseDicomTagConstraints,
        level: ResourceType,
        labels: &'a BTreeSet<String>,
        labels_constraint: LabelsConstraint,
        limit: u64,
    ) -> Self {
        Self {
            constraints,
            level,
            labels,
            labels_constraint,
            limit,
        }
    }

    pub fn build_sql(&self, dialect: &dyn SqlDialect) -> Result<(String, Vec<BindValue>)> {
        let (upper, lower) = self.constraints.lookup_levels(self.level);
        let mut bind_params = Vec::new();
        let mut query = if upper == self.level && lower == self.level {
            self.single_level(dialect, &mut bind_params)
        } else {
            self.multi_level(dialect, upper, lower, &mut bind_params)?
        };
        query.set_limits(0, self.limit, &mut bind_params);
        Ok((query.render(dialect), bind_params))
    }

    fn single_level(
        &self,
        dialect: &dyn SqlDialect,
        bind_params: &mut Vec<BindValue>,
    ) -> SelectQuery {
        let mut query = SelectQuery::new(Projection::Bare);
        query.predicates.push(Predicate::ResourceType {
            alias: String::new(),
            level: self.level,
        });

        for constraint in self.constraints {
            let comparison = Comparison::from_constraint(
                constraint,
                "value".to_string(),
                dialect.escape_brackets(),
                bind_params,
            );
            if comparison.is_none() && !constraint.is_mandatory() {
                continue;
            }
            query.predicates.push(Predicate::TagSubselect {
                owner: "internalId".to_string(),
                table: TagTable::for_identifier(constraint.is_identifier()),
                tag: constraint.tag(),
                comparison,
            });
        }

        if !self.labels.is_empty() {
            query.predicates.push(Predicate::LabelsGroup {
                column: "internalId".to_string(),
                params: self.push_labels(bind_params),
                constraint: self.labels_constraint,
            });
        }
        query
    }

    fn multi_level(
        &self,
        dialect: &dyn SqlDialect,
        upper: ResourceType,
        lower: ResourceType,
        bind_params: &mut Vec<BindValue>,
    ) -> Result<SelectQuery> {
        let alias = level_alias("", self.level);
        let mut query = SelectQuery::new(Projection::Plain {
            alias: alias.clone(),
            distinct: true,
        });

        let mut current = self.level;
        while current > upper {
            let parent = current.parent_or_err()?;
            query.joins.push(Join::Parent {
                alias: level_alias("", parent),
                child: level_alias("", current),
            });
            current = parent;
        }

        let mut current = self.level;
        while current < lower {
            let child = current.child_or_err()?;
            query.joins.push(Join::Child {
                alias: level_alias("", child),
                parent: level_alias("", current),
            });
            current = child;
        }

        query.predicates.push(Predicate::ResourceType {
            alias: alias.clone(),
            level: self.level,
        });

        let mut counter = 0usize;
        for constraint in self.constraints {
            let tag_alias = format!("t{counter}");
            let comparison = Comparison::from_constraint(
                constraint,
                format!("{tag_alias}.value"),
                dialect.escape_brackets(),
                bind_params,
            );
            if comparison.is_none() && !constraint.is_mandatory() {
                continue;
            }
            counter += 1;
            query.joins.push(Join::Tag {
                kind: JoinKind::mandatory(constraint.is_mandatory()),
                table: TagTable::for_identifier(constraint.is_identifier()),
                alias: tag_alias,
                owner: level_alias("", constraint.level()),
                tag: constraint.tag(),
            });
            if let Some(comparison) = comparison {
                query.predicates.push(Predicate::Compare(comparison));
            }
        }

        if !self.labels.is_empty() {
            query.predicates.push(Predicate::LabelsCount {
                alias,
                params: self.push_labels(bind_params),
                constraint: self.labels_constraint,
            });
        }
        Ok(query)
    }

    fn push_labels(&self, bind_params: &mut Vec<BindValue>) -> Vec<usize> {
        self.labels
            .iter()
            .map(|label| push_text(bind_params, label.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::search::constraint::{ConstraintType, DatabaseDicomTagConstraint};
    use crate::db::search::query_builder::SqliteDialect;
    use dicom_dictionary_std::tags;

    fn patient_id(level: ResourceType) -> DatabaseDicomTagConstraint {
        DatabaseDicomTagConstraint::new(
            level,
            tags::PATIENT_ID,
            true,
            ConstraintType::Equal,
            vec!["P1".into()],
            true,
            true,
        )
        .unwrap()
    }

    #[test]
    fn single_level_uses_subselects() {
        let mut constraints = DatabaseDicomTagConstraints::new();
        constraints.add(patient_id(ResourceType::Patient));
        let labels: BTreeSet<String> = ["x".to_string()].into_iter().collect();

        let (sql, binds) = ApplyLookupBuilder::new(
            &constraints,
            ResourceType::Patient,
            &labels,
            LabelsConstraint::All,
            10,
        )
        .build_sql(&SqliteDialect::default())
        .unwrap();

        assert_eq!(
            sql,
            "SELECT publicId, internalId FROM Resources WHERE resourceType = 1 \
AND internalId IN (SELECT id FROM DicomIdentifiers WHERE tagGroup = 16 AND tagElement = 32 AND value = $1) \
AND internalId IN (SELECT id FROM (SELECT id, COUNT(1) AS labelsCount FROM Labels WHERE label IN ($2) GROUP BY id) AS temp WHERE labelsCount = 1) \
LIMIT $3"
        );
        assert_eq!(binds.len(), 3);
    }

    #[test]
    fn multi_level_joins_both_ways() {
        let mut constraints = DatabaseDicomTagConstraints::new();
        constraints.add(patient_id(ResourceType::Study));
        constraints.add(
            DatabaseDicomTagConstraint::new(
                ResourceType::Instance,
                tags::INSTANCE_NUMBER,
                false,
                ConstraintType::Equal,
                vec!["1".into()],
                true,
                true,
            )
            .unwrap(),
        );
        let labels = BTreeSet::new();

        let (sql, _) = ApplyLookupBuilder::new(
            &constraints,
            ResourceType::Series,
            &labels,
            LabelsConstraint::All,
            0,
        )
        .build_sql(&SqliteDialect::default())
        .unwrap();

        assert_eq!(
            sql,
            "SELECT DISTINCT series.publicId, series.internalId FROM Resources AS series \
INNER JOIN Resources studies ON studies.internalId = series.parentId \
INNER JOIN Resources instances ON series.internalId = instances.parentId \
INNER JOIN DicomIdentifiers t0 ON t0.id = studies.internalId AND t0.tagGroup = 16 AND t0.tagElement = 32 \
INNER JOIN MainDicomTags t1 ON t1.id = instances.internalId AND t1.tagGroup = 32 AND t1.tagElement = 19 \
WHERE series.resourceType = 3 AND t0.value = $1 AND t1.value = $2"
        );
    }
}

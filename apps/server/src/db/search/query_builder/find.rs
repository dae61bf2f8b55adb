//! The single `SELECT` behind a native find or count.

use super::bind::push_text;
use super::{
    level_alias, BindValue, Comparison, Join, JoinKind, OrderKey, Predicate, Projection,
    SelectQuery, SqlDialect, TagTable,
};
use crate::db::search::constraint::{OrderingKey, ValueConstraint};
use crate::find::FindRequest;
use crate::models::{format_tag, ResourceType};
use crate::registry::{DicomTagType, MainDicomTagsRegistry};
use crate::{Error, Result};

const ANCESTOR_SUFFIXES: [&str; 3] = ["parent", "grandparent", "grandgrandparent"];

pub struct FindQueryBuilder<'a> {
    request: &'a FindRequest,
    registry: &'a MainDicomTagsRegistry,
}

impl<'a> FindQueryBuilder<'a> {
    pub fn new(request: &'a FindRequest, registry: &'a MainDicomTagsRegistry) -> Self {
        Self { request, registry }
    }

    /// Public and internal ids of the matches, in request order, paged if
    /// the request carries limits.
    pub fn build_sql(&self, dialect: &dyn SqlDialect) -> Result<(String, Vec<BindValue>)> {
        let (query, bind_params) = self.build(dialect, true)?;
        Ok((query.render(dialect), bind_params))
    }

    pub fn build_count_sql(&self, dialect: &dyn SqlDialect) -> Result<(String, Vec<BindValue>)> {
        let (query, bind_params) = self.build(dialect, false)?;
        Ok((
            format!(
                "WITH Lookup AS ({}) SELECT COUNT(*) FROM Lookup",
                query.render(dialect)
            ),
            bind_params,
        ))
    }

    pub(crate) fn build(
        &self,
        dialect: &dyn SqlDialect,
        with_limits: bool,
    ) -> Result<(SelectQuery, Vec<BindValue>)> {
        let request = self.request;
        let level = request.level();
        let alias = level_alias("", level);
        let mut bind_params = Vec::new();

        let mut joins = Vec::new();
        let mut predicates = vec![Predicate::ResourceType {
            alias: alias.clone(),
            level,
        }];

        let (upper_level, _) = request.dicom_tag_constraints().lookup_levels(level);
        let mut upper = Vec::new();
        let mut current = level;
        while current > upper_level {
            let parent = current.parent_or_err()?;
            upper.push(Join::Parent {
                alias: level_alias("", parent),
                child: level_alias("", current),
            });
            current = parent;
        }

        if let Some((scope_level, public_id)) = request.orthanc_identifiers().deepest() {
            if scope_level > level {
                return Err(Error::BadRequest(format!(
                    "Cannot restrict a {level} lookup to a {scope_level}"
                )));
            }
            let param = push_text(&mut bind_params, public_id.to_string());
            if scope_level == level {
                predicates.push(Predicate::PublicId {
                    alias: alias.clone(),
                    param,
                });
            } else {
                let mut child = alias.clone();
                let mut current = level;
                while current > scope_level {
                    let parent = current.parent_or_err()?;
                    let parent_alias = level_alias("parent", parent);
                    joins.push(Join::Parent {
                        alias: parent_alias.clone(),
                        child,
                    });
                    child = parent_alias;
                    current = parent;
                }
                predicates.push(Predicate::PublicId {
                    alias: child,
                    param,
                });
            }
        }

        let mut counter = 0usize;

        for constraint in request.dicom_tag_constraints() {
            let table = TagTable::for_identifier(constraint.is_identifier());
            let tag_alias = format!("t{counter}");

            if constraint.level() <= level {
                let comparison = Comparison::from_constraint(
                    constraint,
                    format!("{tag_alias}.value"),
                    dialect.escape_brackets(),
                    &mut bind_params,
                );
                if comparison.is_none() && !constraint.is_mandatory() {
                    continue;
                }
                counter += 1;
                joins.push(Join::Tag {
                    kind: JoinKind::mandatory(constraint.is_mandatory()),
                    table,
                    alias: tag_alias,
                    owner: level_alias("", constraint.level()),
                    tag: constraint.tag(),
                });
                if let Some(comparison) = comparison {
                    predicates.push(Predicate::Compare(comparison));
                }
            } else if Some(constraint.level()) == level.child() {
                let Some(comparison) = Comparison::from_constraint(
                    constraint,
                    format!("{tag_alias}.value"),
                    dialect.escape_brackets(),
                    &mut bind_params,
                ) else {
                    continue;
                };
                counter += 1;
                let child = level_alias("", constraint.level());
                predicates.push(Predicate::ChildExists {
                    join: Join::Tag {
                        kind: JoinKind::mandatory(constraint.is_mandatory()),
                        table,
                        alias: tag_alias,
                        owner: child.clone(),
                        tag: constraint.tag(),
                    },
                    child,
                    parent: alias.clone(),
                    comparison,
                });
            } else {
                tracing::debug!(
                    tag = %format_tag(constraint.tag()),
                    level = %constraint.level(),
                    "Ignoring constraint more than one level below the query"
                );
            }
        }

        for constraint in request.metadata_constraints() {
            let metadata_alias = format!("t{counter}");
            let comparison = Comparison::from_constraint(
                constraint,
                format!("{metadata_alias}.value"),
                dialect.escape_brackets(),
                &mut bind_params,
            );
            if comparison.is_none() && !constraint.is_mandatory() {
                continue;
            }
            counter += 1;
            joins.push(Join::Metadata {
                kind: JoinKind::mandatory(constraint.is_mandatory()),
                alias: metadata_alias,
                owner: alias.clone(),
                metadata: constraint.metadata(),
            });
            if let Some(comparison) = comparison {
                predicates.push(Predicate::Compare(comparison));
            }
        }

        let mut order = Vec::new();
        for (index, ordering) in request.ordering().iter().enumerate() {
            let order_alias = format!("order{index}");
            match ordering.key {
                OrderingKey::DicomTag(tag) => {
                    let (mut tag_level, tag_type) = self.registry.lookup_tag(tag);
                    if tag_type == DicomTagType::Generic {
                        return Err(Error::BadRequest(format!(
                            "Cannot order by {}, which is not a main DICOM tag",
                            format_tag(tag)
                        )));
                    }
                    if tag_level == ResourceType::Patient && level != ResourceType::Patient {
                        tag_level = ResourceType::Study;
                    }
                    if tag_level > level {
                        return Err(Error::BadRequest(format!(
                            "Cannot order {} by {}, which is stored at the {tag_level} level",
                            level.plural(),
                            format_tag(tag)
                        )));
                    }

                    let mut owner = alias.clone();
                    let hops = level.index() - tag_level.index();
                    for suffix in ANCESTOR_SUFFIXES.iter().take(hops) {
                        let parent_alias = format!("{order_alias}{suffix}");
                        joins.push(Join::Parent {
                            alias: parent_alias.clone(),
                            child: owner,
                        });
                        owner = parent_alias;
                    }
                    joins.push(Join::Tag {
                        kind: JoinKind::Left,
                        table: TagTable::MainDicomTags,
                        alias: order_alias.clone(),
                        owner,
                        tag,
                    });
                }
                OrderingKey::Metadata(metadata) => {
                    joins.push(Join::Metadata {
                        kind: JoinKind::Left,
                        alias: order_alias.clone(),
                        owner: alias.clone(),
                        metadata,
                    });
                }
            }
            order.push(OrderKey {
                column: format!("{order_alias}.value"),
                cast: ordering.cast,
                direction: ordering.direction,
            });
        }

        let labels = request.labels();
        if !labels.is_empty() {
            let params = labels
                .iter()
                .map(|label| push_text(&mut bind_params, label.clone()))
                .collect();
            predicates.push(Predicate::LabelsCount {
                alias: alias.clone(),
                params,
                constraint: request.labels_constraint(),
            });
        }

        let mut query = SelectQuery::new(Projection::Ranked { alias, order });
        upper.extend(joins);
        query.joins = upper;
        query.predicates = predicates;

        if with_limits && request.has_limits() {
            query.set_limits(
                request.limits_since()?,
                request.limits_count()?,
                &mut bind_params,
            );
        }

        Ok((query, bind_params))
    }
}

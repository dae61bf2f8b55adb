//! Find and expand built only from per-resource primitives, for backends
//! that do not implement `execute_find` natively.

use crate::db::traits::{Capabilities, Transaction};
use crate::find::{FindRequest, FindResource, FindResponse, OrthancIdentifiers};
use crate::models::{DicomValue, ResourceType};
use crate::{Error, Result};

fn is_request_without_constraint(request: &FindRequest) -> bool {
    request.dicom_tag_constraints().is_empty()
        && request.metadata_constraints().is_empty()
        && request.labels().is_empty()
        && request.ordering().is_empty()
}

/// Highest ancestor level whose data is requested, or the query level.
fn top_level_of_interest(request: &FindRequest) -> Result<ResourceType> {
    let level = request.level();
    for ancestor in ResourceType::ALL.iter().copied().filter(|l| *l < level) {
        if request.parent_specification(ancestor)?.is_of_interest() {
            return Ok(ancestor);
        }
    }
    Ok(level)
}

/// Deepest descendant level whose data is requested, or the query level.
fn bottom_level_of_interest(request: &FindRequest) -> Result<ResourceType> {
    let level = request.level();
    for child in ResourceType::ALL.iter().rev().copied().filter(|l| *l > level) {
        if request.children_specification(child)?.is_of_interest() {
            return Ok(child);
        }
    }
    Ok(level)
}

/// Pages identifiers the database could not page; a count of 0 is unbounded.
fn apply_limits(identifiers: Vec<String>, request: &FindRequest) -> Result<Vec<String>> {
    if !request.has_limits() {
        return Ok(identifiers);
    }
    let since = usize::try_from(request.limits_since()?).unwrap_or(usize::MAX);
    let count = match request.limits_count()? {
        0 => usize::MAX,
        count => usize::try_from(count).unwrap_or(usize::MAX),
    };
    Ok(identifiers.into_iter().skip(since).take(count).collect())
}

/// Find and expand for one transaction, using only the primitives every
/// backend implements.
pub struct GenericFind<'a> {
    transaction: &'a mut dyn Transaction,
}

impl<'a> GenericFind<'a> {
    pub fn new(transaction: &'a mut dyn Transaction) -> Self {
        Self { transaction }
    }

    /// Public ids of the resources matching `request`, in storage order.
    pub async fn execute_find(
        &mut self,
        request: &FindRequest,
        capabilities: &Capabilities,
    ) -> Result<Vec<String>> {
        if !request.labels().is_empty() && !capabilities.has_labels_support {
            return Err(Error::NotImplemented(
                "The database backend doesn't support labels".to_string(),
            ));
        }

        let level = request.level();
        let identifiers = request.orthanc_identifiers();
        if let Some((scope_level, _)) = identifiers.deepest() {
            if scope_level > level {
                return Err(Error::BadRequest(format!(
                    "Cannot restrict a {level} lookup to a {scope_level}"
                )));
            }
        }

        if is_request_without_constraint(request) {
            if identifiers.is_empty() {
                return if request.has_limits() {
                    self.transaction
                        .get_all_public_ids_with_limits(
                            level,
                            request.limits_since()?,
                            request.limits_count()?,
                        )
                        .await
                } else {
                    self.transaction.get_all_public_ids(level).await
                };
            }

            if let Some((scope, id)) = identifiers.single() {
                if scope == level {
                    // Existence is checked when the resource is expanded.
                    return Ok(vec![id.to_string()]);
                }
                let children = self.children_identifiers(scope, id, level).await?;
                return apply_limits(children, request);
            }
        }

        if !request.metadata_constraints().is_empty() || !request.ordering().is_empty() {
            return Err(Error::NotImplemented(
                "The database backend supports neither ordering nor metadata constraints"
                    .to_string(),
            ));
        }

        // The lookup primitive only knows a row limit, so `since` is applied
        // here. A scope is checked after the lookup, which also prevents
        // pushing the limit down.
        let limit = if request.has_limits() && identifiers.is_empty() && request.limits_count()? > 0 {
            request.limits_since()?.saturating_add(request.limits_count()?)
        } else {
            0
        };

        let candidates = self
            .transaction
            .apply_lookup_resources(
                request.dicom_tag_constraints(),
                level,
                request.labels(),
                request.labels_constraint(),
                limit,
            )
            .await?;

        if identifiers.is_empty() {
            let matches = candidates.into_iter().map(|(public_id, _)| public_id).collect();
            return apply_limits(matches, request);
        }

        let mut matches = Vec::new();
        for (public_id, internal_id) in candidates {
            if self
                .is_in_scope(&public_id, internal_id, level, identifiers)
                .await?
            {
                matches.push(public_id);
            }
        }
        apply_limits(matches, request)
    }

    async fn children_identifiers(
        &mut self,
        top_level: ResourceType,
        top_id: &str,
        bottom_level: ResourceType,
    ) -> Result<Vec<String>> {
        if top_level >= bottom_level {
            return Err(Error::Internal(format!(
                "{top_level} is not above {bottom_level}"
            )));
        }

        let mut current = match self.transaction.lookup_resource(top_id).await? {
            Some((id, level)) if level == top_level => vec![id],
            _ => return Err(Error::InexistentItem(top_id.to_string())),
        };
        let mut current_level = top_level;

        loop {
            let next_level = current_level.child_or_err()?;
            if next_level == bottom_level {
                let mut children = Vec::new();
                for id in &current {
                    children.extend(self.transaction.get_children_public_id(*id).await?);
                }
                return Ok(children);
            }

            let mut next = Vec::new();
            for id in &current {
                next.extend(self.transaction.get_children_internal_id(*id).await?);
            }
            current = next;
            current_level = next_level;
        }
    }

    async fn is_in_scope(
        &mut self,
        public_id: &str,
        internal_id: i64,
        level: ResourceType,
        identifiers: &OrthancIdentifiers,
    ) -> Result<bool> {
        if let Some(expected) = identifiers.get(level) {
            if expected != public_id {
                return Ok(false);
            }
        }

        let mut current = internal_id;
        let mut current_level = level;
        while let Some(parent_level) = current_level.parent() {
            if !ResourceType::ALL
                .iter()
                .any(|l| *l <= parent_level && identifiers.has(*l))
            {
                break;
            }

            current = self
                .transaction
                .lookup_parent(current)
                .await?
                .ok_or_else(|| Error::DatabasePlugin(format!("{current_level} without parent")))?;
            current_level = parent_level;

            if let Some(expected) = identifiers.get(current_level) {
                if self.transaction.get_public_id(current).await? != expected {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Adds `identifier` to `response` with everything `request` asks for.
    /// A resource that no longer exists is silently skipped.
    pub async fn execute_expand(
        &mut self,
        response: &mut FindResponse,
        request: &FindRequest,
        identifier: &str,
    ) -> Result<()> {
        let (internal_id, level, parent) = if request.is_retrieve_parent_identifier() {
            match self.transaction.lookup_resource_and_parent(identifier).await? {
                Some(row) => (row.internal_id, row.level, row.parent_public_id),
                None => return Ok(()),
            }
        } else {
            match self.transaction.lookup_resource(identifier).await? {
                Some((id, level)) => (id, level, None),
                None => return Ok(()),
            }
        };

        if level != request.level() {
            return Err(Error::DatabasePlugin(format!(
                "{identifier} is a {level}, not a {}",
                request.level()
            )));
        }

        let mut resource = FindResource::new(level, internal_id, identifier);

        if request.is_retrieve_parent_identifier() {
            match parent {
                Some(parent) => resource.set_parent_identifier(parent)?,
                None if level != ResourceType::Patient => {
                    return Err(Error::DatabasePlugin(format!("{identifier} has no parent")));
                }
                None => {}
            }
        }

        if request.is_retrieve_main_dicom_tags() {
            self.retrieve_main_dicom_tags(&mut resource, level, internal_id)
                .await?;
        }
        if request.is_retrieve_metadata() {
            self.retrieve_metadata(&mut resource, level, internal_id)
                .await?;
        }

        self.expand_ancestors(&mut resource, request).await?;

        if request.is_retrieve_labels() {
            for label in self.transaction.list_labels(internal_id).await? {
                resource.add_label(label)?;
            }
        }

        if request.is_retrieve_attachments() {
            for content_type in self
                .transaction
                .list_available_attachments(internal_id)
                .await?
            {
                match self
                    .transaction
                    .lookup_attachment(internal_id, content_type)
                    .await?
                {
                    Some((info, revision)) if info.content_type == content_type => {
                        resource.add_attachment(info, revision)?
                    }
                    _ => {
                        return Err(Error::DatabasePlugin(format!(
                            "Attachment {} vanished while listed",
                            content_type.code()
                        )))
                    }
                }
            }
        }

        self.expand_descendants(&mut resource, request).await?;

        if level != ResourceType::Instance
            && (request.is_retrieve_one_instance_identifier()
                || request.is_retrieve_one_instance_metadata_and_attachments())
        {
            self.expand_one_instance(&mut resource, request).await?;
        }

        response.add(resource)
    }

    async fn retrieve_main_dicom_tags(
        &mut self,
        resource: &mut FindResource,
        level: ResourceType,
        internal_id: i64,
    ) -> Result<()> {
        let tags = self.transaction.get_main_dicom_tags(internal_id).await?;
        for (tag, value) in tags.iter() {
            match value {
                DicomValue::String(value) => {
                    resource.add_string_main_dicom_tag(level, *tag, value.clone())?
                }
                DicomValue::Null => resource.add_null_main_dicom_tag(level, *tag)?,
            }
        }
        Ok(())
    }

    async fn retrieve_metadata(
        &mut self,
        resource: &mut FindResource,
        level: ResourceType,
        internal_id: i64,
    ) -> Result<()> {
        for (metadata, value) in self.transaction.get_all_metadata(internal_id).await? {
            let revision = self
                .transaction
                .lookup_metadata(internal_id, metadata)
                .await?
                .map(|(_, revision)| revision)
                .unwrap_or_default();
            resource.add_metadata(level, metadata, value, revision)?;
        }
        Ok(())
    }

    async fn expand_ancestors(
        &mut self,
        resource: &mut FindResource,
        request: &FindRequest,
    ) -> Result<()> {
        let top_level = top_level_of_interest(request)?;
        let mut current_id = resource.internal_id();
        let mut current_level = resource.level();

        while current_level != top_level {
            current_id = self
                .transaction
                .lookup_parent(current_id)
                .await?
                .ok_or_else(|| Error::DatabasePlugin(format!("{current_level} without parent")))?;
            current_level = current_level.parent_or_err()?;

            let spec = *request.parent_specification(current_level)?;
            if spec.is_retrieve_main_dicom_tags() {
                self.retrieve_main_dicom_tags(resource, current_level, current_id)
                    .await?;
            }
            if spec.is_retrieve_metadata() {
                self.retrieve_metadata(resource, current_level, current_id)
                    .await?;
            }
        }
        Ok(())
    }

    /// Walks down one level at a time, never further than requested.
    async fn expand_descendants(
        &mut self,
        resource: &mut FindResource,
        request: &FindRequest,
    ) -> Result<()> {
        let bottom_level = bottom_level_of_interest(request)?;
        let mut current_ids = vec![resource.internal_id()];
        let mut current_level = resource.level();

        while current_level != bottom_level {
            let children_level = current_level.child_or_err()?;
            let spec = request.children_specification(children_level)?;

            if spec.is_retrieve_identifiers() {
                for id in &current_ids {
                    for child in self.transaction.get_children_public_id(*id).await? {
                        resource.add_child_identifier(children_level, child)?;
                    }
                }
            }

            for metadata in spec.metadata() {
                resource.touch_children_metadata(children_level, *metadata)?;
                for id in &current_ids {
                    for value in self
                        .transaction
                        .get_children_metadata(*id, *metadata)
                        .await?
                    {
                        resource.add_children_metadata_value(children_level, *metadata, value)?;
                    }
                }
            }

            let main_dicom_tags = spec.main_dicom_tags();
            let needs_children = children_level != bottom_level
                || !main_dicom_tags.is_empty()
                || spec.is_retrieve_count();

            if !needs_children {
                break;
            }

            let mut children_ids = Vec::new();
            for id in &current_ids {
                children_ids.extend(self.transaction.get_children_internal_id(*id).await?);
            }

            if spec.is_retrieve_count() {
                resource.set_children_count(children_level, children_ids.len() as u64)?;
            }

            if !main_dicom_tags.is_empty() {
                for tag in main_dicom_tags {
                    resource.touch_children_main_dicom_tag(children_level, *tag)?;
                }
                for id in &children_ids {
                    let tags = self.transaction.get_main_dicom_tags(*id).await?;
                    for tag in main_dicom_tags {
                        if let Some(value) = tags.lookup_string(*tag) {
                            resource.add_children_main_dicom_tag_value(
                                children_level,
                                *tag,
                                value,
                            )?;
                        }
                    }
                }
            }

            current_ids = children_ids;
            current_level = children_level;
        }
        Ok(())
    }

    /// Follows the first child down to the instance level.
    async fn expand_one_instance(
        &mut self,
        resource: &mut FindResource,
        request: &FindRequest,
    ) -> Result<()> {
        let mut current_id = resource.internal_id();
        let mut current_level = resource.level();

        while current_level != ResourceType::Instance {
            let children = self.transaction.get_children_internal_id(current_id).await?;
            current_id = *children.first().ok_or_else(|| {
                Error::DatabasePlugin(format!("{current_level} without any child"))
            })?;
            current_level = current_level.child_or_err()?;
        }

        let instance_id = self.transaction.get_public_id(current_id).await?;
        resource.set_one_instance_identifier(instance_id)?;

        if request.is_retrieve_one_instance_metadata_and_attachments() {
            for (metadata, value) in self.transaction.get_all_metadata(current_id).await? {
                resource.add_one_instance_metadata(metadata, value)?;
            }

            for content_type in self
                .transaction
                .list_available_attachments(current_id)
                .await?
            {
                if let Some((info, _)) = self
                    .transaction
                    .lookup_attachment(current_id, content_type)
                    .await?
                {
                    resource.add_one_instance_attachment(info)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetadataType;

    #[test]
    fn levels_of_interest_follow_the_specifications() {
        let mut request = FindRequest::new(ResourceType::Series);
        assert_eq!(top_level_of_interest(&request).unwrap(), ResourceType::Series);
        assert_eq!(
            bottom_level_of_interest(&request).unwrap(),
            ResourceType::Series
        );

        request
            .parent_specification_mut(ResourceType::Patient)
            .unwrap()
            .set_retrieve_main_dicom_tags(true);
        request
            .children_specification_mut(ResourceType::Instance)
            .unwrap()
            .add_metadata(MetadataType::IndexInSeries);

        assert_eq!(
            top_level_of_interest(&request).unwrap(),
            ResourceType::Patient
        );
        assert_eq!(
            bottom_level_of_interest(&request).unwrap(),
            ResourceType::Instance
        );
    }

    #[test]
    fn constraints_disable_cheap_shapes() {
        let mut request = FindRequest::new(ResourceType::Study);
        assert!(is_request_without_constraint(&request));
        request.add_label("x");
        assert!(!is_request_without_constraint(&request));
    }
}

#![allow(unused)]
#[allow(unused)]
mod support;

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use std::collections::BTreeSet;

use dicom_index::db::search::DatabaseLookup;
use dicom_index::find::FindRequest;
use dicom_index::models::{LabelsConstraint, MetadataType, ResourceType};
use support::ids::*;
use support::{populate, sorted, with_both_backends, InstanceBuilder, TestIndex};

/// Adds the normalized form of `tag = value` to `request`.
fn constrain(
    index: &TestIndex,
    request: &mut FindRequest,
    tag: Tag,
    value: &str,
) -> anyhow::Result<()> {
    let mut lookup = DatabaseLookup::new();
    lookup.add_dicom_constraint(tag, value, false, true)?;
    let normalized =
        index
            .index
            .registry()
            .normalize_lookup(&lookup, request.level(), index.native_find())?;
    for constraint in &normalized.constraints {
        request.dicom_tag_constraints_mut().add(constraint.clone());
    }
    Ok(())
}

#[tokio::test]
async fn finds_every_resource_of_a_level() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;

            let request = FindRequest::new(ResourceType::Study);
            assert_eq!(
                t.find_ids(&request).await?,
                sorted([STUDY_BRAIN, STUDY_CHEST, STUDY_KNEE]),
                "{}",
                t.backend()
            );
            assert_eq!(t.index.execute_count(&request).await?, 3);

            let request = FindRequest::new(ResourceType::Instance);
            assert_eq!(t.index.execute_count(&request).await?, 5);
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn scope_restricts_to_descendants() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;

            let mut request = FindRequest::new(ResourceType::Series);
            request.set_orthanc_id(ResourceType::Patient, PATIENT_1)?;
            assert_eq!(
                t.find_ids(&request).await?,
                sorted([SERIES_BRAIN_MR, SERIES_BRAIN_CT, SERIES_CHEST_CT]),
                "{}",
                t.backend()
            );

            let mut request = FindRequest::new(ResourceType::Instance);
            request.set_orthanc_id(ResourceType::Study, STUDY_BRAIN)?;
            assert_eq!(t.find_ids(&request).await?, sorted(["i1", "i2", "i3"]));
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn identifiers_match_regardless_of_case() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;

            let mut request = FindRequest::new(ResourceType::Study);
            constrain(t, &mut request, tags::PATIENT_ID, "p1")?;
            assert_eq!(
                t.find_ids(&request).await?,
                sorted([STUDY_BRAIN, STUDY_CHEST]),
                "{}",
                t.backend()
            );
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn date_range_is_inclusive() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;

            let mut request = FindRequest::new(ResourceType::Study);
            constrain(t, &mut request, tags::STUDY_DATE, "20200601-20211231")?;
            assert_eq!(t.find_ids(&request).await?, vec![STUDY_CHEST.to_string()]);

            let mut request = FindRequest::new(ResourceType::Study);
            constrain(t, &mut request, tags::STUDY_DATE, "20210615-")?;
            assert_eq!(
                t.find_ids(&request).await?,
                sorted([STUDY_CHEST, STUDY_KNEE])
            );
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn wildcards_and_lists_on_main_tags() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;

            let mut request = FindRequest::new(ResourceType::Series);
            constrain(t, &mut request, tags::MODALITY, "C*")?;
            assert_eq!(
                t.find_ids(&request).await?,
                sorted([SERIES_BRAIN_CT, SERIES_CHEST_CT]),
                "{}",
                t.backend()
            );

            let mut request = FindRequest::new(ResourceType::Study);
            constrain(t, &mut request, tags::STUDY_DESCRIPTION, "Brain\\Knee")?;
            assert_eq!(
                t.find_ids(&request).await?,
                sorted([STUDY_BRAIN, STUDY_KNEE])
            );
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn wildcards_escape_sql_pattern_characters() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;
            let descriptions = [
                ("st4", "ABxyz125"),
                ("st5", "ABxyz12"),
                ("st6", "50%OFF"),
                ("st7", "500FF"),
                ("st8", "a_b1"),
                ("st9", "axb1"),
            ];
            for (study, description) in descriptions {
                let record = InstanceBuilder::new(
                    "p3",
                    study,
                    &format!("se-{study}"),
                    &format!("i-{study}"),
                )
                .study_description(description)
                .build();
                t.index.store_instance(&record).await?;
            }

            let find = |value: &'static str| async move {
                let mut request = FindRequest::new(ResourceType::Study);
                constrain(t, &mut request, tags::STUDY_DESCRIPTION, value)?;
                t.find_ids(&request).await
            };

            assert_eq!(find("AB*12?").await?, vec!["st4"], "{}", t.backend());
            assert_eq!(find("50%*").await?, vec!["st6"], "{}", t.backend());
            assert_eq!(find("a_b?").await?, vec!["st8"], "{}", t.backend());
            assert_eq!(find("a_b1").await?, vec!["st8"], "{}", t.backend());
            assert_eq!(find("50%").await?, Vec::<String>::new());
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn patient_tags_are_searched_on_studies() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;

            let mut request = FindRequest::new(ResourceType::Series);
            constrain(t, &mut request, tags::PATIENT_NAME, "roe*")?;
            assert_eq!(
                t.find_ids(&request).await?,
                vec![SERIES_KNEE_MR.to_string()],
                "{}",
                t.backend()
            );
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn labels_combine_as_requested() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;
            t.index.add_label(STUDY_BRAIN, "teaching").await?;
            t.index.add_label(STUDY_BRAIN, "research").await?;
            t.index.add_label(STUDY_CHEST, "teaching").await?;

            let find = |constraint: LabelsConstraint, labels: &[&str]| {
                let mut request = FindRequest::new(ResourceType::Study);
                for label in labels {
                    request.add_label(*label);
                }
                request.set_labels_constraint(constraint);
                request
            };

            let all = find(LabelsConstraint::All, &["teaching", "research"]);
            assert_eq!(t.find_ids(&all).await?, vec![STUDY_BRAIN.to_string()]);

            let any = find(LabelsConstraint::Any, &["teaching", "research"]);
            assert_eq!(
                t.find_ids(&any).await?,
                sorted([STUDY_BRAIN, STUDY_CHEST])
            );

            let none = find(LabelsConstraint::None, &["teaching"]);
            assert_eq!(t.find_ids(&none).await?, vec![STUDY_KNEE.to_string()]);
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn retrieves_parent_children_and_tags() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;

            let mut request = FindRequest::new(ResourceType::Series);
            request.set_orthanc_id(ResourceType::Series, SERIES_BRAIN_MR)?;
            request.set_retrieve_main_dicom_tags(true);
            request.set_retrieve_metadata(true);
            request.set_retrieve_parent_identifier(true)?;
            request
                .children_specification_mut(ResourceType::Instance)?
                .set_retrieve_identifiers(true);
            request
                .parent_specification_mut(ResourceType::Study)?
                .set_retrieve_main_dicom_tags(true);

            let response = t.index.execute_find(&request).await?;
            assert_eq!(response.len(), 1, "{}", t.backend());
            let series = response.get(0)?;

            assert_eq!(series.public_id(), SERIES_BRAIN_MR);
            assert_eq!(series.parent_identifier(), Some(STUDY_BRAIN));
            assert_eq!(
                series.children_identifiers(ResourceType::Instance)?,
                &BTreeSet::from(["i1".to_string(), "i2".to_string()])
            );
            assert_eq!(
                series
                    .main_dicom_tags(ResourceType::Series)?
                    .lookup_string(tags::MODALITY),
                Some("MR")
            );
            assert_eq!(
                series
                    .main_dicom_tags(ResourceType::Study)?
                    .lookup_string(tags::STUDY_DESCRIPTION),
                Some("Brain")
            );
            assert_eq!(
                series.lookup_metadata(ResourceType::Series, MetadataType::ExpectedNumberOfInstances),
                Some("2")
            );
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn retrieves_children_counts_and_values() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;

            let mut request = FindRequest::new(ResourceType::Study);
            request.set_orthanc_id(ResourceType::Study, STUDY_BRAIN)?;
            request
                .children_specification_mut(ResourceType::Series)?
                .set_retrieve_count(true);
            request
                .children_specification_mut(ResourceType::Series)?
                .add_main_dicom_tag(tags::MODALITY);
            request
                .children_specification_mut(ResourceType::Instance)?
                .set_retrieve_count(true);
            request
                .children_specification_mut(ResourceType::Instance)?
                .add_metadata(MetadataType::SopClassUid);

            let response = t.index.execute_find(&request).await?;
            let study = response.by_public_id(STUDY_BRAIN)?;

            assert_eq!(study.children_count(ResourceType::Series), Some(2), "{}", t.backend());
            assert_eq!(study.children_count(ResourceType::Instance), Some(3));

            let modalities: Vec<&str> = study
                .children_main_dicom_tag_values(ResourceType::Series, tags::MODALITY)
                .into_iter()
                .flatten()
                .map(String::as_str)
                .collect();
            assert_eq!(sorted(modalities), sorted(["CT", "MR"]));

            let sop_classes: BTreeSet<&str> = study
                .children_metadata_values(ResourceType::Instance, MetadataType::SopClassUid)
                .into_iter()
                .flatten()
                .map(String::as_str)
                .collect();
            assert_eq!(sop_classes.len(), 2);
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn one_instance_belongs_to_its_resource() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;

            let mut request = FindRequest::new(ResourceType::Series);
            request.set_retrieve_one_instance_identifier(true)?;
            request
                .children_specification_mut(ResourceType::Instance)?
                .set_retrieve_identifiers(true);

            let response = t.index.execute_find(&request).await?;
            assert_eq!(response.len(), 4);
            for series in response.iter() {
                let instance = series
                    .one_instance_identifier()
                    .expect("every series has an instance");
                assert!(
                    series
                        .children_identifiers(ResourceType::Instance)?
                        .contains(instance),
                    "{} not below {} ({})",
                    instance,
                    series.public_id(),
                    t.backend()
                );
            }
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn pages_partition_the_answers() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;

            let page = |since: u64| {
                let mut request = FindRequest::new(ResourceType::Instance);
                request.set_limits(since, 2);
                request
            };

            let mut seen = Vec::new();
            for since in [0, 2, 4] {
                let response = t.index.execute_find(&page(since)).await?;
                assert!(response.len() <= 2);
                seen.extend(response.iter().map(|r| r.public_id().to_string()));
            }

            let distinct: BTreeSet<&String> = seen.iter().collect();
            assert_eq!(distinct.len(), seen.len(), "pages overlap on {}", t.backend());
            assert_eq!(sorted(&seen), sorted(["i1", "i2", "i3", "i4", "i5"]));

            // Same page, same answers.
            let first = t.index.execute_find(&page(0)).await?;
            let again = t.index.execute_find(&page(0)).await?;
            let ids = |r: &dicom_index::find::FindResponse| {
                r.iter().map(|x| x.public_id().to_string()).collect::<Vec<_>>()
            };
            assert_eq!(ids(&first), ids(&again));

            let past_end = t.index.execute_find(&page(10)).await?;
            assert!(past_end.is_empty());
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn paging_applies_after_the_lookup() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;

            let mut request = FindRequest::new(ResourceType::Series);
            constrain(t, &mut request, tags::MODALITY, "CT")?;
            request.set_limits(1, 0);
            let rest = t.find_ids(&request).await?;
            assert_eq!(rest.len(), 1, "{}", t.backend());

            request.set_limits(0, 1);
            let first = t.find_ids(&request).await?;
            assert_eq!(first.len(), 1);
            assert_ne!(first, rest);
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn parents_list_their_children() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;

            let mut studies = FindRequest::new(ResourceType::Study);
            studies.set_retrieve_parent_identifier(true)?;
            let studies = t.index.execute_find(&studies).await?;

            let mut patients = FindRequest::new(ResourceType::Patient);
            patients
                .children_specification_mut(ResourceType::Study)?
                .set_retrieve_identifiers(true);
            let patients = t.index.execute_find(&patients).await?;

            for study in studies.iter() {
                let parent = study.parent_identifier().expect("studies have a parent");
                let patient = patients.by_public_id(parent)?;
                assert!(patient
                    .children_identifiers(ResourceType::Study)?
                    .contains(study.public_id()));
            }
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn count_agrees_with_find() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;

            let mut request = FindRequest::new(ResourceType::Series);
            constrain(t, &mut request, tags::MODALITY, "MR")?;
            let found = t.find_ids(&request).await?;
            assert_eq!(found, sorted([SERIES_BRAIN_MR, SERIES_KNEE_MR]));
            assert_eq!(t.index.execute_count(&request).await?, 2, "{}", t.backend());
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn unknown_public_id_finds_nothing() -> anyhow::Result<()> {
    with_both_backends(|t| {
        Box::pin(async move {
            populate(t).await?;

            let mut request = FindRequest::new(ResourceType::Study);
            request.set_orthanc_id(ResourceType::Study, "missing")?;
            assert!(t.find_ids(&request).await?.is_empty(), "{}", t.backend());
            Ok(())
        })
    })
    .await
}

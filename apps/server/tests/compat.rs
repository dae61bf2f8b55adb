#![allow(unused)]
#[allow(unused)]
mod support;

use dicom_dictionary_std::tags;

use dicom_index::db::search::{
    ConstraintType, DatabaseDicomTagConstraint, DatabaseMetadataConstraint, OrderBy,
    OrderingCast, OrderingDirection,
};
use dicom_index::db::{GenericFind, Transaction};
use dicom_index::find::{FindRequest, FindResponse};
use dicom_index::models::{MetadataType, ResourceType, TransactionType};
use dicom_index::Error;
use support::ids::*;
use support::{populate, sorted, with_test_index};

fn ct_series() -> anyhow::Result<DatabaseDicomTagConstraint> {
    Ok(DatabaseDicomTagConstraint::new(
        ResourceType::Series,
        tags::MODALITY,
        false,
        ConstraintType::Equal,
        vec!["CT".to_string()],
        true,
        true,
    )?)
}

fn anonymized_from(value: &str) -> anyhow::Result<DatabaseMetadataConstraint> {
    Ok(DatabaseMetadataConstraint::new(
        MetadataType::AnonymizedFrom,
        ConstraintType::Equal,
        vec![value.to_string()],
        true,
        true,
    )?)
}

#[tokio::test]
async fn metadata_constraints_need_native_find() -> anyhow::Result<()> {
    for native_find in [true, false] {
        with_test_index(native_find, |t| {
            Box::pin(async move {
                populate(t).await?;
                t.index
                    .set_metadata(STUDY_CHEST, MetadataType::AnonymizedFrom, "original")
                    .await?;

                let mut request = FindRequest::new(ResourceType::Study);
                request.add_metadata_constraint(anonymized_from("original")?);

                let result = t.find_ids(&request).await;
                if t.native_find() {
                    assert_eq!(result?, vec![STUDY_CHEST.to_string()]);
                } else {
                    let err = result.expect_err("metadata constraints are refused");
                    assert!(matches!(
                        err.downcast_ref::<Error>(),
                        Some(Error::NotImplemented(_))
                    ));
                }
                Ok(())
            })
        })
        .await?;
    }
    Ok(())
}

#[tokio::test]
async fn ordering_needs_native_find() -> anyhow::Result<()> {
    for native_find in [true, false] {
        with_test_index(native_find, |t| {
            Box::pin(async move {
                populate(t).await?;

                let mut request = FindRequest::new(ResourceType::Study);
                request.add_ordering(OrderBy::tag(
                    tags::STUDY_DATE,
                    OrderingCast::String,
                    OrderingDirection::Descending,
                ));

                let result = t.index.execute_find(&request).await;
                if t.native_find() {
                    let ids: Vec<String> = result?
                        .iter()
                        .map(|r| r.public_id().to_string())
                        .collect();
                    assert_eq!(ids, vec![STUDY_KNEE, STUDY_CHEST, STUDY_BRAIN]);
                } else {
                    assert!(matches!(result, Err(Error::NotImplemented(_))));
                }
                Ok(())
            })
        })
        .await?;
    }
    Ok(())
}

#[tokio::test]
async fn ordering_ties_page_consistently() -> anyhow::Result<()> {
    with_test_index(true, |t| {
        Box::pin(async move {
            populate(t).await?;

            // CT, CT, MR, MR: ties are ranked by public id.
            let page = |since: u64| {
                let mut request = FindRequest::new(ResourceType::Series);
                request.add_ordering(OrderBy::tag(
                    tags::MODALITY,
                    OrderingCast::String,
                    OrderingDirection::Ascending,
                ));
                request.set_retrieve_main_dicom_tags(true);
                request.set_limits(since, 2);
                request
            };

            let mut pages = Vec::new();
            for since in [0, 1, 2] {
                let response = t.index.execute_find(&page(since)).await?;
                let ids: Vec<String> = response
                    .iter()
                    .map(|r| r.public_id().to_string())
                    .collect();
                for resource in response.iter() {
                    assert!(resource
                        .main_dicom_tags(ResourceType::Series)?
                        .lookup_string(tags::MODALITY)
                        .is_some());
                }
                pages.push(ids);
            }
            assert_eq!(
                pages,
                vec![
                    vec![SERIES_BRAIN_CT, SERIES_CHEST_CT],
                    vec![SERIES_CHEST_CT, SERIES_BRAIN_MR],
                    vec![SERIES_BRAIN_MR, SERIES_KNEE_MR],
                ]
            );
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn native_find_is_refused_when_disabled() -> anyhow::Result<()> {
    with_test_index(false, |t| {
        Box::pin(async move {
            let mut tx = t.transaction(TransactionType::ReadOnly).await?;
            let request = FindRequest::new(ResourceType::Patient);
            assert!(matches!(
                tx.execute_find(&request).await,
                Err(Error::NotImplemented(_))
            ));
            tx.commit(0).await?;
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn walks_children_of_the_scope() -> anyhow::Result<()> {
    with_test_index(false, |t| {
        Box::pin(async move {
            populate(t).await?;

            let mut request = FindRequest::new(ResourceType::Instance);
            request.set_orthanc_id(ResourceType::Patient, PATIENT_1)?;
            request.set_limits(1, 2);

            let mut tx = t.transaction(TransactionType::ReadOnly).await?;
            let page = GenericFind::new(tx.as_mut())
                .execute_find(&request, t.index.capabilities())
                .await?;
            request.clear_limits();
            let all = GenericFind::new(tx.as_mut())
                .execute_find(&request, t.index.capabilities())
                .await?;
            tx.commit(0).await?;

            assert_eq!(sorted(&all), sorted(["i1", "i2", "i3", "i4"]));
            assert_eq!(page, all[1..3].to_vec());
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn scope_must_not_be_below_the_query_level() -> anyhow::Result<()> {
    for native_find in [true, false] {
        with_test_index(native_find, |t| {
            Box::pin(async move {
                populate(t).await?;

                let mut request = FindRequest::new(ResourceType::Study);
                assert!(matches!(
                    request.set_orthanc_id(ResourceType::Instance, "i1"),
                    Err(Error::BadSequenceOfCalls(_))
                ));
                assert!(request.orthanc_identifiers().is_empty());
                assert_eq!(
                    t.find_ids(&request).await?,
                    sorted([STUDY_BRAIN, STUDY_CHEST, STUDY_KNEE]),
                    "{}",
                    t.backend()
                );
                Ok(())
            })
        })
        .await?;
    }
    Ok(())
}

#[tokio::test]
async fn unknown_scope_is_an_error() -> anyhow::Result<()> {
    with_test_index(false, |t| {
        Box::pin(async move {
            populate(t).await?;

            let mut request = FindRequest::new(ResourceType::Series);
            request.set_orthanc_id(ResourceType::Study, "missing")?;

            let mut tx = t.transaction(TransactionType::ReadOnly).await?;
            let result = GenericFind::new(tx.as_mut())
                .execute_find(&request, t.index.capabilities())
                .await;
            tx.commit(0).await?;
            assert!(matches!(result, Err(Error::InexistentItem(_))));
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn scoped_lookup_is_filtered_by_ancestry() -> anyhow::Result<()> {
    with_test_index(false, |t| {
        Box::pin(async move {
            populate(t).await?;

            let mut request = FindRequest::new(ResourceType::Series);
            request.set_orthanc_id(ResourceType::Patient, PATIENT_1)?;
            request.dicom_tag_constraints_mut().add(ct_series()?);
            assert_eq!(
                t.find_ids(&request).await?,
                sorted([SERIES_BRAIN_CT, SERIES_CHEST_CT])
            );

            request.set_orthanc_id(ResourceType::Study, STUDY_CHEST)?;
            assert_eq!(t.find_ids(&request).await?, vec![SERIES_CHEST_CT.to_string()]);

            let mut request = FindRequest::new(ResourceType::Series);
            request.set_orthanc_id(ResourceType::Patient, PATIENT_1)?;
            request.dicom_tag_constraints_mut().add(ct_series()?);
            request.set_limits(0, 1);
            let page = t.find_ids(&request).await?;
            assert_eq!(page.len(), 1);
            assert!([SERIES_BRAIN_CT, SERIES_CHEST_CT].contains(&page[0].as_str()));
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn expanding_a_vanished_resource_adds_nothing() -> anyhow::Result<()> {
    with_test_index(false, |t| {
        Box::pin(async move {
            populate(t).await?;

            let mut request = FindRequest::new(ResourceType::Study);
            request.set_retrieve_main_dicom_tags(true);
            let mut response = FindResponse::new(ResourceType::Study);

            let mut tx = t.transaction(TransactionType::ReadOnly).await?;
            let mut find = GenericFind::new(tx.as_mut());
            find.execute_expand(&mut response, &request, "missing").await?;
            find.execute_expand(&mut response, &request, STUDY_KNEE).await?;
            tx.commit(0).await?;

            assert_eq!(response.len(), 1);
            let study = response.by_public_id(STUDY_KNEE)?;
            assert_eq!(
                study
                    .main_dicom_tags(ResourceType::Study)?
                    .lookup_string(tags::STUDY_DESCRIPTION),
                Some("Knee")
            );
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn expanding_at_the_wrong_level_is_corruption() -> anyhow::Result<()> {
    with_test_index(false, |t| {
        Box::pin(async move {
            populate(t).await?;

            let request = FindRequest::new(ResourceType::Study);
            let mut response = FindResponse::new(ResourceType::Study);

            let mut tx = t.transaction(TransactionType::ReadOnly).await?;
            let result = GenericFind::new(tx.as_mut())
                .execute_expand(&mut response, &request, SERIES_KNEE_MR)
                .await;
            tx.commit(0).await?;
            assert!(matches!(result, Err(Error::DatabasePlugin(_))));
            Ok(())
        })
    })
    .await
}

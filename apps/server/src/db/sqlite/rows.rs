//! Row decoding and parameter binding shared by the SQLite queries.

use dicom_core::Tag;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite};

use crate::db::search::BindValue;
use crate::models::{CompressionType, FileContentType, FileInfo, ResourceType};
use crate::{Error, Result};

pub(super) fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    bind_params: &[BindValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in bind_params {
        query = match param {
            BindValue::Text(value) => query.bind(value.clone()),
            BindValue::Integer(value) => query.bind(*value),
        };
    }
    query
}

pub(super) fn tag_from_row(row: &SqliteRow) -> Result<Tag> {
    let group: i64 = row.try_get("tagGroup")?;
    let element: i64 = row.try_get("tagElement")?;
    match (u16::try_from(group), u16::try_from(element)) {
        (Ok(group), Ok(element)) => Ok(Tag(group, element)),
        _ => Err(Error::DatabasePlugin(format!(
            "Invalid tag ({group}, {element}) in the index"
        ))),
    }
}

pub(super) fn resource_type_from_row(row: &SqliteRow, column: &str) -> Result<ResourceType> {
    ResourceType::from_code(row.try_get(column)?)
}

fn size(value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::DatabasePlugin(format!("Negative attachment size: {value}")))
}

/// Reads the `AttachedFiles` columns of a row, with their revision.
pub(super) fn file_info_from_row(row: &SqliteRow) -> Result<(FileInfo, i64)> {
    let info = FileInfo {
        uuid: row.try_get("uuid")?,
        content_type: FileContentType::from_code(row.try_get("fileType")?)?,
        uncompressed_size: size(row.try_get("uncompressedSize")?)?,
        uncompressed_hash: row
            .try_get::<Option<String>, _>("uncompressedMD5")?
            .unwrap_or_default(),
        compression: CompressionType::from_code(row.try_get("compressionType")?)?,
        compressed_size: size(row.try_get("compressedSize")?)?,
        compressed_hash: row
            .try_get::<Option<String>, _>("compressedMD5")?
            .unwrap_or_default(),
        custom_data: row.try_get("customData")?,
    };
    Ok((info, row.try_get("revision")?))
}

pub(super) fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

//! Decoding of object-created notifications into CDC source files.

use chrono::NaiveDate;
use etl_config::shared::SourceConfig;
use serde::Deserialize;

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::outcome::SkipReason;
use crate::types::SourceObject;

/// Object-created notification document, e.g. an S3 event.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectEvent {
    #[serde(rename = "Records")]
    pub records: Vec<ObjectEventRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectEventRecord {
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Entity {
    pub bucket: S3Bucket,
    pub object: S3Object,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Bucket {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Object {
    /// URL-encoded object key.
    pub key: String,
}

impl ObjectEvent {
    pub fn from_json(body: &[u8]) -> EtlResult<Self> {
        let event: ObjectEvent = serde_json::from_slice(body).map_err(|err| {
            etl_error!(
                ErrorKind::InvalidEvent,
                "Invalid object event structure",
                detail = err.to_string(),
                source: err
            )
        })?;

        if event.records.is_empty() {
            return Err(etl_error!(
                ErrorKind::InvalidEvent,
                "Object event contains no records"
            ));
        }

        Ok(event)
    }

    /// Returns the objects of all records, keys decoded, in event order.
    pub fn objects(&self) -> Vec<SourceObject> {
        self.records
            .iter()
            .map(|record| {
                SourceObject::new(
                    record.s3.bucket.name.clone(),
                    decode_object_key(&record.s3.object.key),
                )
            })
            .collect()
    }
}

/// Decodes a URL-encoded object key, with `+` standing for a space.
///
/// Keys that do not decode to UTF-8 are returned unchanged.
pub fn decode_object_key(key: &str) -> String {
    let spaced = key.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => key.to_string(),
    }
}

/// CDC change file identified from an object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub object: SourceObject,
    pub database: String,
    pub table: String,
    pub date: NaiveDate,
    pub filename: String,
}

impl SourceFile {
    /// Ledger key of the file.
    pub fn file_key(&self) -> &str {
        &self.object.key
    }
}

/// Matches `[<root_prefix>/]<database>/<table>/<YYYY>/<MM>/<DD>/<file>.parquet`.
///
/// Keys that do not match, name a calendar-invalid date or a database outside the allow-list
/// are [`SkipReason::NotACdcFile`]. Full-load files are [`SkipReason::LoadFile`].
pub fn parse_source_file(config: &SourceConfig, object: SourceObject) -> Result<SourceFile, SkipReason> {
    let root_prefix = config.root_prefix.trim_matches('/');
    let relative = if root_prefix.is_empty() {
        object.key.as_str()
    } else {
        object
            .key
            .strip_prefix(root_prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or(SkipReason::NotACdcFile)?
    };

    let segments: Vec<&str> = relative.split('/').collect();
    let [database, table, year, month, day, filename] = segments.as_slice() else {
        return Err(SkipReason::NotACdcFile);
    };

    if database.is_empty() || table.is_empty() {
        return Err(SkipReason::NotACdcFile);
    }
    if !config.databases.is_empty() && !config.databases.iter().any(|db| db == database) {
        return Err(SkipReason::NotACdcFile);
    }
    match filename.strip_suffix(".parquet") {
        Some(stem) if !stem.is_empty() => {}
        _ => return Err(SkipReason::NotACdcFile),
    }

    let date = parse_partition_date(year, month, day).ok_or(SkipReason::NotACdcFile)?;

    if !config.full_load_prefix.is_empty() && filename.starts_with(&config.full_load_prefix) {
        return Err(SkipReason::LoadFile);
    }

    Ok(SourceFile {
        database: database.to_string(),
        table: table.to_string(),
        date,
        filename: filename.to_string(),
        object,
    })
}

fn parse_partition_date(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    let digits = |segment: &str, len: usize| {
        segment.len() == len && segment.bytes().all(|b| b.is_ascii_digit())
    };
    if !(digits(year, 4) && digits(month, 2) && digits(day, 2)) {
        return None;
    }

    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root_prefix: &str, databases: &[&str]) -> SourceConfig {
        serde_json::from_value(serde_json::json!({
            "bucket": "landing",
            "root_prefix": root_prefix,
            "databases": databases,
        }))
        .unwrap()
    }

    fn parse(config: &SourceConfig, key: &str) -> Result<SourceFile, SkipReason> {
        parse_source_file(config, SourceObject::new("landing", key))
    }

    #[test]
    fn change_file_paths_are_parsed() {
        let config = config("dms_job", &["fair"]);

        let file = parse(&config, "dms_job/fair/orders/2024/02/29/20240229-101500123.parquet").unwrap();

        assert_eq!(file.database, "fair");
        assert_eq!(file.table, "orders");
        assert_eq!(file.date, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(file.filename, "20240229-101500123.parquet");
        assert_eq!(
            file.file_key(),
            "dms_job/fair/orders/2024/02/29/20240229-101500123.parquet"
        );
    }

    #[test]
    fn non_matching_paths_are_not_cdc_files() {
        let config = config("dms_job", &["fair"]);

        let keys = [
            "dms_job/fair/orders/2024/02/30/a.parquet",
            "dms_job/fair/orders/2024/2/01/a.parquet",
            "dms_job/fair/orders/2024/02/01/a.csv",
            "dms_job/fair/orders/2024/02/01/.parquet",
            "dms_job/fair/orders/2024/02/01/extra/a.parquet",
            "dms_job/other/orders/2024/02/01/a.parquet",
            "other_job/fair/orders/2024/02/01/a.parquet",
            "dms_jobx/fair/orders/2024/02/01/a.parquet",
            "fair/orders/2024/02/01/a.parquet",
            "dms_job/fair//2024/02/01/a.parquet",
        ];

        for key in keys {
            assert_eq!(parse(&config, key), Err(SkipReason::NotACdcFile), "{key}");
        }
    }

    #[test]
    fn full_load_files_are_skipped() {
        let config = config("", &[]);

        assert_eq!(
            parse(&config, "fair/orders/2024/01/01/LOAD00000001.parquet"),
            Err(SkipReason::LoadFile)
        );
        assert!(parse(&config, "any/orders/2024/01/01/20240101-1.parquet").is_ok());
    }

    #[test]
    fn event_records_are_decoded_in_order() {
        let event = ObjectEvent::from_json(
            br#"{"Records": [
                {"s3": {"bucket": {"name": "landing"}, "object": {"key": "fair/order+lines/2024/01/01/a%3Db.parquet"}}},
                {"s3": {"bucket": {"name": "landing"}, "object": {"key": "fair/orders/2024/01/01/b.parquet"}}}
            ]}"#,
        )
        .unwrap();

        let objects = event.objects();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].key, "fair/order lines/2024/01/01/a=b.parquet");
        assert_eq!(objects[1].key, "fair/orders/2024/01/01/b.parquet");
    }

    #[test]
    fn malformed_events_are_rejected() {
        let err = ObjectEvent::from_json(br#"{"Records": []}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEvent);

        let err = ObjectEvent::from_json(br#"{"records": 1}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEvent);
    }
}

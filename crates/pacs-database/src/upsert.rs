//! 分层 upsert 引擎
//!
//! 一个批次的记录在同一事务内按 患者 → 检查 → 序列 → 图像 的顺序写入，
//! 任一语句失败整个批次回滚。提交后在紧随的第二个事务中重算被触及
//! 序列和检查的实例数，并清除这些序列的缩略图缓存。

use crate::connection::DatabasePool;
use chrono::{DateTime, Utc};
use pacs_core::{ImportRecord, PacsError, Result};
use sqlx::SqliteConnection;
use std::collections::BTreeSet;
use tracing::debug;
use uuid::Uuid;

/// 一个批次触及的检查和序列
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TouchedSet {
    pub study_uids: BTreeSet<String>,
    pub series_uids: BTreeSet<String>,
}

impl TouchedSet {
    pub fn is_empty(&self) -> bool {
        self.study_uids.is_empty() && self.series_uids.is_empty()
    }
}

/// 批次写入结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub images_written: usize,
    pub study_uids: Vec<String>,
    pub series_uids: Vec<String>,
}

/// 分层写入器
pub struct HierarchyWriter<'a> {
    pool: &'a DatabasePool,
}

impl<'a> HierarchyWriter<'a> {
    pub fn new(pool: &'a DatabasePool) -> Self {
        Self { pool }
    }

    /// 写入一个批次并刷新派生数据
    pub async fn import_batch(&self, records: &[ImportRecord]) -> Result<BatchOutcome> {
        if records.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let touched = self.commit_batch(records).await?;
        self.refresh_derived(&touched).await?;

        // 同一批次内重复的SOP实例UID只落成一行
        let images_written = records
            .iter()
            .map(|record| record.metadata.image.sop_instance_uid.as_str())
            .collect::<BTreeSet<_>>()
            .len();

        // 图像被移到别的序列时，原序列和原检查也在 touched 中
        Ok(BatchOutcome {
            images_written,
            study_uids: touched.study_uids.into_iter().collect(),
            series_uids: touched.series_uids.into_iter().collect(),
        })
    }

    /// 在单个事务中写入批次内全部记录
    pub async fn commit_batch(&self, records: &[ImportRecord]) -> Result<TouchedSet> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| PacsError::Database(e.to_string()))?;
        let now = Utc::now();
        let mut touched = TouchedSet::default();

        for record in records {
            let patient_key = upsert_patient(&mut tx, record, now).await?;

            let study_uid = &record.metadata.study.study_uid;
            let study_key = upsert_study(&mut tx, record, patient_key, now).await?;
            touched.study_uids.insert(study_uid.clone());

            if let Some(previous_study) =
                previous_study_of_series(&mut tx, &record.metadata.series.series_uid).await?
            {
                touched.study_uids.insert(previous_study);
            }
            let series_key = upsert_series(&mut tx, record, study_key, now).await?;
            touched
                .series_uids
                .insert(record.metadata.series.series_uid.clone());

            if let Some((previous_series, previous_study)) =
                previous_parents_of_image(&mut tx, &record.metadata.image.sop_instance_uid).await?
            {
                touched.series_uids.insert(previous_series);
                touched.study_uids.insert(previous_study);
            }
            upsert_image(&mut tx, record, series_key, now).await?;
        }

        tx.commit()
            .await
            .map_err(|e| PacsError::Database(e.to_string()))?;

        debug!(
            "批次已提交: {} 条记录, {} 个检查, {} 个序列",
            records.len(),
            touched.study_uids.len(),
            touched.series_uids.len()
        );
        Ok(touched)
    }

    /// 重算实例数并清除缩略图
    pub async fn refresh_derived(&self, touched: &TouchedSet) -> Result<()> {
        if touched.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| PacsError::Database(e.to_string()))?;
        refresh_counts(&mut tx, touched, Utc::now()).await?;
        tx.commit()
            .await
            .map_err(|e| PacsError::Database(e.to_string()))?;
        Ok(())
    }
}

/// 在调用方的事务中重算序列和检查的实例数，并清除序列缩略图
pub(crate) async fn refresh_counts(
    conn: &mut SqliteConnection,
    touched: &TouchedSet,
    now: DateTime<Utc>,
) -> Result<()> {
    for series_uid in &touched.series_uids {
        sqlx::query(
            r#"
            UPDATE series
            SET instance_count = (SELECT COUNT(*) FROM images WHERE images.series_id = series.id),
                updated_at = ?
            WHERE series_uid = ?
            "#,
        )
        .bind(now)
        .bind(series_uid)
        .execute(&mut *conn)
        .await
        .map_err(|e| PacsError::Database(e.to_string()))?;

        sqlx::query("DELETE FROM thumbnails WHERE series_uid = ?")
            .bind(series_uid)
            .execute(&mut *conn)
            .await
            .map_err(|e| PacsError::Database(e.to_string()))?;
    }

    for study_uid in &touched.study_uids {
        sqlx::query(
            r#"
            UPDATE studies
            SET instance_count = (
                    SELECT COUNT(*) FROM images
                    JOIN series ON images.series_id = series.id
                    WHERE series.study_id = studies.id
                ),
                updated_at = ?
            WHERE study_uid = ?
            "#,
        )
        .bind(now)
        .bind(study_uid)
        .execute(&mut *conn)
        .await
        .map_err(|e| PacsError::Database(e.to_string()))?;
    }

    Ok(())
}

async fn upsert_patient(
    conn: &mut SqliteConnection,
    record: &ImportRecord,
    now: DateTime<Utc>,
) -> Result<Uuid> {
    let patient = &record.metadata.patient;
    sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO patients (id, patient_id, folder_hint, name, sex, birth_date, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(patient_id, folder_hint) DO UPDATE SET
            name = excluded.name,
            sex = excluded.sex,
            birth_date = excluded.birth_date,
            updated_at = excluded.updated_at
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&patient.patient_id)
    .bind(&record.folder_hint)
    .bind(&patient.name)
    .bind(patient.sex.as_code())
    .bind(patient.birth_date)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| PacsError::Database(e.to_string()))
}

async fn upsert_study(
    conn: &mut SqliteConnection,
    record: &ImportRecord,
    patient_key: Uuid,
    now: DateTime<Utc>,
) -> Result<Uuid> {
    let study = &record.metadata.study;
    sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO studies (id, study_uid, patient_id, study_date, study_time, description,
                             accession_number, institution_name, referring_physician,
                             created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(study_uid) DO UPDATE SET
            patient_id = excluded.patient_id,
            study_date = excluded.study_date,
            study_time = excluded.study_time,
            description = excluded.description,
            accession_number = excluded.accession_number,
            institution_name = excluded.institution_name,
            referring_physician = excluded.referring_physician,
            updated_at = excluded.updated_at
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&study.study_uid)
    .bind(patient_key)
    .bind(study.study_date)
    .bind(&study.study_time)
    .bind(&study.description)
    .bind(&study.accession_number)
    .bind(&study.institution_name)
    .bind(&study.referring_physician)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| PacsError::Database(e.to_string()))
}

async fn upsert_series(
    conn: &mut SqliteConnection,
    record: &ImportRecord,
    study_key: Uuid,
    now: DateTime<Utc>,
) -> Result<Uuid> {
    let series = &record.metadata.series;
    sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO series (id, series_uid, study_id, modality, series_number, description,
                            body_part, frame_of_reference_uid, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(series_uid) DO UPDATE SET
            study_id = excluded.study_id,
            modality = excluded.modality,
            series_number = excluded.series_number,
            description = excluded.description,
            body_part = excluded.body_part,
            frame_of_reference_uid = excluded.frame_of_reference_uid,
            updated_at = excluded.updated_at
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&series.series_uid)
    .bind(study_key)
    .bind(&series.modality)
    .bind(series.series_number)
    .bind(&series.description)
    .bind(&series.body_part)
    .bind(&series.frame_of_reference_uid)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| PacsError::Database(e.to_string()))
}

async fn upsert_image(
    conn: &mut SqliteConnection,
    record: &ImportRecord,
    series_key: Uuid,
    now: DateTime<Utc>,
) -> Result<Uuid> {
    let image = &record.metadata.image;
    sqlx::query_scalar::<_, Uuid>(
        r#"
        INSERT INTO images (id, sop_instance_uid, series_id, sop_class_uid, instance_number,
                            pixel_rows, pixel_columns, pixel_spacing, image_orientation,
                            image_position, slice_thickness, slice_location, bits_allocated,
                            bits_stored, pixel_representation, photometric_interpretation,
                            number_of_frames, window_center, window_width, rescale_slope,
                            rescale_intercept, transfer_syntax_uid, file_path, file_size,
                            created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(sop_instance_uid) DO UPDATE SET
            series_id = excluded.series_id,
            sop_class_uid = excluded.sop_class_uid,
            instance_number = excluded.instance_number,
            pixel_rows = excluded.pixel_rows,
            pixel_columns = excluded.pixel_columns,
            pixel_spacing = excluded.pixel_spacing,
            image_orientation = excluded.image_orientation,
            image_position = excluded.image_position,
            slice_thickness = excluded.slice_thickness,
            slice_location = excluded.slice_location,
            bits_allocated = excluded.bits_allocated,
            bits_stored = excluded.bits_stored,
            pixel_representation = excluded.pixel_representation,
            photometric_interpretation = excluded.photometric_interpretation,
            number_of_frames = excluded.number_of_frames,
            window_center = excluded.window_center,
            window_width = excluded.window_width,
            rescale_slope = excluded.rescale_slope,
            rescale_intercept = excluded.rescale_intercept,
            transfer_syntax_uid = excluded.transfer_syntax_uid,
            file_path = excluded.file_path,
            file_size = excluded.file_size,
            updated_at = excluded.updated_at
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&image.sop_instance_uid)
    .bind(series_key)
    .bind(&image.sop_class_uid)
    .bind(image.instance_number)
    .bind(image.rows)
    .bind(image.columns)
    .bind(&image.pixel_spacing)
    .bind(&image.image_orientation)
    .bind(&image.image_position)
    .bind(image.slice_thickness)
    .bind(image.slice_location)
    .bind(image.bits_allocated)
    .bind(image.bits_stored)
    .bind(image.pixel_representation)
    .bind(&image.photometric_interpretation)
    .bind(image.number_of_frames)
    .bind(image.window_center)
    .bind(image.window_width)
    .bind(image.rescale_slope)
    .bind(image.rescale_intercept)
    .bind(&image.transfer_syntax_uid)
    .bind(&record.file_path)
    .bind(record.file_size)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| PacsError::Database(e.to_string()))
}

/// 序列当前所属检查的UID
async fn previous_study_of_series(
    conn: &mut SqliteConnection,
    series_uid: &str,
) -> Result<Option<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT st.study_uid FROM series se JOIN studies st ON st.id = se.study_id WHERE se.series_uid = ?",
    )
    .bind(series_uid)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| PacsError::Database(e.to_string()))
}

/// 图像当前所属序列和检查的UID
async fn previous_parents_of_image(
    conn: &mut SqliteConnection,
    sop_instance_uid: &str,
) -> Result<Option<(String, String)>> {
    sqlx::query_as::<_, (String, String)>(
        r#"
        SELECT se.series_uid, st.study_uid
        FROM images im
        JOIN series se ON se.id = im.series_id
        JOIN studies st ON st.id = se.study_id
        WHERE im.sop_instance_uid = ?
        "#,
    )
    .bind(sop_instance_uid)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| PacsError::Database(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::DatabaseQueries;
    use crate::testing::{open_temp_database, record};

    async fn counts(database: &DatabasePool) -> (i64, i64, i64, i64) {
        let queries = DatabaseQueries::new(database);
        (
            queries.count_patients().await.unwrap(),
            queries.count_studies().await.unwrap(),
            queries.count_series().await.unwrap(),
            queries.count_images().await.unwrap(),
        )
    }

    #[tokio::test]
    async fn test_import_is_idempotent() {
        let (_dir, database) = open_temp_database().await;
        let writer = HierarchyWriter::new(&database);
        let batch = vec![
            record("P1", "GLOBAL_MERGED", "1.1", "1.1.1", "1.1.1.1"),
            record("P1", "GLOBAL_MERGED", "1.1", "1.1.1", "1.1.1.2"),
            record("P2", "GLOBAL_MERGED", "2.1", "2.1.1", "2.1.1.1"),
        ];

        let outcome = writer.import_batch(&batch).await.unwrap();
        assert_eq!(outcome.images_written, 3);
        assert_eq!(outcome.study_uids, vec!["1.1", "2.1"]);
        let first = counts(&database).await;

        writer.import_batch(&batch).await.unwrap();
        assert_eq!(counts(&database).await, first);
        assert_eq!(first, (2, 2, 2, 3));
    }

    #[tokio::test]
    async fn test_duplicate_sop_in_batch_counts_once() {
        let (_dir, database) = open_temp_database().await;
        let writer = HierarchyWriter::new(&database);
        let outcome = writer
            .import_batch(&[
                record("P1", "GLOBAL_MERGED", "1.1", "1.1.1", "1.1.1.1"),
                record("P1", "GLOBAL_MERGED", "1.1", "1.1.1", "1.1.1.2"),
                record("P1", "GLOBAL_MERGED", "1.1", "1.1.2", "1.1.1.1"),
            ])
            .await
            .unwrap();

        assert_eq!(outcome.images_written, 2);
        assert_eq!(counts(&database).await.3, 2);

        // 后写入的记录决定图像所属序列
        let queries = DatabaseQueries::new(&database);
        let first = queries.get_series_by_uid("1.1.1").await.unwrap().unwrap();
        let second = queries.get_series_by_uid("1.1.2").await.unwrap().unwrap();
        assert_eq!(first.instance_count, 1);
        assert_eq!(second.instance_count, 1);
    }

    #[tokio::test]
    async fn test_counts_match_images() {
        let (_dir, database) = open_temp_database().await;
        let writer = HierarchyWriter::new(&database);
        writer
            .import_batch(&[
                record("P1", "GLOBAL_MERGED", "1.1", "1.1.1", "1.1.1.1"),
                record("P1", "GLOBAL_MERGED", "1.1", "1.1.1", "1.1.1.2"),
                record("P1", "GLOBAL_MERGED", "1.1", "1.1.2", "1.1.2.1"),
            ])
            .await
            .unwrap();
        writer
            .import_batch(&[record("P1", "GLOBAL_MERGED", "1.1", "1.1.2", "1.1.2.2")])
            .await
            .unwrap();

        let queries = DatabaseQueries::new(&database);
        let study = queries.get_study_by_uid("1.1").await.unwrap().unwrap();
        assert_eq!(study.instance_count, 4);
        for (series_uid, expected) in [("1.1.1", 2), ("1.1.2", 2)] {
            let series = queries.get_series_by_uid(series_uid).await.unwrap().unwrap();
            assert_eq!(series.instance_count, expected);
            let images = queries.get_images_by_series(&series.id).await.unwrap();
            assert_eq!(images.len() as i64, series.instance_count);
        }
    }

    #[tokio::test]
    async fn test_moved_image_updates_previous_series_count() {
        let (_dir, database) = open_temp_database().await;
        let writer = HierarchyWriter::new(&database);
        writer
            .import_batch(&[record("P1", "GLOBAL_MERGED", "1.1", "1.1.1", "1.1.1.1")])
            .await
            .unwrap();
        let outcome = writer
            .import_batch(&[record("P1", "GLOBAL_MERGED", "1.1", "1.1.2", "1.1.1.1")])
            .await
            .unwrap();
        assert_eq!(outcome.series_uids, vec!["1.1.1", "1.1.2"]);

        let queries = DatabaseQueries::new(&database);
        let old = queries.get_series_by_uid("1.1.1").await.unwrap().unwrap();
        let new = queries.get_series_by_uid("1.1.2").await.unwrap().unwrap();
        assert_eq!(old.instance_count, 0);
        assert_eq!(new.instance_count, 1);
    }

    #[tokio::test]
    async fn test_conflict_overwrites_mutable_fields() {
        let (_dir, database) = open_temp_database().await;
        let writer = HierarchyWriter::new(&database);
        let mut first = record("P1", "GLOBAL_MERGED", "1.1", "1.1.1", "1.1.1.1");
        writer.import_batch(&[first.clone()]).await.unwrap();

        first.metadata.study.description = Some("Changed".to_string());
        first.file_path = "/moved/1.1.1.1.dcm".to_string();
        writer.import_batch(&[first]).await.unwrap();

        let queries = DatabaseQueries::new(&database);
        let study = queries.get_study_by_uid("1.1").await.unwrap().unwrap();
        assert_eq!(study.description.as_deref(), Some("Changed"));
        let image = queries.get_image_by_uid("1.1.1.1").await.unwrap().unwrap();
        assert_eq!(image.file_path, "/moved/1.1.1.1.dcm");
        assert_eq!(queries.count_images().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_folder_hint_separates_patients() {
        let (_dir, database) = open_temp_database().await;
        HierarchyWriter::new(&database)
            .import_batch(&[
                record("0000000", "siteA/exam1", "1.1", "1.1.1", "1.1.1.1"),
                record("0000000", "siteB/exam2", "2.1", "2.1.1", "2.1.1.1"),
                record("MRN-7", "GLOBAL_MERGED", "3.1", "3.1.1", "3.1.1.1"),
                record("MRN-7", "GLOBAL_MERGED", "4.1", "4.1.1", "4.1.1.1"),
            ])
            .await
            .unwrap();

        let queries = DatabaseQueries::new(&database);
        assert_eq!(queries.count_patients().await.unwrap(), 3);
        assert!(queries
            .get_patient_by_key("0000000", "siteA/exam1")
            .await
            .unwrap()
            .is_some());
        let merged = queries
            .get_patient_by_key("MRN-7", "GLOBAL_MERGED")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queries.get_studies_by_patient(&merged.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_rows() {
        let (_dir, database) = open_temp_database().await;
        sqlx::query(
            r#"
            CREATE TRIGGER reject_bad_image BEFORE INSERT ON images
            WHEN NEW.sop_instance_uid = 'bad'
            BEGIN
                SELECT RAISE(ABORT, 'rejected');
            END
            "#,
        )
        .execute(database.pool())
        .await
        .unwrap();

        let writer = HierarchyWriter::new(&database);
        let result = writer
            .import_batch(&[
                record("P1", "GLOBAL_MERGED", "1.1", "1.1.1", "1.1.1.1"),
                record("P1", "GLOBAL_MERGED", "1.1", "1.1.1", "bad"),
            ])
            .await;
        assert!(matches!(result, Err(PacsError::Database(_))));
        assert_eq!(counts(&database).await, (0, 0, 0, 0));
    }

    #[tokio::test]
    async fn test_touched_series_loses_thumbnail() {
        let (_dir, database) = open_temp_database().await;
        let writer = HierarchyWriter::new(&database);
        writer
            .import_batch(&[
                record("P1", "GLOBAL_MERGED", "1.1", "1.1.1", "1.1.1.1"),
                record("P1", "GLOBAL_MERGED", "1.1", "1.1.2", "1.1.2.1"),
            ])
            .await
            .unwrap();

        let queries = DatabaseQueries::new(&database);
        queries.put_thumbnail("1.1.1", b"old").await.unwrap();
        queries.put_thumbnail("1.1.2", b"kept").await.unwrap();

        writer
            .import_batch(&[record("P1", "GLOBAL_MERGED", "1.1", "1.1.1", "1.1.1.2")])
            .await
            .unwrap();

        assert!(queries.get_thumbnail("1.1.1").await.unwrap().is_none());
        assert!(queries.get_thumbnail("1.1.2").await.unwrap().is_some());
    }
}

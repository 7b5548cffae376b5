//! 数据库查询操作

use crate::connection::DatabasePool;
use crate::models::*;
use crate::upsert::{refresh_counts, TouchedSet};
use chrono::Utc;
use pacs_core::{Image, PacsError, Patient, Result, SavedQuery, Series, Study, Thumbnail};
use uuid::Uuid;

const SCHEMA: [&str; 6] = [
    r#"
    CREATE TABLE IF NOT EXISTS patients (
        id BLOB PRIMARY KEY,
        patient_id TEXT NOT NULL,
        folder_hint TEXT NOT NULL,
        name TEXT NOT NULL,
        sex TEXT NOT NULL,
        birth_date TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (patient_id, folder_hint)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS studies (
        id BLOB PRIMARY KEY,
        study_uid TEXT NOT NULL UNIQUE,
        patient_id BLOB NOT NULL REFERENCES patients(id) ON DELETE CASCADE,
        study_date TEXT,
        study_time TEXT,
        description TEXT,
        accession_number TEXT,
        institution_name TEXT,
        referring_physician TEXT,
        instance_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS series (
        id BLOB PRIMARY KEY,
        series_uid TEXT NOT NULL UNIQUE,
        study_id BLOB NOT NULL REFERENCES studies(id) ON DELETE CASCADE,
        modality TEXT NOT NULL,
        series_number INTEGER,
        description TEXT,
        body_part TEXT,
        frame_of_reference_uid TEXT,
        instance_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS images (
        id BLOB PRIMARY KEY,
        sop_instance_uid TEXT NOT NULL UNIQUE,
        series_id BLOB NOT NULL REFERENCES series(id) ON DELETE CASCADE,
        sop_class_uid TEXT,
        instance_number INTEGER,
        pixel_rows INTEGER,
        pixel_columns INTEGER,
        pixel_spacing TEXT,
        image_orientation TEXT,
        image_position TEXT,
        slice_thickness REAL,
        slice_location REAL,
        bits_allocated INTEGER,
        bits_stored INTEGER,
        pixel_representation INTEGER,
        photometric_interpretation TEXT,
        number_of_frames INTEGER,
        window_center REAL,
        window_width REAL,
        rescale_slope REAL,
        rescale_intercept REAL,
        transfer_syntax_uid TEXT,
        file_path TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS thumbnails (
        series_uid TEXT PRIMARY KEY REFERENCES series(series_uid) ON DELETE CASCADE,
        data BLOB NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS saved_queries (
        id BLOB PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        filters TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

const INDEXES: [&str; 4] = [
    "CREATE INDEX IF NOT EXISTS idx_studies_patient_id ON studies(patient_id)",
    "CREATE INDEX IF NOT EXISTS idx_series_study_id ON series(study_id)",
    "CREATE INDEX IF NOT EXISTS idx_images_series_id ON images(series_id)",
    "CREATE INDEX IF NOT EXISTS idx_images_file_path ON images(file_path)",
];

/// 数据库查询操作接口
pub struct DatabaseQueries<'a> {
    pool: &'a DatabasePool,
}

impl<'a> DatabaseQueries<'a> {
    pub fn new(pool: &'a DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        for statement in SCHEMA.iter().chain(INDEXES.iter()) {
            sqlx::query(statement)
                .execute(pool)
                .await
                .map_err(|e| PacsError::Database(e.to_string()))?;
        }

        tracing::debug!("Database tables created successfully");
        Ok(())
    }

    // ========== 患者相关操作 ==========

    /// 列出全部患者
    pub async fn list_patients(&self) -> Result<Vec<Patient>> {
        let results = sqlx::query_as::<_, DbPatient>(
            "SELECT * FROM patients ORDER BY name, patient_id, folder_hint",
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| PacsError::Database(e.to_string()))?;

        Ok(results.into_iter().map(Patient::from).collect())
    }

    /// 根据ID查找患者
    pub async fn get_patient_by_id(&self, id: &Uuid) -> Result<Option<Patient>> {
        let result = sqlx::query_as::<_, DbPatient>("SELECT * FROM patients WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| PacsError::Database(e.to_string()))?;

        Ok(result.map(Patient::from))
    }

    /// 根据 (患者ID, folder hint) 查找患者
    pub async fn get_patient_by_key(
        &self,
        patient_id: &str,
        folder_hint: &str,
    ) -> Result<Option<Patient>> {
        let result = sqlx::query_as::<_, DbPatient>(
            "SELECT * FROM patients WHERE patient_id = ? AND folder_hint = ?",
        )
        .bind(patient_id)
        .bind(folder_hint)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| PacsError::Database(e.to_string()))?;

        Ok(result.map(Patient::from))
    }

    // ========== 检查相关操作 ==========

    /// 根据检查UID查找检查
    pub async fn get_study_by_uid(&self, study_uid: &str) -> Result<Option<Study>> {
        let result = sqlx::query_as::<_, DbStudy>("SELECT * FROM studies WHERE study_uid = ?")
            .bind(study_uid)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| PacsError::Database(e.to_string()))?;

        Ok(result.map(Study::from))
    }

    /// 根据患者获取所有检查
    pub async fn get_studies_by_patient(&self, patient: &Uuid) -> Result<Vec<Study>> {
        let results = sqlx::query_as::<_, DbStudy>(
            "SELECT * FROM studies WHERE patient_id = ? ORDER BY study_date DESC, study_time DESC",
        )
        .bind(patient)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| PacsError::Database(e.to_string()))?;

        Ok(results.into_iter().map(Study::from).collect())
    }

    // ========== 序列相关操作 ==========

    /// 根据序列UID查找序列
    pub async fn get_series_by_uid(&self, series_uid: &str) -> Result<Option<Series>> {
        let result = sqlx::query_as::<_, DbSeries>("SELECT * FROM series WHERE series_uid = ?")
            .bind(series_uid)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| PacsError::Database(e.to_string()))?;

        Ok(result.map(Series::from))
    }

    /// 根据检查获取所有序列
    pub async fn get_series_by_study(&self, study: &Uuid) -> Result<Vec<Series>> {
        let results = sqlx::query_as::<_, DbSeries>(
            "SELECT * FROM series WHERE study_id = ? ORDER BY series_number, series_uid",
        )
        .bind(study)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| PacsError::Database(e.to_string()))?;

        Ok(results.into_iter().map(Series::from).collect())
    }

    // ========== 图像相关操作 ==========

    /// 根据SOP实例UID查找图像
    pub async fn get_image_by_uid(&self, sop_instance_uid: &str) -> Result<Option<Image>> {
        let result =
            sqlx::query_as::<_, DbImage>("SELECT * FROM images WHERE sop_instance_uid = ?")
                .bind(sop_instance_uid)
                .fetch_optional(self.pool.pool())
                .await
                .map_err(|e| PacsError::Database(e.to_string()))?;

        Ok(result.map(Image::from))
    }

    /// 根据文件路径查找图像
    pub async fn get_image_by_path(&self, file_path: &str) -> Result<Option<Image>> {
        let result = sqlx::query_as::<_, DbImage>(
            "SELECT * FROM images WHERE file_path = ? ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(file_path)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| PacsError::Database(e.to_string()))?;

        Ok(result.map(Image::from))
    }

    /// 根据序列获取所有图像
    pub async fn get_images_by_series(&self, series: &Uuid) -> Result<Vec<Image>> {
        let results = sqlx::query_as::<_, DbImage>(
            "SELECT * FROM images WHERE series_id = ? ORDER BY instance_number, sop_instance_uid",
        )
        .bind(series)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| PacsError::Database(e.to_string()))?;

        Ok(results.into_iter().map(Image::from).collect())
    }

    // ========== 统计 ==========

    pub async fn count_patients(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM patients").await
    }

    pub async fn count_studies(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM studies").await
    }

    pub async fn count_series(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM series").await
    }

    pub async fn count_images(&self) -> Result<i64> {
        self.count("SELECT COUNT(*) FROM images").await
    }

    async fn count(&self, sql: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(sql)
            .fetch_one(self.pool.pool())
            .await
            .map_err(|e| PacsError::Database(e.to_string()))
    }

    // ========== 删除 ==========

    /// 删除患者及其全部检查、序列、图像
    pub async fn delete_patient(&self, id: &Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM patients WHERE id = ?")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| PacsError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// 删除检查及其全部序列、图像
    pub async fn delete_study(&self, id: &Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM studies WHERE id = ?")
            .bind(id)
            .execute(self.pool.pool())
            .await
            .map_err(|e| PacsError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// 删除序列及其图像，并在同一事务中重算所属检查的实例数
    pub async fn delete_series(&self, id: &Uuid) -> Result<bool> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| PacsError::Database(e.to_string()))?;

        let study_uid: Option<String> = sqlx::query_scalar(
            "SELECT st.study_uid FROM series se JOIN studies st ON st.id = se.study_id WHERE se.id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| PacsError::Database(e.to_string()))?;

        let Some(study_uid) = study_uid else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM series WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| PacsError::Database(e.to_string()))?;

        let mut touched = TouchedSet::default();
        touched.study_uids.insert(study_uid);
        refresh_counts(&mut tx, &touched, Utc::now()).await?;

        tx.commit()
            .await
            .map_err(|e| PacsError::Database(e.to_string()))?;
        Ok(true)
    }

    // ========== 缩略图缓存 ==========

    /// 写入或替换序列缩略图
    pub async fn put_thumbnail(&self, series_uid: &str, data: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO thumbnails (series_uid, data, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(series_uid) DO UPDATE SET data = excluded.data, created_at = excluded.created_at
            "#,
        )
        .bind(series_uid)
        .bind(data)
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await
        .map_err(|e| PacsError::Database(e.to_string()))?;

        Ok(())
    }

    pub async fn get_thumbnail(&self, series_uid: &str) -> Result<Option<Thumbnail>> {
        let result =
            sqlx::query_as::<_, DbThumbnail>("SELECT * FROM thumbnails WHERE series_uid = ?")
                .bind(series_uid)
                .fetch_optional(self.pool.pool())
                .await
                .map_err(|e| PacsError::Database(e.to_string()))?;

        Ok(result.map(Thumbnail::from))
    }

    // ========== 保存的查询 ==========

    /// 按名称保存查询条件，同名时覆盖
    pub async fn save_query(&self, name: &str, filters: &serde_json::Value) -> Result<SavedQuery> {
        if name.trim().is_empty() {
            return Err(PacsError::Validation("查询名称不能为空".to_string()));
        }

        let now = Utc::now();
        let result = sqlx::query_as::<_, DbSavedQuery>(
            r#"
            INSERT INTO saved_queries (id, name, filters, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET filters = excluded.filters, updated_at = excluded.updated_at
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name.trim())
        .bind(serde_json::to_string(filters)?)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| PacsError::Database(e.to_string()))?;

        SavedQuery::try_from(result)
    }

    pub async fn list_saved_queries(&self) -> Result<Vec<SavedQuery>> {
        let results = sqlx::query_as::<_, DbSavedQuery>("SELECT * FROM saved_queries ORDER BY name")
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| PacsError::Database(e.to_string()))?;

        results.into_iter().map(SavedQuery::try_from).collect()
    }

    pub async fn delete_saved_query(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM saved_queries WHERE name = ?")
            .bind(name)
            .execute(self.pool.pool())
            .await
            .map_err(|e| PacsError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

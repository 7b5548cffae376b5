//! 数据库模型

use chrono::{DateTime, NaiveDate, Utc};
use pacs_core::models::*;
use pacs_core::PacsError;
use sqlx::FromRow;
use uuid::Uuid;

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库患者表
#[derive(Debug, FromRow)]
pub struct DbPatient {
    pub id: Uuid,
    pub patient_id: String,
    pub folder_hint: String,
    pub name: String,
    pub sex: String, // 存储为 M/F/O
    pub birth_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DbPatient> for Patient {
    fn from(db_patient: DbPatient) -> Self {
        Patient {
            id: db_patient.id,
            patient_id: db_patient.patient_id,
            folder_hint: db_patient.folder_hint,
            name: db_patient.name,
            sex: Sex::from_code(&db_patient.sex),
            birth_date: db_patient.birth_date,
            created_at: db_patient.created_at,
            updated_at: db_patient.updated_at,
        }
    }
}

/// 数据库检查表
#[derive(Debug, FromRow)]
pub struct DbStudy {
    pub id: Uuid,
    pub study_uid: String,
    pub patient_id: Uuid,
    pub study_date: Option<NaiveDate>,
    pub study_time: Option<String>,
    pub description: Option<String>,
    pub accession_number: Option<String>,
    pub institution_name: Option<String>,
    pub referring_physician: Option<String>,
    pub instance_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DbStudy> for Study {
    fn from(db_study: DbStudy) -> Self {
        Study {
            id: db_study.id,
            study_uid: db_study.study_uid,
            patient_id: db_study.patient_id,
            study_date: db_study.study_date,
            study_time: db_study.study_time,
            description: db_study.description,
            accession_number: db_study.accession_number,
            institution_name: db_study.institution_name,
            referring_physician: db_study.referring_physician,
            instance_count: db_study.instance_count,
            created_at: db_study.created_at,
            updated_at: db_study.updated_at,
        }
    }
}

/// 数据库序列表
#[derive(Debug, FromRow)]
pub struct DbSeries {
    pub id: Uuid,
    pub series_uid: String,
    pub study_id: Uuid,
    pub modality: String,
    pub series_number: Option<i32>,
    pub description: Option<String>,
    pub body_part: Option<String>,
    pub frame_of_reference_uid: Option<String>,
    pub instance_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DbSeries> for Series {
    fn from(db_series: DbSeries) -> Self {
        Series {
            id: db_series.id,
            series_uid: db_series.series_uid,
            study_id: db_series.study_id,
            modality: db_series.modality,
            series_number: db_series.series_number,
            description: db_series.description,
            body_part: db_series.body_part,
            frame_of_reference_uid: db_series.frame_of_reference_uid,
            instance_count: db_series.instance_count,
            created_at: db_series.created_at,
            updated_at: db_series.updated_at,
        }
    }
}

/// 数据库图像表
#[derive(Debug, FromRow)]
pub struct DbImage {
    pub id: Uuid,
    pub sop_instance_uid: String,
    pub series_id: Uuid,
    pub sop_class_uid: Option<String>,
    pub instance_number: Option<i32>,
    pub pixel_rows: Option<i32>,
    pub pixel_columns: Option<i32>,
    pub pixel_spacing: Option<String>,
    pub image_orientation: Option<String>,
    pub image_position: Option<String>,
    pub slice_thickness: Option<f64>,
    pub slice_location: Option<f64>,
    pub bits_allocated: Option<i32>,
    pub bits_stored: Option<i32>,
    pub pixel_representation: Option<i32>,
    pub photometric_interpretation: Option<String>,
    pub number_of_frames: Option<i32>,
    pub window_center: Option<f64>,
    pub window_width: Option<f64>,
    pub rescale_slope: Option<f64>,
    pub rescale_intercept: Option<f64>,
    pub transfer_syntax_uid: Option<String>,
    pub file_path: String,
    pub file_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DbImage> for Image {
    fn from(db_image: DbImage) -> Self {
        Image {
            id: db_image.id,
            series_id: db_image.series_id,
            attributes: ImageAttributes {
                sop_instance_uid: db_image.sop_instance_uid,
                sop_class_uid: db_image.sop_class_uid,
                instance_number: db_image.instance_number,
                rows: db_image.pixel_rows,
                columns: db_image.pixel_columns,
                pixel_spacing: db_image.pixel_spacing,
                image_orientation: db_image.image_orientation,
                image_position: db_image.image_position,
                slice_thickness: db_image.slice_thickness,
                slice_location: db_image.slice_location,
                bits_allocated: db_image.bits_allocated,
                bits_stored: db_image.bits_stored,
                pixel_representation: db_image.pixel_representation,
                photometric_interpretation: db_image.photometric_interpretation,
                number_of_frames: db_image.number_of_frames,
                window_center: db_image.window_center,
                window_width: db_image.window_width,
                rescale_slope: db_image.rescale_slope,
                rescale_intercept: db_image.rescale_intercept,
                transfer_syntax_uid: db_image.transfer_syntax_uid,
            },
            file_path: db_image.file_path,
            file_size: db_image.file_size,
            created_at: db_image.created_at,
            updated_at: db_image.updated_at,
        }
    }
}

/// 数据库缩略图表
#[derive(Debug, FromRow)]
pub struct DbThumbnail {
    pub series_uid: String,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl From<DbThumbnail> for Thumbnail {
    fn from(db_thumbnail: DbThumbnail) -> Self {
        Thumbnail {
            series_uid: db_thumbnail.series_uid,
            data: db_thumbnail.data,
            created_at: db_thumbnail.created_at,
        }
    }
}

/// 数据库保存查询表，过滤条件存储为JSON文本
#[derive(Debug, FromRow)]
pub struct DbSavedQuery {
    pub id: Uuid,
    pub name: String,
    pub filters: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbSavedQuery> for SavedQuery {
    type Error = PacsError;

    fn try_from(db_query: DbSavedQuery) -> Result<Self, Self::Error> {
        Ok(SavedQuery {
            id: db_query.id,
            name: db_query.name,
            filters: serde_json::from_str(&db_query.filters)?,
            created_at: db_query.created_at,
            updated_at: db_query.updated_at,
        })
    }
}

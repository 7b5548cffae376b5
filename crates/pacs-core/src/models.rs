//! 核心数据模型定义
//!
//! 分为三组：提取器输出的分层记录、索引库中的四级实体、导入任务。

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 缺失患者姓名时的默认值
pub const DEFAULT_PATIENT_NAME: &str = "Anonymous";
/// 缺失患者ID时的默认值
pub const DEFAULT_PATIENT_ID: &str = "UNKNOWN";
/// 缺失模态时的默认值
pub const DEFAULT_MODALITY: &str = "OT";

/// 性别枚举
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    Male,
    Female,
    #[default]
    Other,
}

impl Sex {
    /// 从DICOM代码 (M/F/O) 解析，无法识别的值归为 Other
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "M" => Sex::Male,
            "F" => Sex::Female,
            _ => Sex::Other,
        }
    }

    pub fn as_code(&self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
            Sex::Other => "O",
        }
    }
}

// ========== 提取记录 ==========

/// 患者层属性
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientAttributes {
    pub patient_id: String,
    pub name: String,
    pub birth_date: Option<NaiveDate>,
    pub sex: Sex,
}

impl Default for PatientAttributes {
    fn default() -> Self {
        Self {
            patient_id: DEFAULT_PATIENT_ID.to_string(),
            name: DEFAULT_PATIENT_NAME.to_string(),
            birth_date: None,
            sex: Sex::Other,
        }
    }
}

/// 检查层属性
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudyAttributes {
    pub study_uid: String,
    pub study_date: Option<NaiveDate>,
    pub study_time: Option<String>,
    pub description: Option<String>,
    pub accession_number: Option<String>,
    pub institution_name: Option<String>,
    pub referring_physician: Option<String>,
}

/// 序列层属性
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesAttributes {
    pub series_uid: String,
    pub modality: String,
    pub series_number: Option<i32>,
    pub description: Option<String>,
    pub body_part: Option<String>,
    pub frame_of_reference_uid: Option<String>,
}

impl Default for SeriesAttributes {
    fn default() -> Self {
        Self {
            series_uid: String::new(),
            modality: DEFAULT_MODALITY.to_string(),
            series_number: None,
            description: None,
            body_part: None,
            frame_of_reference_uid: None,
        }
    }
}

/// 图像层属性：几何、像素编码和显示默认值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageAttributes {
    pub sop_instance_uid: String,
    pub sop_class_uid: Option<String>,
    pub instance_number: Option<i32>,
    // 几何
    pub rows: Option<i32>,
    pub columns: Option<i32>,
    pub pixel_spacing: Option<String>,
    pub image_orientation: Option<String>,
    pub image_position: Option<String>,
    pub slice_thickness: Option<f64>,
    pub slice_location: Option<f64>,
    // 像素编码
    pub bits_allocated: Option<i32>,
    pub bits_stored: Option<i32>,
    pub pixel_representation: Option<i32>,
    pub photometric_interpretation: Option<String>,
    pub number_of_frames: Option<i32>,
    // 显示默认值
    pub window_center: Option<f64>,
    pub window_width: Option<f64>,
    pub rescale_slope: Option<f64>,
    pub rescale_intercept: Option<f64>,
    pub transfer_syntax_uid: Option<String>,
}

/// 提取器输出：一个DICOM文件的分层元数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedMetadata {
    /// 文件声明的字符集 (0008,0005)，原样保留
    pub specific_character_set: Option<String>,
    pub patient: PatientAttributes,
    pub study: StudyAttributes,
    pub series: SeriesAttributes,
    pub image: ImageAttributes,
}

/// 待写入索引的记录：元数据 + 文件信息 + 患者消歧键
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRecord {
    pub metadata: ExtractedMetadata,
    pub file_path: String,
    pub file_size: i64,
    pub folder_hint: String,
}

// ========== 索引实体 ==========

/// 患者
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub patient_id: String,  // 文件中的患者ID
    pub folder_hint: String, // 消歧键
    pub name: String,
    pub sex: Sex,
    pub birth_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 检查
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
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

/// 序列
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
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

/// 图像
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: Uuid,
    pub series_id: Uuid,
    pub attributes: ImageAttributes,
    pub file_path: String,
    pub file_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 序列缩略图缓存
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thumbnail {
    pub series_uid: String,
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// 保存的查询条件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedQuery {
    pub id: Uuid,
    pub name: String,
    pub filters: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ========== 导入任务 ==========

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Import,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    /// completed 与 failed 为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// 导入任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    /// 0-100
    pub progress: u8,
    pub details: String,
    pub error: Option<String>,
    pub total_files: usize,
    pub processed_files: usize,
    pub images_indexed: usize,
    pub files_skipped: usize,
    /// 失败时第一个未提交文件在输入列表中的下标
    pub first_unprocessed: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    pub fn new(total_files: usize) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: JobType::Import,
            status: JobStatus::Pending,
            progress: 0,
            details: format!("Queued {} files", total_files),
            error: None,
            total_files,
            processed_files: 0,
            images_indexed: 0,
            files_skipped: 0,
            first_unprocessed: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sex_codes() {
        assert_eq!(Sex::from_code("m"), Sex::Male);
        assert_eq!(Sex::from_code(" F "), Sex::Female);
        assert_eq!(Sex::from_code("X"), Sex::Other);
        assert_eq!(Sex::from_code(""), Sex::Other);
        assert_eq!(Sex::Other.as_code(), "O");
    }

    #[test]
    fn test_sentinel_defaults() {
        let metadata = ExtractedMetadata::default();
        assert_eq!(metadata.patient.patient_id, DEFAULT_PATIENT_ID);
        assert_eq!(metadata.patient.sex, Sex::Other);
        assert_eq!(metadata.series.modality, DEFAULT_MODALITY);
    }

    #[test]
    fn test_job_status_serialization() {
        let json = serde_json::to_string(&JobStatus::Active).unwrap();
        assert_eq!(json, "\"active\"");
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }
}

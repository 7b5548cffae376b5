//! 测试辅助

use crate::connection::{DatabaseOptions, DatabasePool};
use pacs_core::{
    ExtractedMetadata, ImageAttributes, ImportRecord, PatientAttributes, SeriesAttributes,
    StudyAttributes,
};
use tempfile::TempDir;

pub async fn open_temp_database() -> (TempDir, DatabasePool) {
    let dir = tempfile::tempdir().unwrap();
    let database = DatabasePool::open(&DatabaseOptions::new(dir.path().join("index.db")))
        .await
        .unwrap();
    (dir, database)
}

pub fn record(
    patient_id: &str,
    folder_hint: &str,
    study_uid: &str,
    series_uid: &str,
    sop_instance_uid: &str,
) -> ImportRecord {
    ImportRecord {
        metadata: ExtractedMetadata {
            specific_character_set: None,
            patient: PatientAttributes {
                patient_id: patient_id.to_string(),
                name: "Doe^John".to_string(),
                ..Default::default()
            },
            study: StudyAttributes {
                study_uid: study_uid.to_string(),
                description: Some("Chest".to_string()),
                ..Default::default()
            },
            series: SeriesAttributes {
                series_uid: series_uid.to_string(),
                modality: "CT".to_string(),
                ..Default::default()
            },
            image: ImageAttributes {
                sop_instance_uid: sop_instance_uid.to_string(),
                rows: Some(512),
                columns: Some(512),
                ..Default::default()
            },
        },
        file_path: format!("/data/{}.dcm", sop_instance_uid),
        file_size: 1024,
        folder_hint: folder_hint.to_string(),
    }
}

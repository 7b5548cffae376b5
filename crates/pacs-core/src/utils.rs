//! 通用工具函数

use uuid::Uuid;

/// 由名称确定性地派生DICOM UID (2.25 前缀 + 基于名称的UUID)
///
/// 同一名称总是得到同一UID，用于缺失UID时生成稳定的替代键。
pub fn derive_dicom_uid(name: &str) -> String {
    format!("2.25.{}", Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).as_u128())
}

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= 64
        && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !uid.starts_with('.')
        && !uid.ends_with('.')
        && !uid.contains("..")
}

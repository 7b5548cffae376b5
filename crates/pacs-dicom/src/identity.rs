//! 患者身份解析
//!
//! 为每条记录计算 folder hint。标识可信的记录全部合并到同一个 hint 下；
//! 匿名化记录按来源目录区分，避免不同来源的匿名患者因标识冲突被合并。

use pacs_core::ExtractedMetadata;
use std::path::Path;

/// 非匿名记录使用的固定 hint
pub const GLOBAL_MERGED: &str = "GLOBAL_MERGED";
/// 无法从路径得到目录时使用的 hint
pub const ANONYMOUS_FALLBACK: &str = "ANONYMOUS_FALLBACK";

const ANONYMOUS_MARKERS: [&str; 5] = ["anonymous", "anonymus", "unknown", "0000000", "blinded"];

fn looks_anonymous(value: &str) -> bool {
    let value = value.trim().to_lowercase();
    value.is_empty() || ANONYMOUS_MARKERS.iter().any(|marker| value.contains(marker))
}

/// 患者标识或姓名任一为匿名时，整条记录视为匿名
pub fn is_anonymous(metadata: &ExtractedMetadata) -> bool {
    looks_anonymous(&metadata.patient.patient_id) || looks_anonymous(&metadata.patient.name)
}

/// 计算记录的 folder hint
pub fn resolve_folder_hint(metadata: &ExtractedMetadata, path: &Path) -> String {
    if !is_anonymous(metadata) {
        return GLOBAL_MERGED.to_string();
    }

    directory_hint(&path.to_string_lossy()).unwrap_or_else(|| ANONYMOUS_FALLBACK.to_string())
}

/// 文件名之前的最后两级目录
fn directory_hint(path: &str) -> Option<String> {
    let segments: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .collect();

    let (_file_name, directories) = segments.split_last()?;
    match directories {
        [] => None,
        [only] => Some((*only).to_string()),
        [.., parent, last] => Some(format!("{}/{}", parent, last)),
    }
}

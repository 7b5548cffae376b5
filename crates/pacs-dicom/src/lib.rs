//! # DICOM元数据模块
//!
//! 从 Part-10 文件中提取患者、检查、序列、图像四级元数据，
//! 并为每条记录解析患者身份 (folder hint)。

pub mod builder;
pub mod charset;
pub mod identity;
pub mod parser;

pub use builder::DicomFileBuilder;
pub use charset::TextDecoder;
pub use identity::{resolve_folder_hint, ANONYMOUS_FALLBACK, GLOBAL_MERGED};
pub use parser::DicomParser;

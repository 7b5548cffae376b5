//! DICOM Part-10 文件构造器
//!
//! 基于 dicom-rs 的内存对象和文件元信息构造 Part-10 文件，
//! 用于导入测试和样本生成。

use dicom::core::value::DataSetSequence;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{DefaultDicomObject, FileMetaTableBuilder, InMemDicomObject};
use pacs_core::{PacsError, Result};
use std::path::Path;

/// DICOM文件构造器
#[derive(Debug, Clone)]
pub struct DicomFileBuilder {
    transfer_syntax: String,
    object: InMemDicomObject,
}

impl Default for DicomFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DicomFileBuilder {
    /// 创建显式VR小端的空文件
    pub fn new() -> Self {
        Self {
            transfer_syntax: uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            object: InMemDicomObject::new_empty(),
        }
    }

    pub fn transfer_syntax(mut self, uid: &str) -> Self {
        self.transfer_syntax = uid.to_string();
        self
    }

    pub fn implicit_vr(self) -> Self {
        self.transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)
    }

    pub fn big_endian(self) -> Self {
        self.transfer_syntax(uids::EXPLICIT_VR_BIG_ENDIAN)
    }

    /// 写入字符串元素，按已声明的字符集编码；空字符串写成零长度元素
    pub fn string(mut self, tag: Tag, vr: VR, value: &str) -> Self {
        self.object
            .put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        self
    }

    /// 写入不经编码的原始字节，奇数长度按VR补齐
    pub fn bytes(mut self, tag: Tag, vr: VR, mut value: Vec<u8>) -> Self {
        if value.len() % 2 == 1 {
            value.push(if vr == VR::UI { 0 } else { b' ' });
        }
        self.object
            .put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        self
    }

    pub fn u16(mut self, tag: Tag, value: u16) -> Self {
        self.object
            .put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
        self
    }

    /// 写入未定义长度的序列
    pub fn sequence(mut self, tag: Tag, items: Vec<InMemDicomObject>) -> Self {
        self.object
            .put(DataElement::new(tag, VR::SQ, DataSetSequence::from(items)));
        self
    }

    pub fn pixel_data(self, data: Vec<u8>) -> Self {
        self.bytes(tags::PIXEL_DATA, VR::OB, data)
    }

    pub fn patient(self, patient_id: &str, name: &str) -> Self {
        self.string(tags::PATIENT_ID, VR::LO, patient_id)
            .string(tags::PATIENT_NAME, VR::PN, name)
    }

    pub fn study(self, study_uid: &str, description: &str) -> Self {
        self.string(tags::STUDY_INSTANCE_UID, VR::UI, study_uid)
            .string(tags::STUDY_DESCRIPTION, VR::LO, description)
    }

    pub fn series(self, series_uid: &str, modality: &str) -> Self {
        self.string(tags::SERIES_INSTANCE_UID, VR::UI, series_uid)
            .string(tags::MODALITY, VR::CS, modality)
    }

    pub fn instance(self, sop_instance_uid: &str, instance_number: i32) -> Self {
        self.string(tags::SOP_INSTANCE_UID, VR::UI, sop_instance_uid)
            .string(
                tags::INSTANCE_NUMBER,
                VR::IS,
                &instance_number.to_string(),
            )
    }

    /// 附加文件元信息。媒体存储UID取自对象中的SOP类和SOP实例UID
    fn file_object(&self) -> Result<DefaultDicomObject> {
        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
            .transfer_syntax(self.transfer_syntax.as_str());
        self.object
            .clone()
            .with_meta(meta)
            .map_err(|e| PacsError::Dicom(format!("无法生成文件元信息: {}", e)))
    }

    /// 生成完整的文件字节
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.file_object()?
            .write_all(&mut out)
            .map_err(|e| PacsError::Dicom(format!("无法写出DICOM数据: {}", e)))?;
        Ok(out)
    }

    /// 写出到文件
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.file_object()?
            .write_to_file(path)
            .map_err(|e| PacsError::Dicom(format!("无法写出DICOM文件 {:?}: {}", path, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::DicomParser;
    use dicom::object::open_file;

    #[test]
    fn test_build_has_preamble_and_magic() {
        let data = DicomFileBuilder::new().study("1.2.3", "").build().unwrap();
        assert!(data[..128].iter().all(|b| *b == 0));
        assert_eq!(&data[128..132], b"DICM");
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.dcm");
        DicomFileBuilder::new()
            .patient("P1", "Doe^Jane")
            .study("1.2.3", "Head")
            .instance("1.2.3.4.5", 1)
            .write_to(&path)
            .unwrap();

        let object = open_file(&path).unwrap();
        assert_eq!(object.meta().media_storage_sop_instance_uid(), "1.2.3.4.5");
        assert_eq!(object.meta().transfer_syntax(), uids::EXPLICIT_VR_LITTLE_ENDIAN);

        let metadata = DicomParser::parse_file(&path).unwrap().unwrap();
        assert_eq!(metadata.patient.patient_id, "P1");
        assert_eq!(metadata.study.description.as_deref(), Some("Head"));
    }

    #[test]
    fn test_unknown_transfer_syntax_fails_to_write() {
        let result = DicomFileBuilder::new()
            .study("1.2.3", "")
            .transfer_syntax("1.2.3.999")
            .build();
        assert!(matches!(result, Err(PacsError::Dicom(_))));
    }
}

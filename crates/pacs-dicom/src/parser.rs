//! DICOM元数据提取器
//!
//! 用 dicom-rs 读取文件元信息并按传输语法逐个读取数据集令牌，
//! 只保留顶层元素的原始字节，在像素数据 (7FE0,0010) 处停止。
//! 字符串按文件声明的字符集解码，数值取多值列表的第一个分量，
//! 解析失败时视为缺失而不是报错。

use crate::charset::TextDecoder;
use chrono::NaiveDate;
use dicom::core::{Tag, VR};
use dicom::dictionary_std::tags;
use dicom::encoding::{Codec, Endianness, TransferSyntaxIndex};
use dicom::object::FileMetaTable;
use dicom::parser::dataset::read::{DataSetReaderOptions, ValueReadStrategy};
use dicom::parser::dataset::{DataSetReader, DataToken};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use pacs_core::utils::{derive_dicom_uid, is_valid_dicom_uid};
use pacs_core::{
    ExtractedMetadata, ImageAttributes, PacsError, PatientAttributes, Result, SeriesAttributes,
    Sex, StudyAttributes, DEFAULT_MODALITY, DEFAULT_PATIENT_ID, DEFAULT_PATIENT_NAME,
};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

const PREAMBLE_LEN: usize = 128;
const PIXEL_DATA_GROUP: u16 = 0x7FE0;

fn parse_error(message: impl Into<String>) -> PacsError {
    PacsError::DicomParseError(message.into())
}

#[derive(Debug, Clone)]
struct RawElement {
    vr: VR,
    value: Vec<u8>,
}

/// 解析出的顶层数据集
struct Dataset {
    transfer_syntax_uid: String,
    endianness: Endianness,
    elements: BTreeMap<Tag, RawElement>,
    decoder: TextDecoder,
}

impl Dataset {
    fn read(data: &[u8]) -> Result<Self> {
        let mut source = data
            .get(PREAMBLE_LEN..)
            .ok_or_else(|| parse_error("文件长度不足以包含前导码"))?;
        let meta = FileMetaTable::from_reader(&mut source)
            .map_err(|e| parse_error(format!("无法读取文件元信息: {}", e)))?;

        let transfer_syntax_uid = meta.transfer_syntax().to_string();
        let ts = TransferSyntaxRegistry
            .get(&transfer_syntax_uid)
            .ok_or_else(|| parse_error(format!("未知的传输语法: {}", transfer_syntax_uid)))?;
        // 整个数据集被压缩的传输语法 (Deflated) 不读取
        if let Codec::Dataset(_) = ts.codec() {
            return Err(parse_error(format!(
                "不支持的传输语法: {}",
                transfer_syntax_uid
            )));
        }

        // 原始字节策略：字符串留给 TextDecoder 解码，数值按字节序自行转换
        let options = DataSetReaderOptions::default().value_read(ValueReadStrategy::Raw);
        let reader = DataSetReader::new_with_ts_options(source, ts, options)
            .map_err(|e| parse_error(format!("无法创建数据集读取器: {}", e)))?;
        let elements = collect_top_level(reader)?;

        let decoder = TextDecoder::resolve(
            elements
                .get(&tags::SPECIFIC_CHARACTER_SET)
                .map(|element| element.value.as_slice()),
        );

        Ok(Self {
            transfer_syntax_uid,
            endianness: ts.endianness(),
            elements,
            decoder,
        })
    }

    fn text(&self, tag: Tag) -> Option<String> {
        let element = self.elements.get(&tag)?;
        let value = trim_value(&self.decoder.decode(&element.value));
        (!value.is_empty()).then_some(value)
    }

    /// 读取数值。二进制VR取第一个值，文本VR取第一个分量
    fn number(&self, tag: Tag, default_vr: VR) -> Option<f64> {
        let element = self.elements.get(&tag)?;
        let big = matches!(self.endianness, Endianness::Big);
        let value = element.value.as_slice();
        // 隐式VR下字典未收录的标签读成UN
        let vr = if element.vr == VR::UN {
            default_vr
        } else {
            element.vr
        };

        let number = match vr {
            VR::US => leading::<2>(value).map(|b| {
                f64::from(if big { u16::from_be_bytes(b) } else { u16::from_le_bytes(b) })
            }),
            VR::SS => leading::<2>(value).map(|b| {
                f64::from(if big { i16::from_be_bytes(b) } else { i16::from_le_bytes(b) })
            }),
            VR::UL => leading::<4>(value).map(|b| {
                f64::from(if big { u32::from_be_bytes(b) } else { u32::from_le_bytes(b) })
            }),
            VR::SL => leading::<4>(value).map(|b| {
                f64::from(if big { i32::from_be_bytes(b) } else { i32::from_le_bytes(b) })
            }),
            VR::FL => leading::<4>(value).map(|b| {
                f64::from(if big { f32::from_be_bytes(b) } else { f32::from_le_bytes(b) })
            }),
            VR::FD => leading::<8>(value).map(|b| {
                if big {
                    f64::from_be_bytes(b)
                } else {
                    f64::from_le_bytes(b)
                }
            }),
            _ => self.text(tag).as_deref().and_then(first_component),
        };

        number.filter(|n| n.is_finite())
    }

    fn integer(&self, tag: Tag, default_vr: VR) -> Option<i32> {
        self.number(tag, default_vr)
            .filter(|n| *n >= f64::from(i32::MIN) && *n <= f64::from(i32::MAX))
            .map(|n| n as i32)
    }

    fn date(&self, tag: Tag) -> Option<NaiveDate> {
        let text = self.text(tag)?;
        NaiveDate::parse_from_str(&text, "%Y%m%d")
            .or_else(|_| NaiveDate::parse_from_str(&text, "%Y.%m.%d"))
            .ok()
    }
}

/// 收集顶层元素的原始值。序列内容被跳过，遇到像素数据即停止
fn collect_top_level<I, E>(tokens: I) -> Result<BTreeMap<Tag, RawElement>>
where
    I: IntoIterator<Item = std::result::Result<DataToken, E>>,
    E: std::fmt::Display,
{
    let mut elements = BTreeMap::new();
    let mut depth = 0usize;
    let mut pending: Option<(Tag, VR)> = None;

    for token in tokens {
        let token = token.map_err(|e| parse_error(format!("数据集读取失败: {}", e)))?;
        match token {
            DataToken::ElementHeader(header) if depth == 0 => {
                if header.tag.group() >= PIXEL_DATA_GROUP {
                    break;
                }
                pending = Some((header.tag, header.vr));
            }
            DataToken::PrimitiveValue(value) if depth == 0 => {
                if let Some((tag, vr)) = pending.take() {
                    elements.insert(
                        tag,
                        RawElement {
                            vr,
                            value: value.to_bytes().into_owned(),
                        },
                    );
                }
            }
            DataToken::SequenceStart { tag, .. } => {
                if depth == 0 && tag.group() >= PIXEL_DATA_GROUP {
                    break;
                }
                pending = None;
                depth += 1;
            }
            DataToken::SequenceEnd => depth = depth.saturating_sub(1),
            DataToken::PixelSequenceStart => break,
            _ => {}
        }
    }

    Ok(elements)
}

fn leading<const N: usize>(value: &[u8]) -> Option<[u8; N]> {
    value.get(..N)?.try_into().ok()
}

fn first_component(text: &str) -> Option<f64> {
    text.split('\\').next()?.trim().parse::<f64>().ok()
}

fn trim_value(value: &str) -> String {
    value
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

/// DICOM元数据提取器
pub struct DicomParser;

impl Default for DicomParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DicomParser {
    /// 创建新的DICOM解析器
    pub fn new() -> Self {
        Self
    }

    /// 读取并解析DICOM文件
    ///
    /// 读取失败返回错误；能读取但不是可识别的DICOM图像时返回 `Ok(None)`。
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Option<ExtractedMetadata>> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        Ok(Self::parse_bytes(&data, path))
    }

    /// 从字节数据提取元数据，无法识别时返回 None
    pub fn parse_bytes(data: &[u8], path: &Path) -> Option<ExtractedMetadata> {
        match Dataset::read(data) {
            Ok(dataset) => Self::extract_metadata(&dataset, path),
            Err(e) => {
                debug!("跳过无法识别的文件 {:?}: {}", path, e);
                None
            }
        }
    }

    fn extract_metadata(dataset: &Dataset, path: &Path) -> Option<ExtractedMetadata> {
        let Some(study_uid) = dataset.text(tags::STUDY_INSTANCE_UID) else {
            debug!("文件缺少检查实例UID，跳过: {:?}", path);
            return None;
        };
        if !is_valid_dicom_uid(&study_uid) {
            debug!("检查实例UID格式不规范: {} ({:?})", study_uid, path);
        }

        let series_uid = dataset
            .text(tags::SERIES_INSTANCE_UID)
            .unwrap_or_else(|| derive_dicom_uid(&format!("{}/series", study_uid)));
        let sop_instance_uid = dataset.text(tags::SOP_INSTANCE_UID).unwrap_or_else(|| {
            derive_dicom_uid(&format!("{}/{}", series_uid, path.to_string_lossy()))
        });

        let patient = PatientAttributes {
            patient_id: dataset
                .text(tags::PATIENT_ID)
                .unwrap_or_else(|| DEFAULT_PATIENT_ID.to_string()),
            name: dataset
                .text(tags::PATIENT_NAME)
                .unwrap_or_else(|| DEFAULT_PATIENT_NAME.to_string()),
            birth_date: dataset.date(tags::PATIENT_BIRTH_DATE),
            sex: dataset
                .text(tags::PATIENT_SEX)
                .map(|code| Sex::from_code(&code))
                .unwrap_or_default(),
        };

        let study = StudyAttributes {
            study_uid,
            study_date: dataset.date(tags::STUDY_DATE),
            study_time: dataset.text(tags::STUDY_TIME),
            description: dataset.text(tags::STUDY_DESCRIPTION),
            accession_number: dataset.text(tags::ACCESSION_NUMBER),
            institution_name: dataset.text(tags::INSTITUTION_NAME),
            referring_physician: dataset.text(tags::REFERRING_PHYSICIAN_NAME),
        };

        let series = SeriesAttributes {
            series_uid,
            modality: dataset
                .text(tags::MODALITY)
                .unwrap_or_else(|| DEFAULT_MODALITY.to_string()),
            series_number: dataset.integer(tags::SERIES_NUMBER, VR::IS),
            description: dataset.text(tags::SERIES_DESCRIPTION),
            body_part: dataset.text(tags::BODY_PART_EXAMINED),
            frame_of_reference_uid: dataset.text(tags::FRAME_OF_REFERENCE_UID),
        };

        let image = ImageAttributes {
            sop_instance_uid,
            sop_class_uid: dataset.text(tags::SOP_CLASS_UID),
            instance_number: dataset.integer(tags::INSTANCE_NUMBER, VR::IS),
            rows: dataset.integer(tags::ROWS, VR::US),
            columns: dataset.integer(tags::COLUMNS, VR::US),
            pixel_spacing: dataset.text(tags::PIXEL_SPACING),
            image_orientation: dataset.text(tags::IMAGE_ORIENTATION_PATIENT),
            image_position: dataset.text(tags::IMAGE_POSITION_PATIENT),
            slice_thickness: dataset.number(tags::SLICE_THICKNESS, VR::DS),
            slice_location: dataset.number(tags::SLICE_LOCATION, VR::DS),
            bits_allocated: dataset.integer(tags::BITS_ALLOCATED, VR::US),
            bits_stored: dataset.integer(tags::BITS_STORED, VR::US),
            pixel_representation: dataset.integer(tags::PIXEL_REPRESENTATION, VR::US),
            photometric_interpretation: dataset.text(tags::PHOTOMETRIC_INTERPRETATION),
            number_of_frames: dataset.integer(tags::NUMBER_OF_FRAMES, VR::IS),
            window_center: dataset.number(tags::WINDOW_CENTER, VR::DS),
            window_width: dataset.number(tags::WINDOW_WIDTH, VR::DS),
            rescale_slope: dataset.number(tags::RESCALE_SLOPE, VR::DS),
            rescale_intercept: dataset.number(tags::RESCALE_INTERCEPT, VR::DS),
            transfer_syntax_uid: Some(dataset.transfer_syntax_uid.clone()),
        };

        Some(ExtractedMetadata {
            specific_character_set: dataset.decoder.code().map(str::to_string),
            patient,
            study,
            series,
            image,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DicomFileBuilder;
    use dicom::core::DataElement;
    use dicom::dictionary_std::uids;
    use dicom::object::{FileMetaTableBuilder, InMemDicomObject};

    fn path() -> &'static Path {
        Path::new("/data/siteA/exam1/img.dcm")
    }

    fn ct_image() -> DicomFileBuilder {
        DicomFileBuilder::new()
            .patient("PAT-001", "Doe^John")
            .study("1.2.3.4", "Chest CT")
            .series("1.2.3.4.5", "CT")
            .instance("1.2.3.4.5.6", 7)
            .string(tags::PATIENT_SEX, VR::CS, "M")
            .string(tags::PATIENT_BIRTH_DATE, VR::DA, "19800131")
            .u16(tags::ROWS, 512)
            .u16(tags::COLUMNS, 256)
            .u16(tags::BITS_ALLOCATED, 16)
            .string(tags::WINDOW_CENTER, VR::DS, "40\\400")
            .string(tags::WINDOW_WIDTH, VR::DS, "350")
            .string(tags::PIXEL_SPACING, VR::DS, "0.5\\0.5")
    }

    #[test]
    fn test_extract_explicit_little_endian() {
        let data = ct_image().build().unwrap();
        let metadata = DicomParser::parse_bytes(&data, path()).expect("recognized");

        assert_eq!(metadata.patient.patient_id, "PAT-001");
        assert_eq!(metadata.patient.name, "Doe^John");
        assert_eq!(metadata.patient.sex, Sex::Male);
        assert_eq!(
            metadata.patient.birth_date,
            NaiveDate::from_ymd_opt(1980, 1, 31)
        );
        assert_eq!(metadata.study.study_uid, "1.2.3.4");
        assert_eq!(metadata.study.description.as_deref(), Some("Chest CT"));
        assert_eq!(metadata.series.series_uid, "1.2.3.4.5");
        assert_eq!(metadata.series.modality, "CT");
        assert_eq!(metadata.image.sop_instance_uid, "1.2.3.4.5.6");
        assert_eq!(metadata.image.instance_number, Some(7));
        assert_eq!(metadata.image.rows, Some(512));
        assert_eq!(metadata.image.columns, Some(256));
        assert_eq!(metadata.image.bits_allocated, Some(16));
        assert_eq!(metadata.image.window_center, Some(40.0));
        assert_eq!(metadata.image.window_width, Some(350.0));
        assert_eq!(metadata.image.pixel_spacing.as_deref(), Some("0.5\\0.5"));
        assert_eq!(
            metadata.image.transfer_syntax_uid.as_deref(),
            Some(uids::EXPLICIT_VR_LITTLE_ENDIAN)
        );
    }

    #[test]
    fn test_extract_implicit_little_endian() {
        let data = ct_image().implicit_vr().build().unwrap();
        let metadata = DicomParser::parse_bytes(&data, path()).expect("recognized");

        assert_eq!(metadata.image.rows, Some(512));
        assert_eq!(metadata.image.window_center, Some(40.0));
        assert_eq!(metadata.series.modality, "CT");
        assert_eq!(
            metadata.image.transfer_syntax_uid.as_deref(),
            Some(uids::IMPLICIT_VR_LITTLE_ENDIAN)
        );
    }

    #[test]
    fn test_extract_explicit_big_endian() {
        let data = ct_image()
            .big_endian()
            .string(tags::SPECIFIC_CHARACTER_SET, VR::CS, "ISO_IR 100")
            .string(tags::PATIENT_NAME, VR::PN, "Müller^Hans")
            .string(tags::SLICE_THICKNESS, VR::DS, "2.5")
            .build()
            .unwrap();
        let metadata = DicomParser::parse_bytes(&data, path()).expect("recognized");

        assert_eq!(metadata.image.rows, Some(512));
        assert_eq!(metadata.image.columns, Some(256));
        assert_eq!(metadata.image.bits_allocated, Some(16));
        assert_eq!(metadata.image.window_center, Some(40.0));
        assert_eq!(metadata.image.slice_thickness, Some(2.5));
        assert_eq!(metadata.image.instance_number, Some(7));
        assert_eq!(metadata.patient.name, "Müller^Hans");
        assert_eq!(metadata.study.description.as_deref(), Some("Chest CT"));
        assert_eq!(metadata.specific_character_set.as_deref(), Some("ISO_IR 100"));
        assert_eq!(
            metadata.image.transfer_syntax_uid.as_deref(),
            Some(uids::EXPLICIT_VR_BIG_ENDIAN)
        );
    }

    #[test]
    fn test_missing_study_uid_is_not_recognized() {
        let data = DicomFileBuilder::new()
            .patient("PAT-001", "Doe^John")
            .series("1.2.3.4.5", "CT")
            .build()
            .unwrap();
        assert!(DicomParser::parse_bytes(&data, path()).is_none());
    }

    #[test]
    fn test_non_dicom_and_truncated_are_not_recognized() {
        assert!(DicomParser::parse_bytes(b"plain text, not an image", path()).is_none());
        assert!(DicomParser::parse_bytes(&[], path()).is_none());

        let data = ct_image().build().unwrap();
        let truncated = &data[..data.len() - 3];
        assert!(DicomParser::parse_bytes(truncated, path()).is_none());
    }

    /// 保留数据集字节，只替换文件元信息中的传输语法
    fn relabel_transfer_syntax(data: &[u8], uid: &str) -> Vec<u8> {
        let mut dataset = &data[PREAMBLE_LEN..];
        let meta = FileMetaTable::from_reader(&mut dataset).unwrap();
        let relabeled = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(meta.media_storage_sop_class_uid())
            .media_storage_sop_instance_uid(meta.media_storage_sop_instance_uid())
            .transfer_syntax(uid)
            .build()
            .unwrap();

        let mut out = data[..PREAMBLE_LEN].to_vec();
        out.extend_from_slice(b"DICM");
        relabeled.write(&mut out).unwrap();
        out.extend_from_slice(dataset);
        out
    }

    #[test]
    fn test_deflated_transfer_syntax_is_not_recognized() {
        let data = ct_image().build().unwrap();
        assert!(DicomParser::parse_bytes(&data, path()).is_some());

        let deflated = relabel_transfer_syntax(&data, uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN);
        assert!(DicomParser::parse_bytes(&deflated, path()).is_none());
    }

    #[test]
    fn test_unknown_transfer_syntax_is_not_recognized() {
        let data = ct_image().build().unwrap();
        let relabeled = relabel_transfer_syntax(&data, "1.2.3.999");
        assert!(DicomParser::parse_bytes(&relabeled, path()).is_none());
    }

    #[test]
    fn test_sentinel_defaults() {
        let data = DicomFileBuilder::new()
            .study("1.2.3.4", "")
            .string(tags::PATIENT_SEX, VR::CS, "Q")
            .build()
            .unwrap();
        let metadata = DicomParser::parse_bytes(&data, path()).expect("recognized");

        assert_eq!(metadata.patient.sex, Sex::Other);
        assert_eq!(metadata.patient.patient_id, DEFAULT_PATIENT_ID);
        assert_eq!(metadata.patient.name, DEFAULT_PATIENT_NAME);
        assert_eq!(metadata.series.modality, DEFAULT_MODALITY);
        assert!(metadata.study.description.is_none());
        assert!(is_valid_dicom_uid(&metadata.series.series_uid));

        // 缺失的SOP UID由路径确定性派生
        let again = DicomParser::parse_bytes(&data, path()).expect("recognized");
        assert_eq!(metadata.image.sop_instance_uid, again.image.sop_instance_uid);
        let elsewhere =
            DicomParser::parse_bytes(&data, Path::new("/other/img.dcm")).expect("recognized");
        assert_ne!(metadata.image.sop_instance_uid, elsewhere.image.sop_instance_uid);
    }

    #[test]
    fn test_unparseable_numbers_are_absent() {
        let data = ct_image()
            .string(tags::WINDOW_CENTER, VR::DS, "abc")
            .string(tags::SERIES_NUMBER, VR::IS, "")
            .build()
            .unwrap();
        let metadata = DicomParser::parse_bytes(&data, path()).expect("recognized");

        assert!(metadata.image.window_center.is_none());
        assert!(metadata.series.series_number.is_none());
    }

    #[test]
    fn test_declared_character_set_is_applied() {
        let data = ct_image()
            .string(tags::SPECIFIC_CHARACTER_SET, VR::CS, "ISO_IR 100")
            .string(tags::PATIENT_NAME, VR::PN, "Müller^Hans")
            .build()
            .unwrap();
        // Latin-1 编码下 ü 占一个字节
        assert!(data.windows(2).any(|w| w == [b'M', 0xFC]));
        let metadata = DicomParser::parse_bytes(&data, path()).expect("recognized");

        assert_eq!(metadata.patient.name, "Müller^Hans");
        assert_eq!(metadata.specific_character_set.as_deref(), Some("ISO_IR 100"));
    }

    #[test]
    fn test_unknown_character_set_uses_utf8() {
        let data = ct_image()
            .string(tags::SPECIFIC_CHARACTER_SET, VR::CS, "NOT_A_CHARSET")
            .bytes(tags::PATIENT_NAME, VR::PN, "Müller".as_bytes().to_vec())
            .build()
            .unwrap();
        let metadata = DicomParser::parse_bytes(&data, path()).expect("recognized");

        assert_eq!(metadata.patient.name, "Müller");
        assert!(metadata.specific_character_set.is_none());
    }

    #[test]
    fn test_sequences_are_skipped() {
        let data = ct_image()
            .sequence(
                tags::REFERENCED_IMAGE_SEQUENCE,
                vec![InMemDicomObject::from_element_iter([
                    DataElement::new(tags::REFERENCED_SOP_INSTANCE_UID, VR::UI, "9.9.9"),
                    DataElement::new(tags::SERIES_DESCRIPTION, VR::LO, "Nested"),
                ])],
            )
            .string(tags::SERIES_DESCRIPTION, VR::LO, "Axial")
            .build()
            .unwrap();
        let metadata = DicomParser::parse_bytes(&data, path()).expect("recognized");

        assert_eq!(metadata.series.description.as_deref(), Some("Axial"));
    }

    #[test]
    fn test_stops_at_pixel_data() {
        let mut data = ct_image().pixel_data(vec![0u8; 64]).build().unwrap();
        // 像素数据被截断不影响元数据
        data.truncate(data.len() - 32);
        let metadata = DicomParser::parse_bytes(&data, path()).expect("recognized");
        assert_eq!(metadata.image.rows, Some(512));
    }

    #[test]
    fn test_parse_file_reports_io_errors() {
        let result = DicomParser::parse_file("/definitely/not/here.dcm");
        assert!(matches!(result, Err(PacsError::Io(_))));
    }
}

//! 字符集解析
//!
//! 根据 Specific Character Set (0008,0005) 选择字符串元素的解码器。
//! 未声明或无法识别时使用通用编码 (UTF-8)；声明字符集解码失败时同样回退到 UTF-8。

use dicom::encoding::text::{SpecificCharacterSet, TextCodec};
use tracing::debug;

/// 字符串元素解码器
pub enum TextDecoder {
    /// 文件声明且可识别的字符集
    Declared {
        code: String,
        charset: SpecificCharacterSet,
    },
    /// 通用编码
    Universal,
}

impl Default for TextDecoder {
    fn default() -> Self {
        TextDecoder::Universal
    }
}

impl TextDecoder {
    /// 由 (0008,0005) 的原始字节确定解码器
    ///
    /// 多值声明取第一个非空分量。
    pub fn resolve(declaration: Option<&[u8]>) -> Self {
        let Some(raw) = declaration else {
            return TextDecoder::Universal;
        };

        let text = String::from_utf8_lossy(raw);
        let code = text
            .split('\\')
            .map(|part| part.trim_matches(|c: char| c == ' ' || c == '\0'))
            .find(|part| !part.is_empty());

        match code {
            Some(code) => match SpecificCharacterSet::from_code(code) {
                Some(charset) => TextDecoder::Declared {
                    code: code.to_string(),
                    charset,
                },
                None => {
                    debug!("未识别的字符集声明 {:?}，使用通用编码", code);
                    TextDecoder::Universal
                }
            },
            None => TextDecoder::Universal,
        }
    }

    /// 解码后的字符集代码，通用编码返回 None
    pub fn code(&self) -> Option<&str> {
        match self {
            TextDecoder::Declared { code, .. } => Some(code),
            TextDecoder::Universal => None,
        }
    }

    /// 解码字符串值，从不失败
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            TextDecoder::Declared { code, charset } => match charset.decode(bytes) {
                Ok(text) => text,
                Err(e) => {
                    debug!("按字符集 {} 解码失败，回退到UTF-8: {}", code, e);
                    String::from_utf8_lossy(bytes).into_owned()
                }
            },
            TextDecoder::Universal => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

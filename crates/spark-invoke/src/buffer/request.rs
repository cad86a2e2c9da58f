use bytes::{BufMut, Bytes, BytesMut};

use super::SIZE_ESCAPE;
use crate::error::InvocationError;
use crate::protocol::ProtocolVersion;
use crate::reference::{Identity, RequestContext};

/// 请求编组缓冲区。
///
/// # 契约说明（What）
/// - 只追加写入；长度超过 `i32::MAX` 的序列或字符串返回编组错误；
/// - 同一时刻最多一个打开的封装（参数封装），嵌套或未打开即关闭均为编组错误；
/// - [`freeze`](Self::freeze) 要求封装已关闭。
#[derive(Debug, Default)]
pub struct RequestBuffer {
    bytes: BytesMut,
    encapsulation: Option<usize>,
}

impl RequestBuffer {
    /// 创建空缓冲区。
    pub fn new() -> Self {
        Self::default()
    }

    /// 以预留容量创建缓冲区。
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: BytesMut::with_capacity(capacity),
            encapsulation: None,
        }
    }

    /// 已写入字节数。
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// 查看已写入内容。
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// 原样追加字节块。
    pub fn write_blob(&mut self, blob: &[u8]) {
        self.bytes.put_slice(blob);
    }

    pub fn write_byte(&mut self, value: u8) {
        self.bytes.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.bytes.put_u8(u8::from(value));
    }

    pub fn write_int(&mut self, value: i32) {
        self.bytes.put_i32_le(value);
    }

    /// 写入紧凑长度。
    pub fn write_size(&mut self, size: usize) -> Result<(), InvocationError> {
        if size < usize::from(SIZE_ESCAPE) {
            self.bytes.put_u8(size as u8);
            return Ok(());
        }
        let wide = i32::try_from(size)
            .map_err(|_| InvocationError::marshal("size exceeds i32::MAX"))?;
        self.bytes.put_u8(SIZE_ESCAPE);
        self.bytes.put_i32_le(wide);
        Ok(())
    }

    /// 写入长度前缀的 UTF-8 字符串。
    pub fn write_string(&mut self, value: &str) -> Result<(), InvocationError> {
        self.write_size(value.len())?;
        self.bytes.put_slice(value.as_bytes());
        Ok(())
    }

    /// 写入字符串序列。
    pub fn write_string_seq<S: AsRef<str>>(&mut self, values: &[S]) -> Result<(), InvocationError> {
        self.write_size(values.len())?;
        for value in values {
            self.write_string(value.as_ref())?;
        }
        Ok(())
    }

    /// 写入身份：名称在前，类别在后。
    pub fn write_identity(&mut self, identity: &Identity) -> Result<(), InvocationError> {
        self.write_string(&identity.name)?;
        self.write_string(&identity.category)
    }

    /// 写入 facet 路径：空 facet 编码为空序列，否则为单元素序列。
    pub fn write_facet(&mut self, facet: &str) -> Result<(), InvocationError> {
        if facet.is_empty() {
            self.write_size(0)
        } else {
            self.write_string_seq(&[facet])
        }
    }

    /// 写入请求上下文（字符串字典）。
    pub fn write_context(&mut self, context: &RequestContext) -> Result<(), InvocationError> {
        self.write_size(context.len())?;
        for (key, value) in context {
            self.write_string(key)?;
            self.write_string(value)?;
        }
        Ok(())
    }

    /// 打开封装：写入 i32 长度占位符与编码版本。
    pub fn start_encapsulation(&mut self, encoding: ProtocolVersion) -> Result<(), InvocationError> {
        if self.encapsulation.is_some() {
            return Err(InvocationError::marshal("nested encapsulation"));
        }
        self.encapsulation = Some(self.bytes.len());
        self.bytes.put_i32_le(0);
        self.bytes.put_u8(encoding.major);
        self.bytes.put_u8(encoding.minor);
        Ok(())
    }

    /// 关闭封装并回填长度（包含长度字段本身与编码版本）。
    pub fn end_encapsulation(&mut self) -> Result<(), InvocationError> {
        let start = self
            .encapsulation
            .take()
            .ok_or_else(|| InvocationError::marshal("no open encapsulation"))?;
        let size = i32::try_from(self.bytes.len() - start)
            .map_err(|_| InvocationError::marshal("encapsulation exceeds i32::MAX"))?;
        self.bytes[start..start + 4].copy_from_slice(&size.to_le_bytes());
        Ok(())
    }

    /// 写入空封装。
    pub fn write_empty_encapsulation(&mut self, encoding: ProtocolVersion) -> Result<(), InvocationError> {
        self.start_encapsulation(encoding)?;
        self.end_encapsulation()
    }

    /// 是否存在未关闭的封装。
    pub fn has_open_encapsulation(&self) -> bool {
        self.encapsulation.is_some()
    }

    /// 冻结为不可变字节，供多次尝试共享。
    pub fn freeze(self) -> Result<Bytes, InvocationError> {
        if self.encapsulation.is_some() {
            return Err(InvocationError::marshal("encapsulation left open"));
        }
        Ok(self.bytes.freeze())
    }
}

use bytes::{Buf, Bytes};

use super::SIZE_ESCAPE;
use crate::error::InvocationError;
use crate::protocol::ProtocolVersion;
use crate::reference::{Identity, RequestContext};

/// 应答读取器。
///
/// # 契约说明（What）
/// - 构造时定位在应答负载开头（状态字节）；
/// - 所有读取在数据不足时返回编组错误，不 panic；
/// - 封装读取要求在 [`end_encapsulation`](Self::end_encapsulation) 时恰好消费完封装声明的长度。
#[derive(Clone, Debug)]
pub struct ReplyBuffer {
    bytes: Bytes,
    total: usize,
    encapsulation_end: Option<usize>,
}

impl ReplyBuffer {
    /// 以应答负载构造读取器。
    pub fn new(bytes: Bytes) -> Self {
        let total = bytes.len();
        Self {
            bytes,
            total,
            encapsulation_end: None,
        }
    }

    /// 负载总长度。
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// 尚未读取的字节数。
    pub fn remaining(&self) -> usize {
        self.bytes.remaining()
    }

    /// 当前读取位置。
    pub fn position(&self) -> usize {
        self.total - self.bytes.remaining()
    }

    fn need(&self, count: usize) -> Result<(), InvocationError> {
        if self.bytes.remaining() < count {
            return Err(InvocationError::marshal("unexpected end of reply"));
        }
        Ok(())
    }

    pub fn read_byte(&mut self) -> Result<u8, InvocationError> {
        self.need(1)?;
        Ok(self.bytes.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, InvocationError> {
        Ok(self.read_byte()? != 0)
    }

    pub fn read_int(&mut self) -> Result<i32, InvocationError> {
        self.need(4)?;
        Ok(self.bytes.get_i32_le())
    }

    /// 读取紧凑长度。
    pub fn read_size(&mut self) -> Result<usize, InvocationError> {
        let first = self.read_byte()?;
        if first != SIZE_ESCAPE {
            return Ok(usize::from(first));
        }
        let wide = self.read_int()?;
        usize::try_from(wide).map_err(|_| InvocationError::marshal("negative size"))
    }

    /// 读取定长字节块。
    pub fn read_blob(&mut self, count: usize) -> Result<Bytes, InvocationError> {
        self.need(count)?;
        Ok(self.bytes.copy_to_bytes(count))
    }

    pub fn read_string(&mut self) -> Result<String, InvocationError> {
        let size = self.read_size()?;
        let raw = self.read_blob(size)?;
        String::from_utf8(raw.to_vec()).map_err(|_| InvocationError::marshal("invalid UTF-8 string"))
    }

    pub fn read_string_seq(&mut self) -> Result<Vec<String>, InvocationError> {
        let size = self.read_size()?;
        // 每个元素至少占一个长度字节，先行校验可避免恶意长度触发大分配。
        self.need(size)?;
        (0..size).map(|_| self.read_string()).collect()
    }

    pub fn read_identity(&mut self) -> Result<Identity, InvocationError> {
        let name = self.read_string()?;
        let category = self.read_string()?;
        Ok(Identity { name, category })
    }

    pub fn read_context(&mut self) -> Result<RequestContext, InvocationError> {
        let size = self.read_size()?;
        self.need(size.saturating_mul(2))?;
        let mut context = RequestContext::new();
        for _ in 0..size {
            let key = self.read_string()?;
            let value = self.read_string()?;
            context.insert(key, value);
        }
        Ok(context)
    }

    /// 打开封装，返回其编码版本。
    pub fn start_encapsulation(&mut self) -> Result<ProtocolVersion, InvocationError> {
        if self.encapsulation_end.is_some() {
            return Err(InvocationError::marshal("nested encapsulation"));
        }
        let start = self.position();
        let size = self.read_int()?;
        let size = usize::try_from(size)
            .ok()
            .filter(|size| *size >= 6)
            .ok_or_else(|| InvocationError::marshal("invalid encapsulation size"))?;
        self.need(size - 4)?;
        let major = self.read_byte()?;
        let minor = self.read_byte()?;
        self.encapsulation_end = Some(start + size);
        Ok(ProtocolVersion::new(major, minor))
    }

    /// 关闭封装，校验内容恰好被读完。
    pub fn end_encapsulation(&mut self) -> Result<(), InvocationError> {
        let end = self
            .encapsulation_end
            .take()
            .ok_or_else(|| InvocationError::marshal("no open encapsulation"))?;
        if self.position() != end {
            return Err(InvocationError::marshal("encapsulation not fully consumed"));
        }
        Ok(())
    }

    /// 跳过整个封装，返回其编码版本。
    pub fn skip_encapsulation(&mut self) -> Result<ProtocolVersion, InvocationError> {
        let encoding = self.start_encapsulation()?;
        if let Some(end) = self.encapsulation_end {
            let rest = end - self.position();
            self.bytes.advance(rest);
        }
        self.end_encapsulation()?;
        Ok(encoding)
    }
}

impl From<Bytes> for ReplyBuffer {
    fn from(bytes: Bytes) -> Self {
        Self::new(bytes)
    }
}

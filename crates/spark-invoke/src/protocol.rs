//! 线上协议常量：消息头、版本与应答状态字节。
//!
//! # 契约说明（What）
//! - 消息头 14 字节：魔数 `IceP`、协议主/次版本、编码主/次版本、消息类型、压缩状态、i32 消息长度；
//! - 非批量请求在消息头之后紧跟 i32 请求 ID，合计 [`REQUEST_HEADER`] 18 字节；
//! - 消息长度与请求 ID 由传输层在发送前回填，调用引擎只写占位符；
//! - 所有整数均为小端序。

use crate::error::InvocationError;

/// 消息魔数。
pub const MAGIC: [u8; 4] = *b"IceP";

/// 消息头长度（不含请求 ID）。
pub const HEADER_SIZE: usize = 14;

/// 请求消息类型。
pub const REQUEST_MSG: u8 = 0;
/// 批量请求消息类型。
pub const BATCH_REQUEST_MSG: u8 = 1;

/// 协议/编码版本号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

/// 当前实现的协议版本。
pub const PROTOCOL_1_0: ProtocolVersion = ProtocolVersion::new(1, 0);
/// 消息头使用的编码版本。
pub const ENCODING_1_0: ProtocolVersion = ProtocolVersion::new(1, 0);
/// 参数封装使用的编码版本。
pub const ENCODING_1_1: ProtocolVersion = ProtocolVersion::new(1, 1);

/// 非批量请求的前缀：消息头 + 请求 ID 占位符。
pub const REQUEST_HEADER: [u8; HEADER_SIZE + 4] = [
    MAGIC[0],
    MAGIC[1],
    MAGIC[2],
    MAGIC[3],
    PROTOCOL_1_0.major,
    PROTOCOL_1_0.minor,
    ENCODING_1_0.major,
    ENCODING_1_0.minor,
    REQUEST_MSG,
    0, // 压缩状态
    0, // 消息长度（占位）
    0,
    0,
    0,
    0, // 请求 ID（占位）
    0,
    0,
    0,
];

/// 批量刷新消息头：消息头 + i32 批量条目数占位符。
pub const BATCH_REQUEST_HEADER: [u8; HEADER_SIZE + 4] = {
    let mut header = REQUEST_HEADER;
    header[8] = BATCH_REQUEST_MSG;
    header
};

/// 校验代理声明的协议版本是否受支持。
///
/// 只要求主版本一致；次版本更高的对端按 1.0 语义通信。
pub fn check_supported_protocol(version: ProtocolVersion) -> Result<(), InvocationError> {
    if version.major != PROTOCOL_1_0.major {
        return Err(InvocationError::UnsupportedProtocol {
            major: version.major,
            minor: version.minor,
        });
    }
    Ok(())
}

/// 应答状态字节。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    FacetNotExist = 3,
    OperationNotExist = 4,
    UnknownLocalException = 5,
    UnknownUserException = 6,
    UnknownException = 7,
}

impl ReplyStatus {
    /// 从线上字节解析状态；未知取值返回 `None`。
    pub const fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Ok,
            1 => Self::UserException,
            2 => Self::ObjectNotExist,
            3 => Self::FacetNotExist,
            4 => Self::OperationNotExist,
            5 => Self::UnknownLocalException,
            6 => Self::UnknownUserException,
            7 => Self::UnknownException,
            _ => return None,
        })
    }

    /// 获取线上字节表示。
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

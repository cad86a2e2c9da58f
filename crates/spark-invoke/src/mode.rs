//! 调用模式与操作模式。
//!
//! - [`InvocationMode`] 在代理创建时固定，决定是否期待应答以及是否进入批量队列；
//! - [`OperationMode`] 随请求写出（模式字节），并作为重试策略判断“至多一次”语义的依据。

/// 代理的调用模式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InvocationMode {
    Twoway,
    Oneway,
    Datagram,
    BatchOneway,
    BatchDatagram,
}

impl InvocationMode {
    /// 是否期待服务端应答。
    pub const fn expects_reply(self) -> bool {
        matches!(self, Self::Twoway)
    }

    /// 是否写入批量队列而非立即发送。
    pub const fn is_batch(self) -> bool {
        matches!(self, Self::BatchOneway | Self::BatchDatagram)
    }

    /// 请求是否携带协议头（批量条目由批量刷新统一加头）。
    pub const fn writes_header(self) -> bool {
        !self.is_batch()
    }
}

/// 操作模式，以单字节写入请求。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum OperationMode {
    #[default]
    Normal = 0,
    Nonmutating = 1,
    Idempotent = 2,
}

impl OperationMode {
    /// 获取线上字节表示。
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// 重复执行是否不会改变服务端状态。
    pub const fn is_idempotent(self) -> bool {
        matches!(self, Self::Nonmutating | Self::Idempotent)
    }
}

//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义调用引擎对外暴露的失败语义：编组失败、路由陈旧、传输失败、应答层协议失败与截止超时；
//! - 每个变体都映射到稳定错误码与 [`ErrorCategory`]，重试策略只依据分类做决策，不解析字符串。
//!
//! ## 设计要求（What）
//! - [`InvocationError`] 是封闭的和类型，可 `Clone` 且独立于产生它的线程，
//!   I/O 线程写入的异常载荷由调用线程原样取回；
//! - 错误码遵循 `<域>.<语义>` 约定，与日志字段 `code` 对齐。

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

use crate::completion::InvocationState;
use crate::reference::Identity;

/// 调用引擎的稳定错误码。
///
/// 错误码用于日志、观察者回调 `on_failure(kind)` 以及告警聚合，取值一经发布不再变更。
pub mod codes {
    /// 请求或应答编组失败。
    pub const MARSHAL: &str = "invoke.marshal";
    /// 服务端报告目标对象不存在。
    pub const OBJECT_NOT_EXIST: &str = "invoke.object_not_exist";
    /// 服务端报告 facet 不存在。
    pub const FACET_NOT_EXIST: &str = "invoke.facet_not_exist";
    /// 服务端报告操作不存在。
    pub const OPERATION_NOT_EXIST: &str = "invoke.operation_not_exist";
    /// 服务端抛出未知本地异常。
    pub const UNKNOWN_LOCAL: &str = "invoke.unknown_local_exception";
    /// 服务端抛出未声明的用户异常。
    pub const UNKNOWN_USER: &str = "invoke.unknown_user_exception";
    /// 服务端抛出未知异常。
    pub const UNKNOWN: &str = "invoke.unknown_exception";
    /// 应答携带无法识别的状态字节。
    pub const UNKNOWN_REPLY_STATUS: &str = "invoke.unknown_reply_status";
    /// 连接在请求期间丢失。
    pub const CONNECTION_LOST: &str = "transport.connection_lost";
    /// 建立连接失败。
    pub const CONNECT_FAILED: &str = "transport.connect_failed";
    /// 对端优雅关闭连接。
    pub const CLOSE_CONNECTION: &str = "transport.close_connection";
    /// 其他传输层失败。
    pub const TRANSPORT: &str = "transport.io";
    /// 调用超过截止时间。
    pub const INVOCATION_TIMEOUT: &str = "invoke.timeout";
    /// 请求处理器已陈旧，需要重新获取。
    pub const HANDLER_STALE: &str = "routing.handler_stale";
    /// 运行时已关闭。
    pub const RUNTIME_SHUTDOWN: &str = "runtime.shutdown";
    /// 代理协议版本不受支持。
    pub const UNSUPPORTED_PROTOCOL: &str = "protocol.unsupported";
    /// 调用对象的使用方式违反生命周期约束。
    pub const INVALID_STATE: &str = "invoke.invalid_state";
}

/// 错误分类，驱动重试策略。
///
/// # 契约说明（What）
/// - `Retryable`：传输或连接层面的瞬时失败，是否真正重试仍取决于幂等性与已发送标记；
/// - `Routing`：路由陈旧，通常由调用循环在本地消化；
/// - `ProtocolViolation`：应答层协议失败或编组失败，重试无法改变结果；
/// - `Timeout`：截止时间耗尽，不再重试；
/// - `NonRetryable`：其余确定性失败。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    Retryable,
    Routing,
    ProtocolViolation,
    Timeout,
    NonRetryable,
}

impl ErrorCategory {
    /// 是否属于可交由重试策略重放的类别。
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable | Self::Routing)
    }
}

/// 服务端“目标不存在”类应答的细分。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestFailedKind {
    ObjectNotExist,
    FacetNotExist,
    OperationNotExist,
}

impl fmt::Display for RequestFailedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ObjectNotExist => "object does not exist",
            Self::FacetNotExist => "facet does not exist",
            Self::OperationNotExist => "operation does not exist",
        })
    }
}

/// 服务端“未知异常”类应答的细分。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnknownKind {
    Unknown,
    UnknownLocal,
    UnknownUser,
}

impl fmt::Display for UnknownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown exception",
            Self::UnknownLocal => "unknown local exception",
            Self::UnknownUser => "unknown user exception",
        })
    }
}

/// 调用引擎的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把“发送前编组失败”“路由陈旧”“传输失败”“应答层失败”“超时”收敛到一个
///   可克隆的和类型中，使 I/O 线程写入的载荷能在调用线程上原样重抛。
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`；
///   - [`code`](Self::code) 返回稳定错误码，[`category`](Self::category) 返回重试分类；
///   - `RequestFailed` 的 `id`/`facet`/`operation` 与应答中解码出的字节逐一对应。
/// - **执行逻辑 (How)**：应答解码由 [`crate::reply`] 中按状态字节分派的工厂构造；传输失败由
///   请求处理器通过 `finished_with_error` 注入。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum InvocationError {
    /// 编组或解组失败，发送前出现时永不重试。
    #[error("marshal failure: {reason}")]
    Marshal { reason: Cow<'static, str> },

    /// 服务端确认目标对象、facet 或操作不存在。
    #[error("{kind}: identity `{id}`, facet `{facet}`, operation `{operation}`")]
    RequestFailed {
        kind: RequestFailedKind,
        id: Identity,
        facet: String,
        operation: String,
    },

    /// 服务端以字符串形式报告的未知异常。
    #[error("{kind}: {unknown}")]
    Unknown { kind: UnknownKind, unknown: String },

    /// 应答状态字节不在协议定义范围内。
    #[error("unknown reply status {status}")]
    UnknownReplyStatus { status: u8 },

    #[error("connection lost: {detail}")]
    ConnectionLost { detail: String },

    #[error("connect failed: {detail}")]
    ConnectFailed { detail: String },

    /// 对端优雅关闭连接，保证未处理的请求可以安全重放。
    #[error("connection closed gracefully by peer")]
    CloseConnection,

    #[error("transport failure `{code}`: {detail}")]
    Transport { code: &'static str, detail: String },

    #[error("invocation timed out")]
    InvocationTimeout,

    /// 请求处理器已陈旧，调用循环清除缓存后立即重新获取。
    #[error("request handler is stale")]
    HandlerStale,

    #[error("runtime has been shut down")]
    RuntimeShutdown,

    #[error("unsupported protocol version {major}.{minor}")]
    UnsupportedProtocol { major: u8, minor: u8 },

    /// 调用对象被以不符合生命周期的方式使用，例如重复 `invoke()`。
    #[error("invalid invocation state: {detail}")]
    InvalidState { detail: Cow<'static, str> },
}

impl InvocationError {
    /// 以静态原因构造编组错误。
    pub fn marshal(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::Marshal {
            reason: reason.into(),
        }
    }

    /// 构造连接丢失错误。
    pub fn connection_lost(detail: impl Into<String>) -> Self {
        Self::ConnectionLost {
            detail: detail.into(),
        }
    }

    /// 构造通用传输层错误，错误码为 [`codes::TRANSPORT`]。
    pub fn transport(detail: impl Into<String>) -> Self {
        Self::Transport {
            code: codes::TRANSPORT,
            detail: detail.into(),
        }
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Marshal { .. } => codes::MARSHAL,
            Self::RequestFailed { kind, .. } => match kind {
                RequestFailedKind::ObjectNotExist => codes::OBJECT_NOT_EXIST,
                RequestFailedKind::FacetNotExist => codes::FACET_NOT_EXIST,
                RequestFailedKind::OperationNotExist => codes::OPERATION_NOT_EXIST,
            },
            Self::Unknown { kind, .. } => match kind {
                UnknownKind::Unknown => codes::UNKNOWN,
                UnknownKind::UnknownLocal => codes::UNKNOWN_LOCAL,
                UnknownKind::UnknownUser => codes::UNKNOWN_USER,
            },
            Self::UnknownReplyStatus { .. } => codes::UNKNOWN_REPLY_STATUS,
            Self::ConnectionLost { .. } => codes::CONNECTION_LOST,
            Self::ConnectFailed { .. } => codes::CONNECT_FAILED,
            Self::CloseConnection => codes::CLOSE_CONNECTION,
            Self::Transport { code, .. } => *code,
            Self::InvocationTimeout => codes::INVOCATION_TIMEOUT,
            Self::HandlerStale => codes::HANDLER_STALE,
            Self::RuntimeShutdown => codes::RUNTIME_SHUTDOWN,
            Self::UnsupportedProtocol { .. } => codes::UNSUPPORTED_PROTOCOL,
            Self::InvalidState { .. } => codes::INVALID_STATE,
        }
    }

    /// 获取错误分类。
    ///
    /// 应答层失败（不存在/未知/未知状态）一律归为 `ProtocolViolation`：服务端已经给出
    /// 确定答复，重放同一请求不会得到不同结果。
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectionLost { .. }
            | Self::ConnectFailed { .. }
            | Self::CloseConnection
            | Self::Transport { .. } => ErrorCategory::Retryable,
            Self::HandlerStale => ErrorCategory::Routing,
            Self::Marshal { .. }
            | Self::RequestFailed { .. }
            | Self::Unknown { .. }
            | Self::UnknownReplyStatus { .. }
            | Self::UnsupportedProtocol { .. } => ErrorCategory::ProtocolViolation,
            Self::InvocationTimeout => ErrorCategory::Timeout,
            Self::RuntimeShutdown | Self::InvalidState { .. } => ErrorCategory::NonRetryable,
        }
    }

    /// 请求已经写出后是否仍可安全重放（不违反“至多一次”）。
    ///
    /// 优雅关闭意味着服务端承诺未处理任何未完成请求。
    pub fn is_safe_after_send(&self) -> bool {
        matches!(self, Self::CloseConnection)
    }

    /// 是否为服务端经应答给出的确定性失败。
    pub fn is_reply_failure(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. } | Self::Unknown { .. } | Self::UnknownReplyStatus { .. }
        )
    }
}

/// 完成回调在终态之后到达时的拒绝结果。
///
/// 请求处理器对同一次尝试最多只能报告一次终态；违反该契约的回调被拒绝，状态保持不变。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("completion rejected: invocation already in state {state:?}")]
pub struct CompletionRejected {
    /// 拒绝时观察到的状态。
    pub state: InvocationState,
}

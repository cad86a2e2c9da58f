//! 请求处理器边界。
//!
//! # 模块目的（Why）
//! - 调用引擎不关心请求如何送达：直连连接、排队等待连接建立的处理器、进程内分发都实现
//!   [`RequestHandler`]；
//! - 引擎交给处理器的是 [`OutgoingRequest`] / [`BatchRequest`]：冻结的请求字节加上一份
//!   [`Completion`] 句柄，处理器在任意线程上通过该句柄报告进展。
//!
//! # 契约说明（What）
//! - `send_request` 返回 `Ok(true)` 表示已同步完成且不期待应答；返回 `Ok(false)` 表示结果将经
//!   `Completion` 回调异步送达；返回 [`InvocationError::HandlerStale`] 表示绑定已陈旧；
//! - 处理器对同一次提交最多报告一次终态；
//! - `request_timed_out` 只是请求取消：处理器随后必须以 `finished_with_error`
//!   （通常为 [`InvocationError::InvocationTimeout`]）或已到达的结果收尾。

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::buffer::RequestBuffer;
use crate::completion::Completion;
use crate::error::InvocationError;
use crate::mode::{InvocationMode, OperationMode};

/// 提交给处理器的单个请求。
#[derive(Clone)]
pub struct OutgoingRequest {
    completion: Completion,
    payload: Bytes,
    operation: Arc<str>,
    mode: InvocationMode,
    operation_mode: OperationMode,
}

impl OutgoingRequest {
    pub(crate) fn new(
        completion: Completion,
        payload: Bytes,
        operation: Arc<str>,
        mode: InvocationMode,
        operation_mode: OperationMode,
    ) -> Self {
        Self {
            completion,
            payload,
            operation,
            mode,
            operation_mode,
        }
    }

    /// 完成句柄。
    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// 已编组的请求字节（含协议头）。
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// 操作名。
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// 调用模式。
    pub fn mode(&self) -> InvocationMode {
        self.mode
    }

    /// 操作模式。
    pub fn operation_mode(&self) -> OperationMode {
        self.operation_mode
    }

    /// 是否期待应答。
    pub fn expects_reply(&self) -> bool {
        self.mode.expects_reply()
    }
}

impl fmt::Debug for OutgoingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingRequest")
            .field("operation", &self.operation)
            .field("mode", &self.mode)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// 提交给处理器或连接的批量刷新。
#[derive(Clone, Debug)]
pub struct BatchRequest {
    completion: Completion,
    name: Arc<str>,
}

impl BatchRequest {
    pub(crate) fn new(completion: Completion, name: Arc<str>) -> Self {
        Self { completion, name }
    }

    /// 完成句柄。
    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// 刷新操作名，用于日志与观测。
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// 请求处理器。
pub trait RequestHandler: Send + Sync {
    /// 为批量条目取得共享批量缓冲区的写入权。
    fn prepare_batch_request(&self, buffer: &mut RequestBuffer) -> Result<(), InvocationError>;

    /// 提交编组完成的批量条目并释放写入权。
    fn finish_batch_request(&self, buffer: RequestBuffer) -> Result<(), InvocationError>;

    /// 放弃批量条目并释放写入权。
    fn abort_batch_request(&self);

    fn send_request(&self, request: OutgoingRequest) -> Result<bool, InvocationError>;

    fn flush_batch_requests(&self, batch: BatchRequest) -> Result<bool, InvocationError>;

    /// 请求取消 `completion` 所代表的尝试。
    fn request_timed_out(&self, completion: &Completion);
}

/// 已绑定的连接，用于按连接刷新批量请求。
pub trait Connection: Send + Sync {
    fn flush_batch_requests(&self, batch: BatchRequest) -> Result<bool, InvocationError>;
}

//! 进程内（collocated）投递通道。
//!
//! 目标对象与调用方位于同一进程时，请求不经过传输层，而是交给 [`Dispatcher`] 在调用线程上同步分发。
//! [`CollocatedRequestHandler`] 以 [`RequestHandler`] 的形式接入调用引擎，重试循环与完成协议与网络路径完全一致。

use std::sync::Arc;

use bytes::Bytes;

use crate::batch::BatchQueue;
use crate::buffer::{ReplyBuffer, RequestBuffer};
use crate::completion::Completion;
use crate::error::InvocationError;
use crate::handler::{BatchRequest, OutgoingRequest, RequestHandler};
use crate::protocol::REQUEST_HEADER;

/// 进程内分发器。
pub trait Dispatcher: Send + Sync {
    /// 分发一个去掉协议头的请求，返回从状态字节开始的应答负载。
    ///
    /// 单向请求的应答被丢弃。
    fn dispatch(&self, request: Bytes) -> Result<Bytes, InvocationError>;
}

/// 进程内请求处理器。
pub struct CollocatedRequestHandler {
    dispatcher: Arc<dyn Dispatcher>,
    batch: BatchQueue,
}

impl CollocatedRequestHandler {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            dispatcher,
            batch: BatchQueue::new(),
        }
    }

    /// 同步分发单个请求。
    ///
    /// 单向请求返回 `Ok(true)`；双向请求经完成句柄送达应答后返回 `Ok(false)`。
    pub fn invoke_request(&self, request: &OutgoingRequest) -> Result<bool, InvocationError> {
        let payload = request.payload();
        if payload.len() < REQUEST_HEADER.len() {
            return Err(InvocationError::marshal("request shorter than its header"));
        }
        let body = payload.slice(REQUEST_HEADER.len()..);
        let completion = request.completion();
        completion.sent();
        let dispatched = self.dispatcher.dispatch(body);
        if !request.expects_reply() {
            if let Err(error) = dispatched {
                tracing::debug!(operation = request.operation(), code = error.code(), "collocated oneway dispatch failed");
            }
            return Ok(true);
        }
        let settled = match dispatched {
            Ok(reply) => completion.finished_with_reply(ReplyBuffer::new(reply)),
            Err(error) => completion.finished_with_error(error, true),
        };
        if let Err(rejected) = settled {
            tracing::warn!(operation = request.operation(), state = ?rejected.state, "collocated completion rejected");
        }
        Ok(false)
    }

    /// 同步分发全部排队的批量条目。
    pub fn invoke_batch_requests(&self, batch: &BatchRequest) -> Result<bool, InvocationError> {
        let entries = self.batch.drain();
        tracing::trace!(batch = batch.name(), entries = entries.len(), "dispatching collocated batch");
        for entry in entries {
            if let Err(error) = self.dispatcher.dispatch(entry) {
                tracing::debug!(batch = batch.name(), code = error.code(), "collocated batch entry failed");
            }
        }
        batch.completion().sent();
        Ok(true)
    }

    /// 排队中的批量条目数。
    pub fn queued(&self) -> usize {
        self.batch.len()
    }
}

impl RequestHandler for CollocatedRequestHandler {
    fn prepare_batch_request(&self, _buffer: &mut RequestBuffer) -> Result<(), InvocationError> {
        self.batch.prepare();
        Ok(())
    }

    fn finish_batch_request(&self, buffer: RequestBuffer) -> Result<(), InvocationError> {
        self.batch.finish(buffer)
    }

    fn abort_batch_request(&self) {
        self.batch.abort();
    }

    fn send_request(&self, request: OutgoingRequest) -> Result<bool, InvocationError> {
        self.invoke_request(&request)
    }

    fn flush_batch_requests(&self, batch: BatchRequest) -> Result<bool, InvocationError> {
        self.invoke_batch_requests(&batch)
    }

    fn request_timed_out(&self, completion: &Completion) {
        // 分发是同步的，超时到达时结果通常已经落定，拒绝即意味着无需处理。
        let _ = completion.finished_with_error(InvocationError::InvocationTimeout, completion.is_sent());
    }
}

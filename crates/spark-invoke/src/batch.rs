//! 批量刷新。
//!
//! # 模块目的（Why）
//! - 批量模式下的调用只把条目追加到处理器持有的共享批量缓冲区，直到显式刷新才真正发出；
//! - [`BatchInvocation`] 负责刷新：目标可以是已绑定的连接，也可以是由代理解析出的处理器；
//! - [`BatchQueue`] 是处理器实现可直接复用的共享批量缓冲区，带写入权（claim）协议。
//!
//! # 契约说明（What）
//! - 刷新的完成是二元的：已送出，或携带异常；没有逐条应答；
//! - 代理路径上，处理器陈旧只清除缓存并正常返回（该处理器上没有排队条目）；
//!   其他失败清除缓存、通知失败观察者并向上返回，调用方由此得知批量可能丢失。

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};

use crate::buffer::RequestBuffer;
use crate::completion::{Completion, Deadline, InvocationState, WaitStatus};
use crate::error::InvocationError;
use crate::handler::{BatchRequest, Connection, RequestHandler};
use crate::observer::InvocationObserver;
use crate::protocol::{BATCH_REQUEST_HEADER, HEADER_SIZE};
use crate::reference::Proxy;

enum Target<'p> {
    Proxy(&'p dyn Proxy),
    Connection(Arc<dyn Connection>),
}

/// 批量刷新调用。
pub struct BatchInvocation<'p> {
    target: Target<'p>,
    completion: Completion,
    name: Arc<str>,
    observer: Arc<dyn InvocationObserver>,
}

impl<'p> BatchInvocation<'p> {
    /// 刷新代理解析出的处理器上累积的批量请求。
    pub fn for_proxy(proxy: &'p dyn Proxy, name: &str) -> Self {
        let observer = proxy.observer();
        Self {
            target: Target::Proxy(proxy),
            completion: Completion::for_batch(Arc::clone(&observer)),
            name: Arc::from(name),
            observer,
        }
    }

    /// 刷新已绑定连接上累积的批量请求。
    pub fn for_connection(
        connection: Arc<dyn Connection>,
        observer: Arc<dyn InvocationObserver>,
        name: &str,
    ) -> Self {
        Self {
            target: Target::Connection(connection),
            completion: Completion::for_batch(Arc::clone(&observer)),
            name: Arc::from(name),
            observer,
        }
    }

    /// 执行刷新。
    pub fn invoke(&mut self) -> Result<(), InvocationError> {
        if self.completion.state() != InvocationState::Unsent {
            return Err(InvocationError::InvalidState {
                detail: "batch flush already started".into(),
            });
        }
        let attempt = self.completion.begin_attempt();
        match &self.target {
            Target::Connection(connection) => {
                let batch = BatchRequest::new(attempt, Arc::clone(&self.name));
                let flushed = match connection.flush_batch_requests(batch) {
                    Ok(true) => self.complete_synchronously(),
                    Ok(false) => {
                        self.completion.await_outcome(Deadline::none(), || {});
                        self.flush_result()
                    }
                    Err(error) => Err(error),
                };
                flushed.map_err(|error| self.fail(error))
            }
            Target::Proxy(proxy) => self.flush_through(*proxy, &attempt),
        }
    }

    fn flush_through(&self, proxy: &dyn Proxy, attempt: &Completion) -> Result<(), InvocationError> {
        let deadline = Deadline::from_timeout(proxy.invocation_timeout());
        let handler = match proxy.acquire_request_handler(false) {
            Ok(handler) => handler,
            Err(error) => return self.flush_failed(proxy, None, error),
        };
        let batch = BatchRequest::new(attempt.clone(), Arc::clone(&self.name));
        let flushed = match handler.flush_batch_requests(batch) {
            Ok(true) => self.complete_synchronously(),
            Ok(false) => {
                let status = self.completion.await_outcome(deadline, || {
                    tracing::warn!(batch = %self.name, "batch flush deadline expired, requesting cancellation");
                    handler.request_timed_out(attempt);
                });
                if status == WaitStatus::TimedOut {
                    tracing::debug!(batch = %self.name, "batch flush settled after cancellation request");
                }
                self.flush_result()
            }
            Err(error) => Err(error),
        };
        match flushed {
            Ok(()) => Ok(()),
            Err(error) => self.flush_failed(proxy, Some(&handler), error),
        }
    }

    fn flush_failed(
        &self,
        proxy: &dyn Proxy,
        handler: Option<&Arc<dyn RequestHandler>>,
        error: InvocationError,
    ) -> Result<(), InvocationError> {
        if let Some(handler) = handler {
            proxy.clear_request_handler(handler);
        }
        if error == InvocationError::HandlerStale {
            tracing::trace!(batch = %self.name, "stale handler dropped, nothing was queued on it");
            return Ok(());
        }
        Err(self.fail(error))
    }

    fn fail(&self, error: InvocationError) -> InvocationError {
        tracing::debug!(batch = %self.name, code = error.code(), "batch flush failed");
        self.completion.fail_locally(error.clone());
        self.observer.on_failure(error.code());
        error
    }

    /// 处理器同步完成刷新：未报告异常即视为已送出。
    fn complete_synchronously(&self) -> Result<(), InvocationError> {
        self.flush_result()?;
        self.completion.complete_locally();
        Ok(())
    }

    fn flush_result(&self) -> Result<(), InvocationError> {
        match self.completion.exception() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// 当前状态。
    pub fn state(&self) -> InvocationState {
        self.completion.state()
    }

    /// 是否已送出。
    pub fn is_sent(&self) -> bool {
        self.completion.is_sent()
    }

    /// 刷新操作名。
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
struct QueueState {
    entries: Vec<Bytes>,
    claimed: bool,
}

/// 共享批量缓冲区。
///
/// # 契约说明（What）
/// - [`prepare`](Self::prepare) 取得写入权，其他调用方在写入权释放前阻塞；
/// - [`finish`](Self::finish) 追加条目并释放写入权，[`abort`](Self::abort) 仅释放写入权；
/// - [`drain`](Self::drain) / [`drain_message`](Self::drain_message) 在无人持有写入权时取走全部条目。
#[derive(Default)]
pub struct BatchQueue {
    state: Mutex<QueueState>,
    released: Condvar,
}

impl BatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取得写入权。
    pub fn prepare(&self) {
        let mut state = self.state.lock();
        while state.claimed {
            self.released.wait(&mut state);
        }
        state.claimed = true;
    }

    /// 追加条目并释放写入权。
    pub fn finish(&self, entry: RequestBuffer) -> Result<(), InvocationError> {
        let entry = entry.freeze();
        let mut state = self.state.lock();
        state.claimed = false;
        let result = entry.map(|bytes| state.entries.push(bytes));
        self.released.notify_all();
        result
    }

    /// 释放写入权，不追加条目。
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.claimed = false;
        self.released.notify_all();
    }

    /// 已排队条目数。
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否有调用方持有写入权。
    pub fn is_claimed(&self) -> bool {
        self.state.lock().claimed
    }

    /// 取走全部条目。
    pub fn drain(&self) -> Vec<Bytes> {
        let mut state = self.state.lock();
        while state.claimed {
            self.released.wait(&mut state);
        }
        std::mem::take(&mut state.entries)
    }

    /// 取走全部条目并编码为批量请求消息；队列为空时返回 `None`。
    pub fn drain_message(&self) -> Result<Option<Bytes>, InvocationError> {
        let entries = self.drain();
        if entries.is_empty() {
            return Ok(None);
        }
        let count = i32::try_from(entries.len())
            .map_err(|_| InvocationError::marshal("batch entry count exceeds i32::MAX"))?;
        let body: usize = entries.iter().map(Bytes::len).sum();
        let mut message = BytesMut::with_capacity(BATCH_REQUEST_HEADER.len() + body);
        message.put_slice(&BATCH_REQUEST_HEADER[..HEADER_SIZE]);
        message.put_i32_le(count);
        for entry in &entries {
            message.put_slice(entry);
        }
        Ok(Some(message.freeze()))
    }
}

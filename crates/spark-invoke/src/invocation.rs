//! 同步调用：构造期编组、参数写入、重试循环与应答读取。
//!
//! # 教案级导览
//!
//! - **生命周期 (What)**：一次逻辑调用（含全部重试）对应一个 [`Invocation`]。
//!   1. [`Invocation::new`] 编组请求头；批量模式先取得批量缓冲区写入权；
//!   2. 调用方通过 [`start_write_params`](Invocation::start_write_params) 等写入参数封装；
//!   3. [`invoke`](Invocation::invoke) 冻结请求字节并驱动重试循环；
//!   4. 返回 `Ok(false)` 时以 [`read_user_exception`](Invocation::read_user_exception) 解码用户异常，
//!      返回 `Ok(true)` 时从 [`reply`](Invocation::reply) 读取结果。
//! - **重试循环 (How)**：每次尝试重置完成监视器并领取新代号的句柄、获取新处理器、提交并两阶段等待。路由陈旧在本地
//!   清除缓存后立刻重来，不计入尝试次数，连续次数超过代理给出的上限后交由重试策略裁决；
//!   其他错误一律交给重试策略，授予重试则递增尝试计数（必要时先休眠），否则通知失败观察者并返回。
//! - **编组失败 (Gotchas)**：构造期或参数写入期的编组失败不重试，经 [`abort`](Invocation::abort)
//!   释放批量写入权后原样返回。未调用 `invoke`/`abort` 就丢弃的批量调用会在析构时释放写入权。

use std::sync::Arc;
use std::thread;

use bytes::Bytes;

use crate::buffer::{ReplyBuffer, RequestBuffer};
use crate::completion::{Completion, Deadline, InvocationState, Outcome};
use crate::error::InvocationError;
use crate::handler::{OutgoingRequest, RequestHandler};
use crate::mode::{InvocationMode, OperationMode};
use crate::observer::InvocationObserver;
use crate::protocol::{ENCODING_1_1, REQUEST_HEADER, check_supported_protocol};
use crate::reference::{Proxy, RequestContext};

const INITIAL_CAPACITY: usize = 256;

/// 单次逻辑调用。
pub struct Invocation<'p> {
    proxy: &'p dyn Proxy,
    operation: Arc<str>,
    operation_mode: OperationMode,
    mode: InvocationMode,
    request: RequestBuffer,
    completion: Completion,
    observer: Arc<dyn InvocationObserver>,
    batch_handler: Option<Arc<dyn RequestHandler>>,
    batch_claim_open: bool,
    reply: Option<ReplyBuffer>,
}

impl<'p> Invocation<'p> {
    /// 创建调用并编组请求头。
    ///
    /// `context` 为显式上下文；缺省时写入代理上下文，若代理注入了隐式上下文则先与之合并。
    pub fn new(
        proxy: &'p dyn Proxy,
        operation: &str,
        operation_mode: OperationMode,
        context: Option<&RequestContext>,
    ) -> Result<Self, InvocationError> {
        check_supported_protocol(proxy.protocol())?;
        let mode = proxy.invocation_mode();
        let observer = proxy.observer();
        let mut invocation = Self {
            proxy,
            operation: Arc::from(operation),
            operation_mode,
            mode,
            request: RequestBuffer::with_capacity(INITIAL_CAPACITY),
            completion: Completion::for_request(mode, Arc::clone(&observer)),
            observer,
            batch_handler: None,
            batch_claim_open: false,
            reply: None,
        };

        if mode.writes_header() {
            invocation.request.write_blob(&REQUEST_HEADER);
        } else {
            let handler = acquire_batch_handler(proxy, &mut invocation.request, invocation.observer.as_ref())?;
            invocation.batch_handler = Some(handler);
            invocation.batch_claim_open = true;
        }

        match invocation.marshal_header(context) {
            Ok(()) => Ok(invocation),
            Err(error) => Err(invocation.abort(error)),
        }
    }

    fn marshal_header(&mut self, context: Option<&RequestContext>) -> Result<(), InvocationError> {
        let proxy = self.proxy;
        let request = &mut self.request;
        request.write_identity(proxy.identity())?;
        request.write_facet(proxy.facet())?;
        request.write_string(&self.operation)?;
        request.write_byte(self.operation_mode.as_byte());
        match (context, proxy.implicit_context()) {
            (Some(explicit), _) => request.write_context(explicit),
            (None, Some(implicit)) => implicit.write(proxy.context(), request),
            (None, None) => request.write_context(proxy.context()),
        }
    }

    /// 放弃尚未发出的调用：释放批量写入权并原样返回 `error`。
    pub fn abort(mut self, error: InvocationError) -> InvocationError {
        self.release_batch_claim();
        error
    }

    fn release_batch_claim(&mut self) {
        if std::mem::take(&mut self.batch_claim_open) {
            if let Some(handler) = &self.batch_handler {
                handler.abort_batch_request();
            }
        }
    }

    fn ensure_unsent(&self) -> Result<(), InvocationError> {
        if self.completion.state() != InvocationState::Unsent {
            return Err(InvocationError::InvalidState {
                detail: "invocation already started".into(),
            });
        }
        Ok(())
    }

    /// 打开参数封装并返回请求缓冲区。
    pub fn start_write_params(&mut self) -> Result<&mut RequestBuffer, InvocationError> {
        self.ensure_unsent()?;
        self.request.start_encapsulation(ENCODING_1_1)?;
        Ok(&mut self.request)
    }

    /// 关闭参数封装。
    pub fn end_write_params(&mut self) -> Result<(), InvocationError> {
        self.ensure_unsent()?;
        self.request.end_encapsulation()
    }

    /// 写入空参数封装。
    pub fn write_empty_params(&mut self) -> Result<(), InvocationError> {
        self.ensure_unsent()?;
        self.request.write_empty_encapsulation(ENCODING_1_1)
    }

    /// 发出调用。
    ///
    /// 返回 `Ok(true)` 表示成功（单向/数据报/批量为“已送出”），`Ok(false)` 表示收到用户异常。
    /// 对非批量调用，返回时状态必为终态。
    pub fn invoke(&mut self) -> Result<bool, InvocationError> {
        self.ensure_unsent()?;
        if self.mode.is_batch() {
            return self.finish_batch();
        }
        let payload = match std::mem::take(&mut self.request).freeze() {
            Ok(payload) => payload,
            Err(error) => return Err(self.give_up(error)),
        };
        self.run_attempts(&payload)
    }

    fn finish_batch(&mut self) -> Result<bool, InvocationError> {
        self.completion.begin_attempt();
        let entry = std::mem::take(&mut self.request);
        let handler = match self.batch_handler.clone() {
            Some(handler) if !entry.has_open_encapsulation() => handler,
            _ => {
                self.release_batch_claim();
                return Err(self.give_up(InvocationError::marshal("batch entry is incomplete")));
            }
        };
        self.batch_claim_open = false;
        match handler.finish_batch_request(entry) {
            Ok(()) => {
                self.completion.complete_locally();
                Ok(true)
            }
            Err(error) => Err(self.give_up(error)),
        }
    }

    fn run_attempts(&mut self, payload: &Bytes) -> Result<bool, InvocationError> {
        let proxy = self.proxy;
        let stale_limit = proxy.stale_handler_limit();
        let mut attempt: u32 = 0;
        let mut stale_restarts: u32 = 0;
        loop {
            let (handler, result) = self.attempt_once(payload);
            let error = match result {
                Ok(response) => {
                    self.reply = self.completion.take_reply();
                    return Ok(response);
                }
                Err(error) => error,
            };

            if error == InvocationError::HandlerStale && stale_restarts < stale_limit {
                if let Some(handler) = &handler {
                    proxy.clear_request_handler(handler);
                }
                stale_restarts += 1;
                tracing::trace!(operation = %self.operation, stale_restarts, "request handler stale, reacquiring");
                continue;
            }
            stale_restarts = 0;

            let code = error.code();
            let sent = self.completion.is_sent();
            match proxy.consult_retry_policy(error, handler.as_ref(), self.operation_mode, sent, attempt) {
                Ok(decision) => {
                    self.observer.on_retry();
                    attempt = attempt.saturating_add(1);
                    let delay = decision.delay();
                    tracing::debug!(
                        operation = %self.operation,
                        attempt,
                        code,
                        interval_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "retrying invocation"
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                Err(error) => return Err(self.give_up(error)),
            }
        }
    }

    fn attempt_once(&self, payload: &Bytes) -> (Option<Arc<dyn RequestHandler>>, Result<bool, InvocationError>) {
        let attempt = self.completion.begin_attempt();
        let deadline = Deadline::from_timeout(self.proxy.invocation_timeout());
        let handler = match self.proxy.acquire_request_handler(false) {
            Ok(handler) => handler,
            Err(error) => return (None, Err(error)),
        };

        let request = OutgoingRequest::new(
            attempt.clone(),
            payload.clone(),
            Arc::clone(&self.operation),
            self.mode,
            self.operation_mode,
        );
        match handler.send_request(request) {
            Ok(true) if !self.mode.expects_reply() => {
                self.completion.complete_locally();
                return (Some(handler), Ok(true));
            }
            Ok(true) => {
                tracing::warn!(operation = %self.operation, "synchronous completion reported for a twoway request, awaiting reply");
            }
            Ok(false) => {}
            Err(error) => return (Some(handler), Err(error)),
        }

        self.completion.await_outcome(deadline, || {
            tracing::warn!(operation = %self.operation, "invocation deadline expired, requesting cancellation");
            handler.request_timed_out(&attempt);
        });
        let result = self.completion.attempt_result();
        (Some(handler), result)
    }

    /// 终止调用：强制终态并通知失败观察者。
    fn give_up(&self, error: InvocationError) -> InvocationError {
        tracing::debug!(operation = %self.operation, code = error.code(), "invocation failed");
        self.completion.fail_locally(error.clone());
        self.observer.on_failure(error.code());
        error
    }

    /// 解码用户异常：打开应答封装、交由 `decode` 解码、关闭封装。
    pub fn read_user_exception<T>(
        &mut self,
        decode: impl FnOnce(&mut ReplyBuffer) -> Result<T, InvocationError>,
    ) -> Result<T, InvocationError> {
        if self.completion.state() != InvocationState::UserException {
            return Err(InvocationError::InvalidState {
                detail: "no user exception to read".into(),
            });
        }
        let reply = self
            .reply
            .as_mut()
            .ok_or_else(|| InvocationError::marshal("user exception reply already consumed"))?;
        reply.start_encapsulation()?;
        let value = decode(reply)?;
        reply.end_encapsulation()?;
        Ok(value)
    }

    /// 成功或用户异常应答的负载，定位在结果封装开头。
    pub fn reply(&mut self) -> Option<&mut ReplyBuffer> {
        self.reply.as_mut()
    }

    /// 当前状态。
    pub fn state(&self) -> InvocationState {
        self.completion.state()
    }

    /// 终态与载荷。
    pub fn outcome(&self) -> Option<Outcome> {
        self.completion.outcome()
    }

    /// 最近一次尝试的已发送标记。
    pub fn is_sent(&self) -> bool {
        self.completion.is_sent()
    }

    /// 操作名。
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// 调用模式。
    pub fn mode(&self) -> InvocationMode {
        self.mode
    }

    /// 尚未冻结的请求字节。
    pub fn request(&self) -> &RequestBuffer {
        &self.request
    }
}

impl Drop for Invocation<'_> {
    fn drop(&mut self) {
        self.release_batch_claim();
    }
}

/// 为批量条目取得处理器与批量缓冲区写入权。
///
/// 路由陈旧时清除缓存并重试，连续次数超过上限后按普通失败处理；
/// 其他失败通知观察者、清除缓存后返回。
fn acquire_batch_handler(
    proxy: &dyn Proxy,
    buffer: &mut RequestBuffer,
    observer: &dyn InvocationObserver,
) -> Result<Arc<dyn RequestHandler>, InvocationError> {
    let limit = proxy.stale_handler_limit();
    let mut stale_restarts: u32 = 0;
    loop {
        match prepare_batch(proxy, buffer) {
            Ok(handler) => return Ok(handler),
            Err((handler, InvocationError::HandlerStale)) if stale_restarts < limit => {
                if let Some(handler) = &handler {
                    proxy.clear_request_handler(handler);
                }
                stale_restarts += 1;
                tracing::trace!(stale_restarts, "batch handler stale, reacquiring");
            }
            Err((handler, error)) => {
                observer.on_failure(error.code());
                if let Some(handler) = &handler {
                    proxy.clear_request_handler(handler);
                }
                return Err(error);
            }
        }
    }
}

type PrepareFailure = (Option<Arc<dyn RequestHandler>>, InvocationError);

fn prepare_batch(proxy: &dyn Proxy, buffer: &mut RequestBuffer) -> Result<Arc<dyn RequestHandler>, PrepareFailure> {
    let handler = proxy.acquire_request_handler(true).map_err(|error| (None, error))?;
    match handler.prepare_batch_request(buffer) {
        Ok(()) => Ok(handler),
        Err(error) => Err((Some(handler), error)),
    }
}

//! 集成测试共享夹具：脚本化请求处理器、应答构造器与记录型重试策略。
//!
//! # 设计说明
//! - [`Harness`] 扮演“连接”：同一个 harness 产出的所有处理器共享脚本、统计与批量缓冲区，
//!   因此陈旧处理器被替换后脚本仍按顺序推进；
//! - 每次 `send_request` 弹出一个 [`Step`]，脚本耗尽后使用 `fallback`，两者都缺失时测试直接 panic；
//! - 超时回调按 [`OnTimeout`] 在后台线程中延迟给出权威结果，模拟传输层的取消确认。
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use spark_invoke::{
    BatchQueue, BatchRequest, Completion, HandlerFactory, Identity, InvocationError, OperationMode,
    OutgoingRequest, ProxyRef, ProxyRefBuilder, RemoteObserver, ReplyBuffer, ReplyStatus, RequestBuffer,
    RequestContext, RequestHandler, RetryDecision, RetryPolicy,
};

/// 单次 `send_request` 的脚本动作。
#[derive(Clone, Debug)]
pub enum Step {
    /// 同步写出并送达应答，返回 `Ok(false)`。
    Reply(Bytes),
    /// 返回 `Ok(false)`，由后台线程在延迟后写出并送达应答。
    ReplyAfter(Duration, Bytes),
    /// 同步报告失败；`sent` 为失败前是否已写出。
    Fail { error: InvocationError, sent: bool },
    /// `send_request` 直接返回错误。
    Reject(InvocationError),
    /// 写出后返回 `Ok(true)`（单向请求的同步完成）。
    SentSync,
    /// 返回 `Ok(false)` 且不再回调，等待超时回调处理。
    Silent,
}

impl Step {
    pub fn stale() -> Self {
        Self::Reject(InvocationError::HandlerStale)
    }

    pub fn lost(sent: bool) -> Self {
        Self::Fail {
            error: InvocationError::connection_lost("peer reset"),
            sent,
        }
    }
}

/// 批量刷新的脚本动作。
#[derive(Clone, Debug)]
pub enum FlushStep {
    /// 取走队列、写出并返回 `Ok(true)`。
    Sent,
    /// 取走队列并返回 `Ok(true)`，但不回调 `sent()`。
    SentSync,
    /// 返回 `Ok(false)`，后台线程延迟后写出。
    SentAfter(Duration),
    /// 直接返回错误。
    Reject(InvocationError),
    /// 返回 `Ok(false)` 且不再回调。
    Silent,
}

/// 截止时间到达后的处理方式。
#[derive(Clone, Debug)]
pub enum OnTimeout {
    /// 延迟后以给定错误结束（`sent` 沿用当前标记）。
    FailAfter(Duration, InvocationError),
    /// 延迟后写出并送达应答。
    ReplyAfter(Duration, Bytes),
    /// 延迟后报告已写出（批量刷新）。
    SentAfter(Duration),
}

/// 远端观察者的记录。
#[derive(Default)]
pub struct RemoteLog {
    pub replies: Mutex<Vec<usize>>,
    pub failures: Mutex<Vec<String>>,
    pub detached: AtomicUsize,
}

struct RecordingRemote {
    log: Arc<RemoteLog>,
}

impl RemoteObserver for RecordingRemote {
    fn reply(&mut self, size: usize) {
        self.log.replies.lock().push(size);
    }

    fn failed(&mut self, kind: &str) {
        self.log.failures.lock().push(kind.to_owned());
    }

    fn detach(self: Box<Self>) {
        self.log.detached.fetch_add(1, Ordering::SeqCst);
    }
}

/// 脚本化的“连接”。
#[derive(Default)]
pub struct Harness {
    steps: Mutex<VecDeque<Step>>,
    fallback: Mutex<Option<Step>>,
    flush_steps: Mutex<VecDeque<FlushStep>>,
    on_timeout: Mutex<Option<OnTimeout>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    pub batch: BatchQueue,
    pub remote: Arc<RemoteLog>,
    pub payloads: Mutex<Vec<Bytes>>,
    pub flushed: Mutex<Vec<Bytes>>,
    pub created: AtomicUsize,
    pub sends: AtomicUsize,
    pub flushes: AtomicUsize,
    pub timeouts: AtomicUsize,
}

impl Harness {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        let harness = Self::default();
        harness.steps.lock().extend(steps);
        Arc::new(harness)
    }

    /// 空脚本，通常随后设置 fallback 或只用于批量路径。
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 脚本耗尽后重复执行的动作。
    pub fn set_fallback(&self, step: Step) {
        *self.fallback.lock() = Some(step);
    }

    pub fn push_flush(&self, step: FlushStep) {
        self.flush_steps.lock().push_back(step);
    }

    pub fn set_on_timeout(&self, behaviour: OnTimeout) {
        *self.on_timeout.lock() = Some(behaviour);
    }

    /// 每次调用都创建新处理器的工厂。
    pub fn factory(self: &Arc<Self>) -> Arc<dyn HandlerFactory> {
        let harness = Arc::clone(self);
        let factory = move |_for_batch: bool| -> Result<Arc<dyn RequestHandler>, InvocationError> {
            harness.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ScriptedHandler {
                harness: Arc::clone(&harness),
            }))
        };
        Arc::new(factory)
    }

    /// 以 `hello`/`demo` 身份开始构建代理。
    pub fn proxy(self: &Arc<Self>) -> ProxyRefBuilder {
        ProxyRef::builder(Identity::new("hello", "demo"), self.factory())
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn timeouts(&self) -> usize {
        self.timeouts.load(Ordering::SeqCst)
    }

    /// 等待全部后台线程结束。
    pub fn join_workers(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            worker.join().expect("后台 I/O 线程不应 panic");
        }
    }

    fn spawn(&self, delay: Duration, work: impl FnOnce() + Send + 'static) {
        let worker = thread::spawn(move || {
            thread::sleep(delay);
            work();
        });
        self.workers.lock().push(worker);
    }

    fn next_step(&self) -> Step {
        if let Some(step) = self.steps.lock().pop_front() {
            return step;
        }
        self.fallback
            .lock()
            .clone()
            .expect("脚本已耗尽且未设置 fallback")
    }
}

/// 由 [`Harness`] 驱动的请求处理器。
pub struct ScriptedHandler {
    harness: Arc<Harness>,
}

impl RequestHandler for ScriptedHandler {
    fn prepare_batch_request(&self, _buffer: &mut RequestBuffer) -> Result<(), InvocationError> {
        self.harness.batch.prepare();
        Ok(())
    }

    fn finish_batch_request(&self, buffer: RequestBuffer) -> Result<(), InvocationError> {
        self.harness.batch.finish(buffer)
    }

    fn abort_batch_request(&self) {
        self.harness.batch.abort();
    }

    fn send_request(&self, request: OutgoingRequest) -> Result<bool, InvocationError> {
        let harness = &self.harness;
        harness.sends.fetch_add(1, Ordering::SeqCst);
        harness.payloads.lock().push(request.payload().clone());
        let completion = request.completion().clone();
        completion.attach_remote_observer(Box::new(RecordingRemote {
            log: Arc::clone(&harness.remote),
        }));

        match harness.next_step() {
            Step::Reply(reply) => {
                completion.sent();
                completion
                    .finished_with_reply(ReplyBuffer::new(reply))
                    .expect("脚本应答必须被接受");
                Ok(false)
            }
            Step::ReplyAfter(delay, reply) => {
                harness.spawn(delay, move || {
                    completion.sent();
                    let _ = completion.finished_with_reply(ReplyBuffer::new(reply));
                });
                Ok(false)
            }
            Step::Fail { error, sent } => {
                completion
                    .finished_with_error(error, sent)
                    .expect("脚本失败必须被接受");
                Ok(false)
            }
            Step::Reject(error) => Err(error),
            Step::SentSync => {
                completion.sent();
                Ok(true)
            }
            Step::Silent => Ok(false),
        }
    }

    fn flush_batch_requests(&self, batch: BatchRequest) -> Result<bool, InvocationError> {
        let harness = &self.harness;
        harness.flushes.fetch_add(1, Ordering::SeqCst);
        let step = harness.flush_steps.lock().pop_front().unwrap_or(FlushStep::Sent);
        match step {
            FlushStep::Sent => {
                if let Some(message) = harness.batch.drain_message()? {
                    harness.flushed.lock().push(message);
                }
                batch.completion().sent();
                Ok(true)
            }
            FlushStep::SentSync => {
                if let Some(message) = harness.batch.drain_message()? {
                    harness.flushed.lock().push(message);
                }
                Ok(true)
            }
            FlushStep::SentAfter(delay) => {
                let completion = batch.completion().clone();
                harness.spawn(delay, move || completion.sent());
                Ok(false)
            }
            FlushStep::Reject(error) => Err(error),
            FlushStep::Silent => Ok(false),
        }
    }

    fn request_timed_out(&self, completion: &Completion) {
        let harness = &self.harness;
        harness.timeouts.fetch_add(1, Ordering::SeqCst);
        let behaviour = harness.on_timeout.lock().clone();
        let completion = completion.clone();
        match behaviour {
            Some(OnTimeout::FailAfter(delay, error)) => harness.spawn(delay, move || {
                let sent = completion.is_sent();
                let _ = completion.finished_with_error(error, sent);
            }),
            Some(OnTimeout::ReplyAfter(delay, reply)) => harness.spawn(delay, move || {
                completion.sent();
                let _ = completion.finished_with_reply(ReplyBuffer::new(reply));
            }),
            Some(OnTimeout::SentAfter(delay)) => harness.spawn(delay, move || completion.sent()),
            None => {
                let sent = completion.is_sent();
                let _ = completion.finished_with_error(InvocationError::InvocationTimeout, sent);
            }
        }
    }
}

/// 记录尝试序号的重试策略：`attempt < give_up_at` 时立即重试，否则原样返回错误。
pub struct RecordingPolicy {
    pub attempts: Mutex<Vec<u32>>,
    pub errors: Mutex<Vec<InvocationError>>,
    give_up_at: u32,
}

impl RecordingPolicy {
    pub fn new(give_up_at: u32) -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            give_up_at,
        })
    }

    pub fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().clone()
    }
}

impl RetryPolicy for RecordingPolicy {
    fn decide(
        &self,
        error: InvocationError,
        _mode: OperationMode,
        _sent: bool,
        attempt: u32,
    ) -> Result<RetryDecision, InvocationError> {
        self.attempts.lock().push(attempt);
        self.errors.lock().push(error.clone());
        if attempt >= self.give_up_at {
            return Err(error);
        }
        Ok(RetryDecision::RetryNow)
    }
}

fn reply_with(status: ReplyStatus, body: impl FnOnce(&mut RequestBuffer)) -> Bytes {
    let mut reply = RequestBuffer::new();
    reply.write_byte(status.as_byte());
    body(&mut reply);
    reply.freeze().expect("应答构造不应留下未关闭的封装")
}

/// 成功应答，结果封装内含一个 `i32`。
pub fn reply_ok(result: i32) -> Bytes {
    reply_with(ReplyStatus::Ok, |reply| {
        reply
            .start_encapsulation(spark_invoke::protocol::ENCODING_1_1)
            .expect("打开结果封装");
        reply.write_int(result);
        reply.end_encapsulation().expect("关闭结果封装");
    })
}

/// 用户异常应答，异常封装内含一条消息字符串。
pub fn reply_user_exception(message: &str) -> Bytes {
    reply_with(ReplyStatus::UserException, |reply| {
        reply
            .start_encapsulation(spark_invoke::protocol::ENCODING_1_1)
            .expect("打开异常封装");
        reply.write_string(message).expect("写入消息");
        reply.end_encapsulation().expect("关闭异常封装");
    })
}

/// “目标不存在”类应答；`facet` 按序列编码，可以故意给出多个元素。
pub fn reply_request_failed(status: ReplyStatus, id: &Identity, facet: &[&str], operation: &str) -> Bytes {
    reply_with(status, |reply| {
        reply.write_identity(id).expect("写入身份");
        reply.write_string_seq(facet).expect("写入 facet 路径");
        reply.write_string(operation).expect("写入操作名");
    })
}

/// “未知异常”类应答。
pub fn reply_unknown(status: ReplyStatus, message: &str) -> Bytes {
    reply_with(status, |reply| reply.write_string(message).expect("写入消息"))
}

/// 从请求字节中解析出的请求头。
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedRequest {
    pub identity: Identity,
    pub facet: Vec<String>,
    pub operation: String,
    pub mode: u8,
    pub context: RequestContext,
}

/// 解析请求头；`header_len` 为协议头长度（批量条目为 0）。
pub fn parse_request(payload: &Bytes, header_len: usize) -> ParsedRequest {
    let mut reader = ReplyBuffer::new(payload.clone());
    reader.read_blob(header_len).expect("协议头");
    ParsedRequest {
        identity: reader.read_identity().expect("身份"),
        facet: reader.read_string_seq().expect("facet"),
        operation: reader.read_string().expect("操作名"),
        mode: reader.read_byte().expect("操作模式"),
        context: reader.read_context().expect("上下文"),
    }
}

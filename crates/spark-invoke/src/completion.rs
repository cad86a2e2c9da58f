//! 调用结果状态机与跨线程完成监视器。
//!
//! # 教案级导览
//!
//! - **核心目标 (Why)**：调用线程在 `invoke()` 内阻塞，I/O 线程通过 `sent()`/`finished_*()` 回调报告进展。
//!   状态、已发送标记、异常载荷与应答缓冲区必须作为一个整体被观察，否则调用线程可能读到
//!   “状态已终结但载荷尚未写入”的中间态。
//! - **结构 (How)**：[`Completion`] 是 `Arc` 包裹的监视器（`parking_lot::Mutex` + `Condvar`）。调用引擎持有一份，
//!   提交给请求处理器的 [`OutgoingRequest`](crate::handler::OutgoingRequest) 持有另一份。
//!   所有写入在同一把锁内完成，并且描述结果的字段先于终态写入。
//! - **契约 (What)**：
//!   - 同一次尝试最多接受一次终态回调，后到者返回 [`CompletionRejected`]；
//!   - 每次尝试分配新的代号（generation），处理器拿到的句柄携带该代号，
//!     旧尝试的迟到回调一律被拒绝，不会被当作新尝试的结果；
//!   - `sent()` 可以先于或晚于应答到达，但在失败落定之后到达的 `sent()` 被忽略；
//!   - 超时只会“请求取消”，[`Completion::await_outcome`] 随后无限期等待权威结果，
//!     不会在本地捏造超时异常。

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::buffer::ReplyBuffer;
use crate::error::{CompletionRejected, InvocationError};
use crate::mode::InvocationMode;
use crate::observer::{InvocationObserver, RemoteObserver};
use crate::reply::{ReplyOutcome, decode_reply};

/// 单次调用的生命周期状态。
///
/// 顺序即合法推进方向：`Unsent` 只出现在首次尝试之前；重试重新进入 `InProgress`，
/// 但永不回到 `Unsent`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InvocationState {
    Unsent,
    InProgress,
    Ok,
    UserException,
    LocalException,
    Failed,
}

impl InvocationState {
    /// 是否为终态。
    pub fn is_terminal(self) -> bool {
        self > Self::InProgress
    }
}

/// 调用终态及其载荷。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    UserException,
    /// 已收到应答，但应答描述了一个系统异常。
    LocalException(InvocationError),
    /// 发送或传输失败，可能可以重试。
    Failed(InvocationError),
}

/// 单调时钟上的截止时间。
///
/// 与 `Option<Instant>` 等价，额外提供“超时时长为零即不设截止”的构造约定。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Deadline {
    instant: Option<Instant>,
}

impl Deadline {
    /// 未设置截止时间。
    pub const fn none() -> Self {
        Self { instant: None }
    }

    /// 以绝对时间点构造。
    pub fn at(instant: Instant) -> Self {
        Self {
            instant: Some(instant),
        }
    }

    /// 以 `now + timeout` 构造；零时长视为未设置。
    pub fn with_timeout(now: Instant, timeout: Duration) -> Self {
        if timeout.is_zero() {
            return Self::none();
        }
        now.checked_add(timeout).map_or_else(Self::none, Self::at)
    }

    /// 从可选超时构造，起点为当前时刻。
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        timeout.map_or_else(Self::none, |timeout| Self::with_timeout(Instant::now(), timeout))
    }

    /// 获取截止时间点。
    pub fn instant(&self) -> Option<Instant> {
        self.instant
    }

    /// 判断在 `now` 时刻是否已过期。
    pub fn is_expired(&self, now: Instant) -> bool {
        self.instant.is_some_and(|deadline| now >= deadline)
    }
}

/// [`Completion::await_outcome`] 的返回值，说明等待是否经历了超时阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Completed,
    /// 截止时间先到，已请求取消并等到了权威结果。
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompletionKind {
    Request(InvocationMode),
    Batch,
}

struct Slot {
    generation: u64,
    state: InvocationState,
    sent: bool,
    exception: Option<InvocationError>,
    reply: Option<ReplyBuffer>,
    remote: Option<Box<dyn RemoteObserver>>,
}

impl Slot {
    fn detach_remote(&mut self) {
        if let Some(remote) = self.remote.take() {
            remote.detach();
        }
    }
}

struct Shared {
    kind: CompletionKind,
    slot: Mutex<Slot>,
    cond: Condvar,
    observer: Arc<dyn InvocationObserver>,
}

impl Shared {
    fn is_settled(&self, slot: &Slot) -> bool {
        match self.kind {
            CompletionKind::Request(_) => {
                slot.state == InvocationState::Failed
                    || (slot.state.is_terminal() && slot.sent)
            }
            CompletionKind::Batch => slot.exception.is_some() || slot.sent,
        }
    }
}

/// 跨线程完成监视器。
///
/// # 契约说明（What）
/// - 请求处理器侧：[`sent`](Self::sent)、[`finished_with_error`](Self::finished_with_error)、
///   [`finished_with_reply`](Self::finished_with_reply)、[`attach_remote_observer`](Self::attach_remote_observer)；
/// - 调用引擎侧：[`await_outcome`](Self::await_outcome) 以及 crate 内部的尝试重置与结果读取；
/// - 克隆只复制 `Arc`，所有克隆观察同一份状态，[`ptr_eq`](Self::ptr_eq) 用于识别同一次调用；
/// - 句柄记录创建时的尝试代号，处理器侧回调只在代号与当前尝试一致时生效。
#[derive(Clone)]
pub struct Completion {
    shared: Arc<Shared>,
    generation: u64,
}

impl Completion {
    /// 为单次请求创建监视器，初始状态 `Unsent`。
    pub fn for_request(mode: InvocationMode, observer: Arc<dyn InvocationObserver>) -> Self {
        Self::with_kind(CompletionKind::Request(mode), observer)
    }

    /// 为批量刷新创建监视器。
    pub fn for_batch(observer: Arc<dyn InvocationObserver>) -> Self {
        Self::with_kind(CompletionKind::Batch, observer)
    }

    fn with_kind(kind: CompletionKind, observer: Arc<dyn InvocationObserver>) -> Self {
        Self {
            shared: Arc::new(Shared {
                kind,
                slot: Mutex::new(Slot {
                    generation: 0,
                    state: InvocationState::Unsent,
                    sent: false,
                    exception: None,
                    reply: None,
                    remote: None,
                }),
                cond: Condvar::new(),
                observer,
            }),
            generation: 0,
        }
    }

    /// 本句柄是否属于当前尝试。
    fn is_current(&self, slot: &Slot) -> bool {
        slot.generation == self.generation && slot.state != InvocationState::Unsent
    }

    /// 请求的调用模式；批量刷新返回 `None`。
    pub fn mode(&self) -> Option<InvocationMode> {
        match self.shared.kind {
            CompletionKind::Request(mode) => Some(mode),
            CompletionKind::Batch => None,
        }
    }

    /// 是否期待应答。
    pub fn expects_reply(&self) -> bool {
        self.mode().is_some_and(InvocationMode::expects_reply)
    }

    /// 获取当前状态。
    pub fn state(&self) -> InvocationState {
        self.shared.slot.lock().state
    }

    /// 获取已发送标记。
    pub fn is_sent(&self) -> bool {
        self.shared.slot.lock().sent
    }

    /// 获取当前异常载荷的副本。
    pub fn exception(&self) -> Option<InvocationError> {
        self.shared.slot.lock().exception.clone()
    }

    /// 终态及其载荷；未到终态时返回 `None`。
    pub fn outcome(&self) -> Option<Outcome> {
        let slot = self.shared.slot.lock();
        let payload = || {
            slot.exception
                .clone()
                .unwrap_or_else(|| InvocationError::marshal("terminal state without payload"))
        };
        match slot.state {
            InvocationState::Unsent | InvocationState::InProgress => None,
            InvocationState::Ok => Some(Outcome::Ok),
            InvocationState::UserException => Some(Outcome::UserException),
            InvocationState::LocalException => Some(Outcome::LocalException(payload())),
            InvocationState::Failed => Some(Outcome::Failed(payload())),
        }
    }

    /// 句柄所属的尝试代号；首次尝试为 1。
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 判断两个句柄是否指向同一监视器。
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// 挂接远端观察者，终态回调时自动分离。旧尝试的句柄挂接时立即分离传入的观察者。
    pub fn attach_remote_observer(&self, remote: Box<dyn RemoteObserver>) {
        let mut slot = self.shared.slot.lock();
        if !self.is_current(&slot) {
            remote.detach();
            return;
        }
        slot.detach_remote();
        slot.remote = Some(remote);
    }

    /// 报告请求字节已写出。
    ///
    /// 对不期待应答的请求，写出即完成：状态推进到 `Ok` 并分离远端观察者。
    /// 旧尝试的句柄或已失败落定的尝试上调用时不产生任何效果。
    pub fn sent(&self) {
        let shared = &*self.shared;
        let mut slot = shared.slot.lock();
        if !self.is_current(&slot) || slot.state == InvocationState::Failed {
            tracing::warn!(
                generation = self.generation,
                current = slot.generation,
                state = ?slot.state,
                "stray sent callback ignored"
            );
            return;
        }
        let completes = match shared.kind {
            CompletionKind::Request(mode) => !mode.expects_reply(),
            CompletionKind::Batch => true,
        };
        if completes {
            slot.detach_remote();
            if slot.state == InvocationState::InProgress {
                slot.state = InvocationState::Ok;
            }
        }
        slot.sent = true;
        shared.cond.notify_all();
    }

    /// 报告发送或传输失败。
    ///
    /// `sent` 为处理器观察到的“字节是否已写出”，决定重试策略能否安全重放。
    pub fn finished_with_error(
        &self,
        error: InvocationError,
        sent: bool,
    ) -> Result<(), CompletionRejected> {
        let shared = &*self.shared;
        let mut slot = shared.slot.lock();
        if !self.is_current(&slot) {
            tracing::warn!(generation = self.generation, current = slot.generation, code = error.code(), "failure callback from a previous attempt rejected");
            return Err(CompletionRejected { state: slot.state });
        }
        if shared.kind != CompletionKind::Batch && slot.state.is_terminal() {
            tracing::warn!(state = ?slot.state, code = error.code(), "late failure callback rejected");
            return Err(CompletionRejected { state: slot.state });
        }
        if let Some(mut remote) = slot.remote.take() {
            remote.failed(error.code());
            remote.detach();
        }
        slot.exception = Some(error);
        slot.sent = sent;
        slot.state = InvocationState::Failed;
        shared.cond.notify_all();
        Ok(())
    }

    /// 报告收到应答并就地解组。
    ///
    /// 仅对双向请求有效。解组失败时编组错误成为载荷，状态为 `LocalException`；
    /// 任何情况下状态都在载荷写入之后才推进。
    pub fn finished_with_reply(&self, mut reply: ReplyBuffer) -> Result<(), CompletionRejected> {
        let shared = &*self.shared;
        let mut slot = shared.slot.lock();
        if !self.is_current(&slot) {
            tracing::warn!(generation = self.generation, current = slot.generation, "reply callback from a previous attempt rejected");
            return Err(CompletionRejected { state: slot.state });
        }
        if !matches!(shared.kind, CompletionKind::Request(InvocationMode::Twoway))
            || slot.state.is_terminal()
        {
            tracing::warn!(state = ?slot.state, "unexpected reply callback rejected");
            return Err(CompletionRejected { state: slot.state });
        }
        if let Some(mut remote) = slot.remote.take() {
            remote.reply(reply.len());
            remote.detach();
        }
        let state = match decode_reply(&mut reply) {
            Ok(ReplyOutcome::Ok) => {
                slot.reply = Some(reply);
                InvocationState::Ok
            }
            Ok(ReplyOutcome::UserException) => {
                shared.observer.on_user_exception();
                slot.reply = Some(reply);
                InvocationState::UserException
            }
            Ok(ReplyOutcome::LocalException(error)) | Err(error) => {
                slot.exception = Some(error);
                InvocationState::LocalException
            }
        };
        slot.state = state;
        shared.cond.notify_all();
        Ok(())
    }

    /// 两阶段等待。
    ///
    /// 1. 在截止时间内等待“已结算”：请求为 `Failed` 或（终态且已发送），批量为已发送或有异常；
    /// 2. 若截止时间先到，释放锁后调用 `on_timeout`（通常为 `request_timed_out`），
    ///    再无限期等待异常载荷或已结算状态出现。
    ///
    /// 返回时监视器中一定存在权威结果。
    pub fn await_outcome(&self, deadline: Deadline, on_timeout: impl FnOnce()) -> WaitStatus {
        let shared = &*self.shared;
        let mut slot = shared.slot.lock();
        let mut expired = false;
        while !shared.is_settled(&slot) {
            match deadline.instant() {
                Some(instant) => {
                    if shared.cond.wait_until(&mut slot, instant).timed_out()
                        && !shared.is_settled(&slot)
                    {
                        expired = true;
                        break;
                    }
                }
                None => shared.cond.wait(&mut slot),
            }
        }
        if !expired {
            return WaitStatus::Completed;
        }
        drop(slot);

        on_timeout();

        let mut slot = shared.slot.lock();
        while slot.exception.is_none() && !shared.is_settled(&slot) {
            shared.cond.wait(&mut slot);
        }
        WaitStatus::TimedOut
    }

    /// 开始新一次尝试：推进代号，清空载荷与已发送标记，进入 `InProgress`。
    ///
    /// 返回携带新代号的句柄，交给处理器用于回调；此前发出的句柄从此失效。
    pub(crate) fn begin_attempt(&self) -> Completion {
        let mut slot = self.shared.slot.lock();
        slot.detach_remote();
        slot.generation = slot.generation.wrapping_add(1);
        slot.exception = None;
        slot.reply = None;
        slot.sent = false;
        slot.state = InvocationState::InProgress;
        Completion {
            shared: Arc::clone(&self.shared),
            generation: slot.generation,
        }
    }

    /// 批量条目入队或同步完成时直接推进到 `Ok`。
    pub(crate) fn complete_locally(&self) {
        let mut slot = self.shared.slot.lock();
        slot.detach_remote();
        slot.sent = true;
        slot.state = InvocationState::Ok;
        self.shared.cond.notify_all();
    }

    /// 调用循环放弃时强制终态；已处于终态则保持原样。
    pub(crate) fn fail_locally(&self, error: InvocationError) {
        let mut slot = self.shared.slot.lock();
        if !slot.state.is_terminal() {
            slot.detach_remote();
            slot.exception = Some(error);
            slot.state = InvocationState::Failed;
            self.shared.cond.notify_all();
        }
    }

    /// 读取本次尝试的结论：有异常则返回异常，否则 `Ok` 为 `true`、`UserException` 为 `false`。
    pub(crate) fn attempt_result(&self) -> Result<bool, InvocationError> {
        let slot = self.shared.slot.lock();
        if let Some(error) = &slot.exception {
            return Err(error.clone());
        }
        match slot.state {
            InvocationState::Ok => Ok(true),
            InvocationState::UserException => Ok(false),
            state => Err(InvocationError::InvalidState {
                detail: format!("attempt settled in state {state:?}").into(),
            }),
        }
    }

    /// 取走应答缓冲区（仅 `Ok`/`UserException` 时存在）。
    pub(crate) fn take_reply(&self) -> Option<ReplyBuffer> {
        self.shared.slot.lock().reply.take()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.shared.slot.lock();
        f.debug_struct("Completion")
            .field("kind", &self.shared.kind)
            .field("generation", &self.generation)
            .field("state", &slot.state)
            .field("sent", &slot.sent)
            .field("exception", &slot.exception)
            .finish()
    }
}

//! 调用观察者。
//!
//! 观察者只产生副作用，不影响调用结果。[`InvocationObserver`] 面向整个逻辑调用（含重试），
//! [`RemoteObserver`] 面向单次尝试的远端往返，由请求处理器挂接到
//! [`Completion`](crate::completion::Completion) 上，并在终态回调时自动分离。

use std::sync::atomic::{AtomicU64, Ordering};

/// 逻辑调用级观察者。
///
/// 回调可能在 I/O 线程上、持有完成监视器锁时触发，实现不得回调进入同一次调用。
pub trait InvocationObserver: Send + Sync {
    /// 重试策略授予了一次重试。
    fn on_retry(&self) {}

    /// 调用以错误终止；`kind` 为稳定错误码。
    fn on_failure(&self, kind: &str) {
        let _ = kind;
    }

    /// 收到用户异常应答。
    fn on_user_exception(&self) {}
}

/// 单次远端往返观察者。
pub trait RemoteObserver: Send {
    /// 收到应答，`size` 为应答负载字节数。
    fn reply(&mut self, size: usize) {
        let _ = size;
    }

    /// 本次往返失败。
    fn failed(&mut self, kind: &str) {
        let _ = kind;
    }

    /// 往返结束，观察者被释放。
    fn detach(self: Box<Self>) {}
}

/// 空观察者。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl InvocationObserver for NoopObserver {}

/// 计数观察者：累计重试、失败与用户异常次数。
#[derive(Debug, Default)]
pub struct CountingObserver {
    retries: AtomicU64,
    failures: AtomicU64,
    user_exceptions: AtomicU64,
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取累计重试次数。
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Acquire)
    }

    /// 获取累计失败次数。
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    /// 获取累计用户异常次数。
    pub fn user_exceptions(&self) -> u64 {
        self.user_exceptions.load(Ordering::Acquire)
    }
}

impl InvocationObserver for CountingObserver {
    fn on_retry(&self) {
        self.retries.fetch_add(1, Ordering::AcqRel);
    }

    fn on_failure(&self, _kind: &str) {
        self.failures.fetch_add(1, Ordering::AcqRel);
    }

    fn on_user_exception(&self) {
        self.user_exceptions.fetch_add(1, Ordering::AcqRel);
    }
}

//! 重试决策。
//!
//! # 教案式说明
//! - **意图 (Why)**：重试间隔与“异常是否可重试”的判断属于策略，调用循环只负责服从。
//!   本模块提供决策类型 [`RetryDecision`]、策略 trait [`RetryPolicy`] 与两个现成实现。
//! - **契约 (What)**：
//!   - `decide` 返回 `Ok(RetryNow | RetryAfter(d))` 表示授予重试，返回 `Err(e)` 表示终止并重抛 `e`；
//!   - `attempt` 是本次逻辑调用此前已授予的重试次数（从 0 开始）；
//!   - 请求已写出（`sent = true`）且操作不幂等时，只有对端优雅关闭才允许重放，
//!     以保证“至多一次”语义。
//! - **实现 (How)**：[`IntervalRetryPolicy`] 以间隔列表驱动：第 `n` 次重试等待 `intervals[n]`，
//!   `n` 超出列表长度即放弃。

use std::time::Duration;

use crate::error::InvocationError;
use crate::mode::OperationMode;

/// 重试策略授予的决策。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// 立即重试。
    RetryNow,
    /// 等待指定时长后重试。
    RetryAfter(Duration),
}

impl RetryDecision {
    /// 由间隔构造决策，零间隔即立即重试。
    pub fn after(interval: Duration) -> Self {
        if interval.is_zero() {
            Self::RetryNow
        } else {
            Self::RetryAfter(interval)
        }
    }

    /// 需要等待的时长。
    pub fn delay(self) -> Duration {
        match self {
            Self::RetryNow => Duration::ZERO,
            Self::RetryAfter(interval) => interval,
        }
    }
}

/// 重试策略。
pub trait RetryPolicy: Send + Sync {
    fn decide(
        &self,
        error: InvocationError,
        mode: OperationMode,
        sent: bool,
        attempt: u32,
    ) -> Result<RetryDecision, InvocationError>;
}

/// 判断错误在给定幂等性与发送状态下是否允许重放。
pub fn is_replay_safe(error: &InvocationError, mode: OperationMode, sent: bool) -> bool {
    error.category().is_retryable() && (!sent || mode.is_idempotent() || error.is_safe_after_send())
}

/// 间隔列表重试策略。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntervalRetryPolicy {
    intervals: Vec<Duration>,
}

impl IntervalRetryPolicy {
    /// 以间隔列表构造；空列表等价于不重试。
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self { intervals }
    }

    /// 获取间隔列表。
    pub fn intervals(&self) -> &[Duration] {
        &self.intervals
    }
}

impl Default for IntervalRetryPolicy {
    /// 立即重试一次。
    fn default() -> Self {
        Self::new(vec![Duration::ZERO])
    }
}

impl RetryPolicy for IntervalRetryPolicy {
    fn decide(
        &self,
        error: InvocationError,
        mode: OperationMode,
        sent: bool,
        attempt: u32,
    ) -> Result<RetryDecision, InvocationError> {
        if !is_replay_safe(&error, mode, sent) {
            return Err(error);
        }
        let Some(interval) = usize::try_from(attempt)
            .ok()
            .and_then(|index| self.intervals.get(index))
        else {
            tracing::debug!(attempt, code = error.code(), "retry budget exhausted");
            return Err(error);
        };
        Ok(RetryDecision::after(*interval))
    }
}

/// 从不重试的策略。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn decide(
        &self,
        error: InvocationError,
        _mode: OperationMode,
        _sent: bool,
        _attempt: u32,
    ) -> Result<RetryDecision, InvocationError> {
        Err(error)
    }
}

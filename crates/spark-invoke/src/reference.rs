//! 调用目标的描述与代理契约。
//!
//! # 模块目的（Why）
//! - [`Identity`] 与 [`RequestContext`] 是请求头中与目标相关的数据；
//! - [`Proxy`] 把调用引擎需要的代理能力收敛为一个对象安全的 trait：读取调用参数、
//!   获取/清除请求处理器缓存、咨询重试策略、取得观察者与隐式上下文。
//!
//! # 维护提示（How）
//! - 处理器缓存的 compare-and-clear 由代理实现负责，调用引擎只持有单次尝试内的绑定；
//! - 隐式上下文通过代理注入，不存在进程级全局查找。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::InvocationError;
use crate::handler::RequestHandler;
use crate::implicit::ImplicitContext;
use crate::mode::{InvocationMode, OperationMode};
use crate::observer::InvocationObserver;
use crate::protocol::{PROTOCOL_1_0, ProtocolVersion};
use crate::retry::RetryDecision;

/// 请求上下文：随请求写出的字符串键值对，按键有序编码。
pub type RequestContext = BTreeMap<String, String>;

/// 连续“处理器陈旧”重启的默认上限，超过后交由重试策略裁决。
pub const DEFAULT_STALE_HANDLER_LIMIT: u32 = 16;

/// 目标对象身份：名称与类别。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

impl Identity {
    /// 以名称与类别构造身份。
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

/// 调用引擎所依赖的代理能力。
///
/// # 契约说明（What）
/// - `acquire_request_handler(for_batch)`：每次尝试开始时调用，可返回缓存绑定或新建绑定；
///   返回 [`InvocationError::HandlerStale`] 视同路由陈旧；
/// - `clear_request_handler(stale)`：仅当缓存仍指向 `stale` 时清除（compare-and-clear），
///   避免覆盖其他线程已替换的新绑定；
/// - `consult_retry_policy`：返回 `Ok(RetryDecision)` 表示重试，返回 `Err` 表示终止并重抛
///   （可替换为另一个错误）；`attempt` 为本次调用此前已授予的重试次数；
/// - 其余方法均为只读查询，调用期间取值保持不变。
pub trait Proxy: Send + Sync {
    /// 调用模式。
    fn invocation_mode(&self) -> InvocationMode;

    /// 单次尝试的调用超时；`None` 表示无限等待。
    fn invocation_timeout(&self) -> Option<Duration>;

    /// 目标身份。
    fn identity(&self) -> &Identity;

    /// facet 名称，空串表示默认 facet。
    fn facet(&self) -> &str;

    /// 代理自带的请求上下文。
    fn context(&self) -> &RequestContext;

    /// 代理使用的协议版本。
    fn protocol(&self) -> ProtocolVersion {
        PROTOCOL_1_0
    }

    /// 注入的隐式上下文能力。
    fn implicit_context(&self) -> Option<&dyn ImplicitContext> {
        None
    }

    /// 调用观察者。
    fn observer(&self) -> Arc<dyn InvocationObserver>;

    /// 连续路由陈旧重启的上限。
    fn stale_handler_limit(&self) -> u32 {
        DEFAULT_STALE_HANDLER_LIMIT
    }

    fn acquire_request_handler(
        &self,
        for_batch: bool,
    ) -> Result<Arc<dyn RequestHandler>, InvocationError>;

    fn clear_request_handler(&self, stale: &Arc<dyn RequestHandler>);

    fn consult_retry_policy(
        &self,
        error: InvocationError,
        handler: Option<&Arc<dyn RequestHandler>>,
        mode: OperationMode,
        sent: bool,
        attempt: u32,
    ) -> Result<RetryDecision, InvocationError>;
}

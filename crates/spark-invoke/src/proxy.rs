//! 具体代理实现：身份、调用参数、请求处理器缓存与重试策略的组合体。
//!
//! # 设计背景（Why）
//! - [`Proxy`] trait 只描述调用引擎需要的能力；实际应用需要一个可配置的实现来承载
//!   处理器缓存、重试策略、观察者与隐式上下文；
//! - 处理器缓存的 compare-and-clear 在此实现：只有缓存仍指向陈旧处理器时才清除，
//!   并发调用已替换的新绑定不受影响。
//!
//! # 契约说明（What）
//! - [`HandlerFactory`] 在缓存为空时被调用，返回新的处理器；闭包 `Fn(bool) -> Result<..>` 自动实现该 trait；
//! - `consult_retry_policy` 先清除本次尝试的处理器缓存，再委托 [`RetryPolicy`]。
//!
//! # 风险提示（Trade-offs）
//! - 工厂在缓存锁内执行，建立连接较慢时会阻塞同一代理上的并发获取。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::InvocationConfig;
use crate::error::InvocationError;
use crate::handler::RequestHandler;
use crate::implicit::ImplicitContext;
use crate::mode::{InvocationMode, OperationMode};
use crate::observer::{InvocationObserver, NoopObserver};
use crate::reference::{DEFAULT_STALE_HANDLER_LIMIT, Identity, Proxy, RequestContext};
use crate::retry::{IntervalRetryPolicy, RetryDecision, RetryPolicy};

/// 请求处理器工厂。
pub trait HandlerFactory: Send + Sync {
    fn create(&self, for_batch: bool) -> Result<Arc<dyn RequestHandler>, InvocationError>;
}

impl<F> HandlerFactory for F
where
    F: Fn(bool) -> Result<Arc<dyn RequestHandler>, InvocationError> + Send + Sync,
{
    fn create(&self, for_batch: bool) -> Result<Arc<dyn RequestHandler>, InvocationError> {
        self(for_batch)
    }
}

/// 可配置的代理。
pub struct ProxyRef {
    identity: Identity,
    facet: String,
    mode: InvocationMode,
    invocation_timeout: Option<Duration>,
    context: RequestContext,
    factory: Arc<dyn HandlerFactory>,
    cached: Mutex<Option<Arc<dyn RequestHandler>>>,
    retry: Arc<dyn RetryPolicy>,
    implicit: Option<Arc<dyn ImplicitContext>>,
    observer: Arc<dyn InvocationObserver>,
    stale_handler_limit: u32,
}

impl ProxyRef {
    /// 以身份与处理器工厂开始构建代理。
    pub fn builder(identity: Identity, factory: Arc<dyn HandlerFactory>) -> ProxyRefBuilder {
        ProxyRefBuilder {
            identity,
            facet: String::new(),
            mode: InvocationMode::Twoway,
            invocation_timeout: None,
            context: RequestContext::new(),
            factory,
            retry: Arc::new(IntervalRetryPolicy::default()),
            implicit: None,
            observer: Arc::new(NoopObserver),
            stale_handler_limit: DEFAULT_STALE_HANDLER_LIMIT,
        }
    }

    /// 当前缓存的处理器。
    pub fn cached_handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.cached.lock().clone()
    }
}

impl fmt::Debug for ProxyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyRef")
            .field("identity", &self.identity)
            .field("facet", &self.facet)
            .field("mode", &self.mode)
            .field("invocation_timeout", &self.invocation_timeout)
            .finish_non_exhaustive()
    }
}

impl Proxy for ProxyRef {
    fn invocation_mode(&self) -> InvocationMode {
        self.mode
    }

    fn invocation_timeout(&self) -> Option<Duration> {
        self.invocation_timeout
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn facet(&self) -> &str {
        &self.facet
    }

    fn context(&self) -> &RequestContext {
        &self.context
    }

    fn implicit_context(&self) -> Option<&dyn ImplicitContext> {
        self.implicit.as_deref()
    }

    fn observer(&self) -> Arc<dyn InvocationObserver> {
        Arc::clone(&self.observer)
    }

    fn stale_handler_limit(&self) -> u32 {
        self.stale_handler_limit
    }

    fn acquire_request_handler(&self, for_batch: bool) -> Result<Arc<dyn RequestHandler>, InvocationError> {
        let mut cached = self.cached.lock();
        if let Some(handler) = cached.as_ref() {
            return Ok(Arc::clone(handler));
        }
        let handler = self.factory.create(for_batch)?;
        *cached = Some(Arc::clone(&handler));
        Ok(handler)
    }

    fn clear_request_handler(&self, stale: &Arc<dyn RequestHandler>) {
        let mut cached = self.cached.lock();
        if cached.as_ref().is_some_and(|current| Arc::ptr_eq(current, stale)) {
            *cached = None;
        }
    }

    fn consult_retry_policy(
        &self,
        error: InvocationError,
        handler: Option<&Arc<dyn RequestHandler>>,
        mode: OperationMode,
        sent: bool,
        attempt: u32,
    ) -> Result<RetryDecision, InvocationError> {
        if let Some(handler) = handler {
            self.clear_request_handler(handler);
        }
        self.retry.decide(error, mode, sent, attempt)
    }
}

/// [`ProxyRef`] 构建器。
pub struct ProxyRefBuilder {
    identity: Identity,
    facet: String,
    mode: InvocationMode,
    invocation_timeout: Option<Duration>,
    context: RequestContext,
    factory: Arc<dyn HandlerFactory>,
    retry: Arc<dyn RetryPolicy>,
    implicit: Option<Arc<dyn ImplicitContext>>,
    observer: Arc<dyn InvocationObserver>,
    stale_handler_limit: u32,
}

impl ProxyRefBuilder {
    pub fn facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = facet.into();
        self
    }

    pub fn mode(mut self, mode: InvocationMode) -> Self {
        self.mode = mode;
        self
    }

    /// 设置调用超时；零时长视为不设截止。
    pub fn invocation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invocation_timeout = timeout.filter(|timeout| !timeout.is_zero());
        self
    }

    pub fn context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn retry_policy(mut self, retry: Arc<dyn RetryPolicy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn implicit_context(mut self, implicit: Arc<dyn ImplicitContext>) -> Self {
        self.implicit = Some(implicit);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn InvocationObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn stale_handler_limit(mut self, limit: u32) -> Self {
        self.stale_handler_limit = limit;
        self
    }

    /// 应用配置：调用超时、重试间隔与陈旧上限。
    pub fn config(self, config: &InvocationConfig) -> Self {
        self.invocation_timeout(config.invocation_timeout())
            .retry_policy(Arc::new(config.retry_policy()))
            .stale_handler_limit(config.stale_handler_limit)
    }

    pub fn build(self) -> ProxyRef {
        ProxyRef {
            identity: self.identity,
            facet: self.facet,
            mode: self.mode,
            invocation_timeout: self.invocation_timeout,
            context: self.context,
            factory: self.factory,
            cached: Mutex::new(None),
            retry: self.retry,
            implicit: self.implicit,
            observer: self.observer,
            stale_handler_limit: self.stale_handler_limit,
        }
    }
}

//! 隐式上下文：随每个请求自动附带的进程级键值对。
//!
//! # 设计背景（Why）
//! - 调用方希望“设置一次，所有请求都带上”（例如租户、追踪标记），但调用引擎不做全局查找；
//! - 能力以 [`ImplicitContext`] trait 对象经代理注入，测试可以替换为任意实现。
//!
//! # 契约说明（What）
//! - `write(proxy_context, buffer)` 负责把合并后的上下文写入请求：
//!   代理上下文与隐式上下文键冲突时，以代理上下文为准。

use parking_lot::RwLock;

use crate::buffer::RequestBuffer;
use crate::error::InvocationError;
use crate::reference::RequestContext;

/// 隐式上下文能力。
pub trait ImplicitContext: Send + Sync {
    /// 将隐式上下文与代理上下文合并后写入请求。
    fn write(&self, proxy_context: &RequestContext, buffer: &mut RequestBuffer) -> Result<(), InvocationError>;
}

/// 以读写锁保护的共享隐式上下文。
#[derive(Debug, Default)]
pub struct SharedImplicitContext {
    entries: RwLock<RequestContext>,
}

impl SharedImplicitContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取全部条目的快照。
    pub fn context(&self) -> RequestContext {
        self.entries.read().clone()
    }

    /// 整体替换条目。
    pub fn set_context(&self, context: RequestContext) {
        *self.entries.write() = context;
    }

    /// 获取单个条目。
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    /// 写入单个条目，返回旧值。
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.write().insert(key.into(), value.into())
    }

    /// 删除单个条目，返回旧值。
    pub fn remove(&self, key: &str) -> Option<String> {
        self.entries.write().remove(key)
    }
}

impl ImplicitContext for SharedImplicitContext {
    fn write(&self, proxy_context: &RequestContext, buffer: &mut RequestBuffer) -> Result<(), InvocationError> {
        let entries = self.entries.read();
        if proxy_context.is_empty() {
            return buffer.write_context(&entries);
        }
        if entries.is_empty() {
            return buffer.write_context(proxy_context);
        }
        let mut merged = entries.clone();
        drop(entries);
        merged.extend(proxy_context.iter().map(|(k, v)| (k.clone(), v.clone())));
        buffer.write_context(&merged)
    }
}

#![deny(unsafe_code)]
#![doc = "spark-invoke: 客户端同步 RPC 调用引擎。"]
#![doc = ""]
#![doc = "把一次代理方法调用编组为请求，交给与传输无关的请求处理器投递，"]
#![doc = "阻塞调用线程直到应答或失败到达，再把应答解组为成功、用户异常或系统异常；"]
#![doc = "遇到瞬时失败时依重试策略重放请求。"]
//!
//! # 教案级导览
//!
//! - **组件 (What)**，自底向上：
//!   - [`buffer`]：请求写入器与应答读取器；
//!   - [`completion`]：调用状态机与跨线程完成监视器（含两阶段等待）；
//!   - [`reply`]：按状态字节分派的应答解组工厂；
//!   - [`invocation`]：单次逻辑调用与重试循环；
//!   - [`batch`]：批量刷新与共享批量缓冲区；
//!   - [`handler`]、[`reference`]、[`retry`]、[`implicit`]、[`observer`]：外部协作方的 trait 边界；
//!   - [`proxy`]、[`collocated`]、[`config`]：可直接使用的代理、进程内投递通道与 TOML 配置。
//! - **线程模型 (How)**：调用线程在 `invoke()` 内阻塞于监视器；一个或多个 I/O 线程经
//!   [`Completion`] 句柄回调 `sent()`/`finished_*()`。监视器锁内先写载荷、后推进状态。
//! - **日志 (How)**：库只通过 `tracing` 发出事件，不安装订阅者；字段统一使用
//!   `operation`、`attempt`、`code`、`interval_ms`。
//!
//! # 快速上手
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use spark_invoke::{
//!     CollocatedRequestHandler, Dispatcher, Identity, Invocation, InvocationError, OperationMode, ProxyRef,
//!     RequestHandler,
//! };
//!
//! struct Echo;
//!
//! impl Dispatcher for Echo {
//!     fn dispatch(&self, _request: bytes::Bytes) -> Result<bytes::Bytes, InvocationError> {
//!         Ok(bytes::Bytes::from_static(&[0, 6, 0, 0, 0, 1, 1]))
//!     }
//! }
//!
//! # fn main() -> Result<(), InvocationError> {
//! let handler: Arc<dyn RequestHandler> = Arc::new(CollocatedRequestHandler::new(Arc::new(Echo)));
//! let factory = move |_for_batch: bool| -> Result<Arc<dyn RequestHandler>, InvocationError> {
//!     Ok(Arc::clone(&handler))
//! };
//! let proxy = ProxyRef::builder(Identity::new("echo", ""), Arc::new(factory)).build();
//!
//! let mut invocation = Invocation::new(&proxy, "ping", OperationMode::Idempotent, None)?;
//! invocation.write_empty_params()?;
//! assert!(invocation.invoke()?);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod buffer;
pub mod collocated;
pub mod completion;
pub mod config;
pub mod error;
pub mod handler;
pub mod implicit;
pub mod invocation;
pub mod mode;
pub mod observer;
pub mod protocol;
pub mod proxy;
pub mod reference;
pub mod reply;
pub mod retry;

pub use batch::{BatchInvocation, BatchQueue};
pub use buffer::{ReplyBuffer, RequestBuffer};
pub use collocated::{CollocatedRequestHandler, Dispatcher};
pub use completion::{Completion, Deadline, InvocationState, Outcome, WaitStatus};
pub use config::{ConfigError, InvocationConfig};
pub use error::{CompletionRejected, ErrorCategory, InvocationError, RequestFailedKind, UnknownKind, codes};
pub use handler::{BatchRequest, Connection, OutgoingRequest, RequestHandler};
pub use implicit::{ImplicitContext, SharedImplicitContext};
pub use invocation::Invocation;
pub use mode::{InvocationMode, OperationMode};
pub use observer::{CountingObserver, InvocationObserver, NoopObserver, RemoteObserver};
pub use protocol::{ProtocolVersion, ReplyStatus};
pub use proxy::{HandlerFactory, ProxyRef, ProxyRefBuilder};
pub use reference::{Identity, Proxy, RequestContext};
pub use reply::{ReplyOutcome, decode_reply};
pub use retry::{IntervalRetryPolicy, NoRetry, RetryDecision, RetryPolicy};

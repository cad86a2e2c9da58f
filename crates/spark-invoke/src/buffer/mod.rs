//! 请求与应答缓冲区。
//!
//! - [`RequestBuffer`]：基于 `BytesMut` 的只追加写入器，构造期编组一次，首次 `invoke()` 时冻结为
//!   可廉价克隆的 `Bytes`，所有重试重发同一份字节；
//! - [`ReplyBuffer`]：基于 `Bytes` 的读取器，首个读取项为应答状态字节。
//!
//! 两者共享“紧凑长度”编码：小于 255 的长度写一个字节，否则写 `255` 后跟 i32。

mod reply;
mod request;

pub use reply::ReplyBuffer;
pub use request::RequestBuffer;

/// 紧凑长度编码的扩展标记。
pub(crate) const SIZE_ESCAPE: u8 = 255;

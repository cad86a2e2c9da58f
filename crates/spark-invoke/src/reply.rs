//! 应答解组：按状态字节分派的结果工厂。
//!
//! 所有字段先读入临时变量，异常值一次性按值构造；解码中途失败时返回编组错误，
//! 调用方因此永远看不到半构造的异常。

use crate::buffer::ReplyBuffer;
use crate::error::{InvocationError, RequestFailedKind, UnknownKind};
use crate::protocol::ReplyStatus;

/// 应答解组后的结论。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// 成功；结果封装留在缓冲区中由调用方读取。
    Ok,
    /// 用户异常；异常封装留在缓冲区中由调用方解码。
    UserException,
    /// 应答描述了系统异常。
    LocalException(InvocationError),
}

/// 从状态字节开始解组应答。
///
/// # 契约说明（What）
/// - **前置条件**：`reply` 定位在状态字节；
/// - **后置条件**：`Ok`/`UserException` 时缓冲区定位在结果/异常封装开头；
/// - 状态字节缺失或字段截断返回 `Err(Marshal)`，未知状态字节返回
///   `LocalException(UnknownReplyStatus)`。
pub fn decode_reply(reply: &mut ReplyBuffer) -> Result<ReplyOutcome, InvocationError> {
    let status = reply.read_byte()?;
    let Some(status) = ReplyStatus::from_byte(status) else {
        return Ok(ReplyOutcome::LocalException(
            InvocationError::UnknownReplyStatus { status },
        ));
    };
    let outcome = match status {
        ReplyStatus::Ok => ReplyOutcome::Ok,
        ReplyStatus::UserException => ReplyOutcome::UserException,
        ReplyStatus::ObjectNotExist => {
            ReplyOutcome::LocalException(read_request_failed(reply, RequestFailedKind::ObjectNotExist)?)
        }
        ReplyStatus::FacetNotExist => {
            ReplyOutcome::LocalException(read_request_failed(reply, RequestFailedKind::FacetNotExist)?)
        }
        ReplyStatus::OperationNotExist => ReplyOutcome::LocalException(read_request_failed(
            reply,
            RequestFailedKind::OperationNotExist,
        )?),
        ReplyStatus::UnknownLocalException => {
            ReplyOutcome::LocalException(read_unknown(reply, UnknownKind::UnknownLocal)?)
        }
        ReplyStatus::UnknownUserException => {
            ReplyOutcome::LocalException(read_unknown(reply, UnknownKind::UnknownUser)?)
        }
        ReplyStatus::UnknownException => {
            ReplyOutcome::LocalException(read_unknown(reply, UnknownKind::Unknown)?)
        }
    };
    Ok(outcome)
}

fn read_request_failed(
    reply: &mut ReplyBuffer,
    kind: RequestFailedKind,
) -> Result<InvocationError, InvocationError> {
    let id = reply.read_identity()?;
    // facet 路径按序列编码，但最多只允许一个元素。
    let mut facet_path = reply.read_string_seq()?;
    if facet_path.len() > 1 {
        return Err(InvocationError::marshal("facet path has more than one element"));
    }
    let facet = facet_path.pop().unwrap_or_default();
    let operation = reply.read_string()?;
    Ok(InvocationError::RequestFailed {
        kind,
        id,
        facet,
        operation,
    })
}

fn read_unknown(reply: &mut ReplyBuffer, kind: UnknownKind) -> Result<InvocationError, InvocationError> {
    let unknown = reply.read_string()?;
    Ok(InvocationError::Unknown { kind, unknown })
}

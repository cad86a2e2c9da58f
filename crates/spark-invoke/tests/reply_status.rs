//! 应答状态集成测试
//!
//! - **核心目标 (Why)**：确认八种应答状态经完成监视器解组后，以正确的终态与异常载荷呈现给调用方；
//!   应答层失败不会被默认策略重放。
//! - **结构说明 (How)**：脚本化处理器同步送达预先编码的应答；进程内路径使用真实的
//!   `CollocatedRequestHandler` 与测试分发器。

mod support;

use std::sync::Arc;

use bytes::Bytes;
use spark_invoke::{
    CollocatedRequestHandler, CountingObserver, Dispatcher, Identity, Invocation, InvocationError, InvocationMode,
    InvocationState, NoRetry, OperationMode, Outcome, ProxyRef, ReplyStatus, RequestFailedKind, RequestHandler,
    UnknownKind,
};
use support::{
    Harness, Step, parse_request, reply_ok, reply_request_failed, reply_unknown, reply_user_exception,
};

fn hello() -> Identity {
    Identity::new("hello", "demo")
}

fn invoke_with_reply(reply: Bytes) -> (Arc<Harness>, Result<bool, InvocationError>, InvocationState) {
    let harness = Harness::new([Step::Reply(reply)]);
    let proxy = harness.proxy().build();
    let mut invocation = Invocation::new(&proxy, "sayHello", OperationMode::Idempotent, None).expect("构造调用");
    invocation.write_empty_params().expect("空参数");
    let result = invocation.invoke();
    let state = invocation.state();
    (harness, result, state)
}

#[test]
fn ok_reply_has_no_exception() {
    let (_, result, state) = invoke_with_reply(reply_ok(1));
    assert_eq!(result, Ok(true));
    assert_eq!(state, InvocationState::Ok);
}

#[test]
fn not_exist_statuses_carry_identity_facet_and_operation() {
    let cases = [
        (ReplyStatus::ObjectNotExist, RequestFailedKind::ObjectNotExist),
        (ReplyStatus::FacetNotExist, RequestFailedKind::FacetNotExist),
        (ReplyStatus::OperationNotExist, RequestFailedKind::OperationNotExist),
    ];
    for (status, kind) in cases {
        for facet in [&[][..], &["admin"][..]] {
            let (harness, result, state) =
                invoke_with_reply(reply_request_failed(status, &hello(), facet, "sayHello"));
            let expected = InvocationError::RequestFailed {
                kind,
                id: hello(),
                facet: facet.first().map(|facet| (*facet).to_owned()).unwrap_or_default(),
                operation: "sayHello".to_owned(),
            };
            assert_eq!(result, Err(expected), "状态 {status:?} facet {facet:?}");
            assert_eq!(state, InvocationState::LocalException);
            assert_eq!(harness.sends(), 1, "应答层失败不应被默认策略重放");
        }
    }
}

#[test]
fn facet_path_with_two_elements_is_a_marshal_failure() {
    let reply = reply_request_failed(ReplyStatus::FacetNotExist, &hello(), &["a", "b"], "sayHello");
    let (_, result, state) = invoke_with_reply(reply);
    assert!(matches!(result, Err(InvocationError::Marshal { .. })), "得到 {result:?}");
    assert_eq!(state, InvocationState::LocalException);
}

#[test]
fn unknown_statuses_carry_the_message() {
    let cases = [
        (ReplyStatus::UnknownLocalException, UnknownKind::UnknownLocal),
        (ReplyStatus::UnknownUserException, UnknownKind::UnknownUser),
        (ReplyStatus::UnknownException, UnknownKind::Unknown),
    ];
    for (status, kind) in cases {
        let (_, result, state) = invoke_with_reply(reply_unknown(status, "disk on fire"));
        assert_eq!(
            result,
            Err(InvocationError::Unknown {
                kind,
                unknown: "disk on fire".to_owned(),
            })
        );
        assert_eq!(state, InvocationState::LocalException);
    }
}

#[test]
fn out_of_range_status_byte_is_reported() {
    let (_, result, state) = invoke_with_reply(Bytes::from_static(&[9]));
    assert_eq!(result, Err(InvocationError::UnknownReplyStatus { status: 9 }));
    assert_eq!(state, InvocationState::LocalException);
}

#[test]
fn truncated_reply_is_a_marshal_failure() {
    let (_, result, state) = invoke_with_reply(Bytes::from_static(&const { [ReplyStatus::ObjectNotExist.as_byte(), 5] }));
    assert!(matches!(result, Err(InvocationError::Marshal { .. })));
    assert_eq!(state, InvocationState::LocalException);
}

#[test]
fn user_exception_is_decoded_by_the_caller() {
    let harness = Harness::new([Step::Reply(reply_user_exception("quota exceeded"))]);
    let observer = Arc::new(CountingObserver::new());
    let proxy = harness.proxy().observer(observer.clone()).build();

    let mut invocation = Invocation::new(&proxy, "withdraw", OperationMode::Normal, None).expect("构造调用");
    invocation.write_empty_params().expect("空参数");
    assert_eq!(invocation.invoke(), Ok(false));
    assert_eq!(invocation.state(), InvocationState::UserException);
    assert_eq!(invocation.outcome(), Some(Outcome::UserException));

    let message = invocation
        .read_user_exception(|reply| reply.read_string())
        .expect("解码用户异常");
    assert_eq!(message, "quota exceeded");
    assert_eq!(observer.user_exceptions(), 1);
    assert_eq!(observer.failures(), 0);
}

#[test]
fn reading_a_user_exception_after_success_is_rejected() {
    let harness = Harness::new([Step::Reply(reply_ok(0))]);
    let proxy = harness.proxy().build();
    let mut invocation = Invocation::new(&proxy, "sayHello", OperationMode::Normal, None).expect("构造调用");
    invocation.write_empty_params().expect("空参数");
    invocation.invoke().expect("调用成功");

    assert!(matches!(
        invocation.read_user_exception(|reply| reply.read_string()),
        Err(InvocationError::InvalidState { .. })
    ));
}

#[test]
fn transport_failure_is_reported_to_the_remote_observer() {
    let harness = Harness::new([Step::lost(false)]);
    let proxy = harness.proxy().retry_policy(Arc::new(NoRetry)).build();
    let mut invocation = Invocation::new(&proxy, "sayHello", OperationMode::Normal, None).expect("构造调用");
    invocation.write_empty_params().expect("空参数");

    assert_eq!(invocation.invoke(), Err(InvocationError::connection_lost("peer reset")));
    assert_eq!(invocation.outcome(), Some(Outcome::Failed(InvocationError::connection_lost("peer reset"))));
    assert_eq!(*harness.remote.failures.lock(), vec!["transport.connection_lost".to_owned()]);
    assert!(harness.remote.replies.lock().is_empty());
}

/// 只认识 `ping` 的进程内对象，`fail` 触发分发错误，其余操作返回“操作不存在”。
struct PingServant {
    seen: parking_lot::Mutex<Vec<String>>,
}

impl Dispatcher for PingServant {
    fn dispatch(&self, request: Bytes) -> Result<Bytes, InvocationError> {
        let parsed = parse_request(&request, 0);
        self.seen.lock().push(parsed.operation.clone());
        match parsed.operation.as_str() {
            "ping" => Ok(reply_ok(7)),
            "fail" => Err(InvocationError::RuntimeShutdown),
            other => Ok(reply_request_failed(
                ReplyStatus::OperationNotExist,
                &parsed.identity,
                &[],
                other,
            )),
        }
    }
}

fn collocated_proxy(servant: Arc<PingServant>, mode: InvocationMode) -> ProxyRef {
    let handler: Arc<dyn RequestHandler> = Arc::new(CollocatedRequestHandler::new(servant));
    let factory = move |_for_batch: bool| -> Result<Arc<dyn RequestHandler>, InvocationError> {
        Ok(Arc::clone(&handler))
    };
    ProxyRef::builder(hello(), Arc::new(factory)).mode(mode).build()
}

#[test]
fn collocated_dispatch_maps_reply_statuses() {
    let servant = Arc::new(PingServant {
        seen: parking_lot::Mutex::new(Vec::new()),
    });
    let proxy = collocated_proxy(Arc::clone(&servant), InvocationMode::Twoway);

    let mut ping = Invocation::new(&proxy, "ping", OperationMode::Idempotent, None).expect("构造调用");
    ping.write_empty_params().expect("空参数");
    assert_eq!(ping.invoke(), Ok(true));
    let reply = ping.reply().expect("结果封装");
    reply.start_encapsulation().expect("打开结果封装");
    assert_eq!(reply.read_int().expect("读取结果"), 7);

    let mut missing = Invocation::new(&proxy, "pong", OperationMode::Normal, None).expect("构造调用");
    missing.write_empty_params().expect("空参数");
    assert_eq!(
        missing.invoke(),
        Err(InvocationError::RequestFailed {
            kind: RequestFailedKind::OperationNotExist,
            id: hello(),
            facet: String::new(),
            operation: "pong".to_owned(),
        })
    );

    let mut failing = Invocation::new(&proxy, "fail", OperationMode::Normal, None).expect("构造调用");
    failing.write_empty_params().expect("空参数");
    assert_eq!(failing.invoke(), Err(InvocationError::RuntimeShutdown));
    assert_eq!(failing.state(), InvocationState::Failed);

    assert_eq!(*servant.seen.lock(), vec!["ping", "pong", "fail"]);
}

#[test]
fn collocated_oneway_ignores_the_reply() {
    let servant = Arc::new(PingServant {
        seen: parking_lot::Mutex::new(Vec::new()),
    });
    let proxy = collocated_proxy(Arc::clone(&servant), InvocationMode::Oneway);

    let mut invocation = Invocation::new(&proxy, "pong", OperationMode::Normal, None).expect("构造调用");
    invocation.write_empty_params().expect("空参数");
    assert_eq!(invocation.invoke(), Ok(true), "单向调用不关心应答内容");
    assert_eq!(invocation.state(), InvocationState::Ok);
    assert_eq!(servant.seen.lock().len(), 1);
}

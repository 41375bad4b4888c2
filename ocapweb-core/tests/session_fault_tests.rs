// Error propagation and session faulting: classification errors stay
// local, transport failures are terminal, cancellation crosses in-band,
// and the send-error hook scrubs application errors.

use async_trait::async_trait;
use ocapweb_core::{
    structurally_equal, AbortController, ErrorCode, ErrorValue, RpcError, RpcSession, RpcTarget,
    SessionOptions, TaggedCodec, Value,
};
use ocapweb_transport::duplex_pair;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct Service;

#[async_trait]
impl RpcTarget for Service {
    async fn call(&self, method: &str, mut args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            "echo" => Ok(if args.is_empty() {
                Value::Undefined
            } else {
                args.swap_remove(0)
            }),

            "fail" => Err(RpcError::internal("secret backend detail")),

            // Errors returned as values: one scrubbable, one marked raw.
            "scrubbable" => Ok(Value::Error(ErrorValue::new("Error", "secret detail"))),
            "verbatim" => Ok(Value::Error(
                ErrorValue::new("Error", "secret detail").into_raw(),
            )),

            // Runs until the passed abort signal fires.
            "slow" => {
                let signal = match args.first() {
                    Some(Value::Stub(stub)) => stub.clone(),
                    _ => return Err(RpcError::bad_request("slow takes an abort signal")),
                };
                let aborted = signal.call("aborted", vec![])?;
                tokio::select! {
                    reason = aborted.pull() => {
                        let reason = reason?;
                        Ok(Value::String(format!(
                            "canceled: {}",
                            reason.as_str().unwrap_or("unknown")
                        )))
                    }
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {
                        Ok(Value::String("finished".to_string()))
                    }
                }
            }

            "hang" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            }

            other => Err(RpcError::not_found(format!("no method {:?}", other))),
        }
    }

    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        Err(RpcError::not_found(format!("no property {:?}", property)))
    }
}

#[derive(Debug)]
struct NotMarshalable;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_unsupported_value_rejects_locally() {
    init_tracing();
    let (ta, tb) = duplex_pair();
    let (client, main) = RpcSession::connect(Arc::new(ta), SessionOptions::default());
    let (server, _peer) = RpcSession::connect(Arc::new(tb), SessionOptions::with_main(Service));

    let err = main
        .call("echo", vec![Value::Opaque(Arc::new(NotMarshalable))])
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::BadRequest);

    // Nothing was sent and the session is unharmed.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.terminal_error().is_none());
    assert!(server.exports_at_rest());

    let out = main
        .call("echo", vec![Value::from("still works")])
        .unwrap()
        .pull()
        .await
        .unwrap();
    assert!(structurally_equal(&out, &Value::from("still works")));
}

#[tokio::test]
async fn test_transport_drop_faults_the_session() {
    init_tracing();
    let (ta, tb) = duplex_pair();
    let sever = ta.sever_handle();
    let (client, main) = RpcSession::connect(Arc::new(ta), SessionOptions::default());
    let (_server, _peer) = RpcSession::connect(Arc::new(tb), SessionOptions::with_main(Service));

    let in_flight = main.call("hang", vec![]).unwrap();
    let pull = tokio::spawn(async move { in_flight.pull().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    sever.sever();

    let err = pull.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::Aborted);

    // Every subsequent call fails with the same terminal error.
    let terminal = client.terminal_error().expect("session is faulted");
    assert_eq!(terminal, err);

    let later = main.call("echo", vec![Value::Null]).unwrap_err();
    assert_eq!(later, terminal);
    assert_eq!(client.state(), ocapweb_core::SessionState::Faulted);
}

#[tokio::test]
async fn test_peer_disconnect_faults_the_session() {
    let (ta, tb) = duplex_pair();
    let (client, main) = RpcSession::connect(Arc::new(ta), SessionOptions::default());
    let (server, _peer) = RpcSession::connect(Arc::new(tb), SessionOptions::with_main(Service));

    client.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(
        server.state(),
        ocapweb_core::SessionState::Faulted
    ));
    assert!(server.terminal_error().is_some());
    drop(main);
}

#[tokio::test]
async fn test_abort_signal_cancels_peer_method() {
    let (ta, tb) = duplex_pair();
    let (_client, main) = RpcSession::connect(Arc::new(ta), SessionOptions::default());
    let (_server, _peer) = RpcSession::connect(Arc::new(tb), SessionOptions::with_main(Service));

    let controller = AbortController::new();
    let pending = main.call("slow", vec![controller.signal()]).unwrap();
    let pull = tokio::spawn(async move { pending.pull().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.abort("stop now");

    let out = tokio::time::timeout(Duration::from_secs(5), pull)
        .await
        .expect("cancellation observed within bounded turns")
        .unwrap()
        .unwrap();
    assert!(structurally_equal(
        &out,
        &Value::from("canceled: stop now")
    ));
}

#[tokio::test]
async fn test_on_send_error_scrubs_application_errors() {
    let (ta, tb) = duplex_pair();
    let (_client, main) = RpcSession::connect(Arc::new(ta), SessionOptions::default());

    let options = SessionOptions {
        main: Some(Arc::new(Service)),
        codec: Arc::new(TaggedCodec),
        on_send_error: Some(Arc::new(|mut error: ErrorValue| {
            error.message = "redacted".to_string();
            error.stack = None;
            error
        })),
    };
    let (_server, _peer) = RpcSession::connect(Arc::new(tb), options);

    let err = main.call("fail", vec![]).unwrap().pull().await.unwrap_err();
    assert_eq!(err.message, "redacted");
    assert_eq!(err.code, ErrorCode::Internal);
}

#[tokio::test]
async fn test_raw_errors_bypass_the_scrub_hook() {
    let (ta, tb) = duplex_pair();
    let (_client, main) = RpcSession::connect(Arc::new(ta), SessionOptions::default());

    let options = SessionOptions {
        main: Some(Arc::new(Service)),
        codec: Arc::new(TaggedCodec),
        on_send_error: Some(Arc::new(|mut error: ErrorValue| {
            error.message = "redacted".to_string();
            error
        })),
    };
    let (_server, _peer) = RpcSession::connect(Arc::new(tb), options);

    // An ordinary error value in a resolution is rewritten on its way out...
    let scrubbed = main
        .call("scrubbable", vec![])
        .unwrap()
        .pull()
        .await
        .unwrap();
    match &scrubbed {
        Value::Error(e) => assert_eq!(e.message, "redacted"),
        other => panic!("expected error value, got {:?}", other),
    }

    // ...while a raw-marked one passes through verbatim.
    let raw = main.call("verbatim", vec![]).unwrap().pull().await.unwrap();
    match &raw {
        Value::Error(e) => assert_eq!(e.message, "secret detail"),
        other => panic!("expected error value, got {:?}", other),
    }
}

#[tokio::test]
async fn test_draining_session_refuses_new_calls() {
    let (ta, tb) = duplex_pair();
    let (client, main) = RpcSession::connect(Arc::new(ta), SessionOptions::default());
    let (_server, _peer) = RpcSession::connect(Arc::new(tb), SessionOptions::with_main(Service));

    client.shutdown();
    assert_eq!(client.state(), ocapweb_core::SessionState::Draining);

    let err = main.call("echo", vec![Value::Null]).unwrap_err();
    assert_eq!(err.code, ErrorCode::Canceled);
}

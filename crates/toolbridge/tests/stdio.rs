//! End-to-end tests for stdio connections, driven by `sh` endpoints.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use toolbridge::{BridgeConfig, BridgeError, BridgeSupervisor, ErrorKind, Frame, TransportKind};

/// Extracts the request id and operation of `$line` into `$id` and `$op`.
const PARSE: &str = r#"
parse() {
  id=$(printf '%s\n' "$1" | sed -n 's/^{"id":"\([^"]*\)".*/\1/p')
  op=$(printf '%s\n' "$1" | sed -n 's/.*"operation":"\([^"]*\)".*/\1/p')
}
"#;

fn script(body: &str) -> Value {
    json!({"command": "sh", "args": ["-c", format!("{PARSE}{body}")]})
}

fn pong_loop() -> &'static str {
    r#"while IFS= read -r line; do
  parse "$line"
  printf '{"id":"%s","result":{"pong":true}}\n' "$id"
done"#
}

fn supervisor() -> Arc<BridgeSupervisor> {
    BridgeSupervisor::new(
        BridgeConfig::builtin()
            .with_kill_grace(Duration::from_millis(200))
            .with_call_timeout(Duration::from_secs(5)),
    )
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}

#[tokio::test]
async fn ping_round_trip_then_disconnect() -> anyhow::Result<()> {
    let bridge = supervisor();
    let id = bridge.connect("stdio", &script(pong_loop())).await?;

    let result = bridge.invoke(&id, "ping", json!({}), None).await?;
    assert_eq!(result, json!({"pong": true}));

    bridge.disconnect(&id).await?;
    let err = bridge.disconnect(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionNotFound);
    assert!(bridge.is_empty());
    Ok(())
}

#[tokio::test]
async fn concurrent_calls_resolve_independently_of_response_order() -> anyhow::Result<()> {
    let bridge = supervisor();
    let reversed = r#"IFS= read -r first
IFS= read -r second
for line in "$second" "$first"; do
  parse "$line"
  printf '{"id":"%s","result":"%s"}\n' "$id" "$op"
done
cat > /dev/null"#;
    let id = bridge.connect("stdio", &script(reversed)).await?;

    let (alpha, beta) = tokio::join!(
        bridge.invoke(&id, "alpha", json!({}), None),
        bridge.invoke(&id, "beta", json!({}), None),
    );

    assert_eq!(alpha?, json!("alpha"));
    assert_eq!(beta?, json!("beta"));
    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn timeout_leaves_connection_usable() -> anyhow::Result<()> {
    let bridge = supervisor();
    let ignores_first = format!("IFS= read -r ignored\n{}", pong_loop());
    let id = bridge.connect("stdio", &script(&ignores_first)).await?;

    let started = tokio::time::Instant::now();
    let err = bridge
        .invoke(&id, "ping", json!({}), Some(Duration::from_millis(200)))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.is_retryable());
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(bridge.contains(&id));

    let result = bridge.invoke(&id, "ping", json!({}), None).await?;
    assert_eq!(result, json!({"pong": true}));
    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn timeout_covers_write_to_endpoint_that_never_reads() -> anyhow::Result<()> {
    let bridge = supervisor();
    let id = bridge
        .connect("stdio", &json!({"command": "sh", "args": ["-c", "sleep 30"]}))
        .await?;
    // Larger than any pipe buffer, so the write itself stalls.
    let blob = "x".repeat(1024 * 1024);

    let first = tokio::time::timeout(
        Duration::from_secs(3),
        bridge.invoke(&id, "ping", json!({"blob": blob}), Some(Duration::from_millis(200))),
    )
    .await?;
    assert_eq!(first.unwrap_err().kind(), ErrorKind::Timeout);

    // The stalled writer must not hold up later calls past their own timeout.
    let second = tokio::time::timeout(
        Duration::from_secs(3),
        bridge.invoke(&id, "ping", json!({}), Some(Duration::from_millis(200))),
    )
    .await?;
    assert_eq!(second.unwrap_err().kind(), ErrorKind::Timeout);
    assert!(bridge.contains(&id));

    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unknown_and_duplicate_responses_are_discarded() -> anyhow::Result<()> {
    let bridge = supervisor();
    let noisy = r#"while IFS= read -r line; do
  parse "$line"
  printf '{"id":"999","result":"stray"}\n'
  printf '{"id":"%s","result":"%s"}\n' "$id" "$op"
  printf '{"id":"%s","result":"duplicate"}\n' "$id"
done"#;
    let id = bridge.connect("stdio", &script(noisy)).await?;

    assert_eq!(bridge.invoke(&id, "first", json!({}), None).await?, json!("first"));
    assert_eq!(bridge.invoke(&id, "second", json!({}), None).await?, json!("second"));
    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn remote_error_is_surfaced_with_payload() -> anyhow::Result<()> {
    let bridge = supervisor();
    let failing = r#"while IFS= read -r line; do
  parse "$line"
  printf '{"id":"%s","error":{"code":-32601,"message":"unknown operation %s"}}\n' "$id" "$op"
done"#;
    let id = bridge.connect("stdio", &script(failing)).await?;

    let err = bridge
        .invoke(&id, "teleport", json!({}), None)
        .await
        .unwrap_err();

    match &err {
        BridgeError::RemoteOperationError {
            operation,
            message,
            code,
            ..
        } => {
            assert_eq!(operation, "teleport");
            assert_eq!(message, "unknown operation teleport");
            assert_eq!(*code, Some(-32601));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(bridge.contains(&id));
    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn process_exit_fails_call_and_evicts_connection() -> anyhow::Result<()> {
    let bridge = supervisor();
    let dies = "IFS= read -r line; echo 'panic: out of cheese' >&2; exit 1";
    let id = bridge.connect("stdio", &script(dies)).await?;

    let err = bridge
        .invoke(&id, "ping", json!({}), None)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TransportError);
    assert!(err.to_string().contains("out of cheese"), "{err}");
    eventually(|| !bridge.contains(&id)).await;
    Ok(())
}

#[tokio::test]
async fn spawn_failure_is_connection_failed() {
    let bridge = supervisor();

    let err = bridge
        .connect("stdio", &json!({"command": "/nonexistent/toolbridge-endpoint"}))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    assert!(bridge.is_empty());
}

#[tokio::test]
async fn each_call_reaches_the_process_exactly_once() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let log = dir.path().join("requests.log");
    let bridge = supervisor();
    let logging = format!(
        r#"while IFS= read -r line; do
  printf '%s\n' "$line" >> "$REQUEST_LOG"
  parse "$line"
  printf '{{"id":"%s","result":null}}\n' "$id"
done"#
    );
    let mut params = script(&logging);
    params["env"] = json!({"REQUEST_LOG": log.to_string_lossy()});
    let id = bridge.connect("stdio", &params).await?;

    for n in 0..3 {
        let result = bridge.invoke(&id, "record", json!({"n": n}), None).await?;
        assert_eq!(result, Value::Null);
    }

    let lines: Vec<Value> = std::fs::read_to_string(&log)?
        .lines()
        .map(serde_json::from_str::<Value>)
        .collect::<Result<_, _>>()?;
    assert_eq!(lines.len(), 3);
    let ids: Vec<&str> = lines.iter().filter_map(|l| l["id"].as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(lines[2]["arguments"], json!({"n": 2}));
    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn notifications_reach_message_handler() -> anyhow::Result<()> {
    let bridge = supervisor();
    let (tx, mut rx) = mpsc::unbounded_channel();
    bridge.set_message_handler(move |msg| {
        let _ = tx.send(msg);
    });
    let chatty = r#"while IFS= read -r line; do
  parse "$line"
  printf '{"method":"progress","params":{"op":"%s"}}\n' "$op"
  printf '{"id":"%s","result":"done"}\n' "$id"
done"#;
    let id = bridge.connect("stdio", &script(chatty)).await?;

    bridge.invoke(&id, "index", json!({}), None).await?;
    let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .expect("handler channel closed");

    assert_eq!(message.connection_id, id);
    assert_eq!(message.kind, TransportKind::Stdio);
    assert_eq!(
        message.payload,
        Frame::Json(json!({"method": "progress", "params": {"op": "index"}}))
    );
    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn idle_connection_is_swept() -> anyhow::Result<()> {
    let bridge = supervisor();
    let idle = bridge.connect("stdio", &script(pong_loop())).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let busy = bridge.connect("stdio", &script(pong_loop())).await?;

    let evicted = bridge.sweep_stale(Duration::from_millis(50)).await;

    assert_eq!(evicted, vec![idle]);
    assert!(!bridge.contains(&idle));
    assert!(bridge.contains(&busy));
    let err = bridge.invoke(&idle, "ping", json!({}), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionNotFound);
    bridge.shutdown().await;
    Ok(())
}

// Integration tests for the RPC client over in-memory stream pairs.
//
// A scripted "worker" on the far side of a tokio duplex pipe answers (or
// deliberately withholds) responses, exercising request correlation,
// timeouts, late-response discard, and stream-fatal framing.

use anyhow::Result;
use scribe_core::error::CoreError;
use scribe_core::protocol::MAX_FRAME_BYTES;
use scribe_core::rpc::RpcClient;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

type WorkerReader = tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>;
type WorkerWriter = WriteHalf<DuplexStream>;

fn connect() -> (Arc<RpcClient>, WorkerReader, WorkerWriter) {
    let (client_io, worker_io) = tokio::io::duplex(256 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let client = RpcClient::new(client_read, client_write);

    let (worker_read, worker_write) = tokio::io::split(worker_io);
    (client, BufReader::new(worker_read).lines(), worker_write)
}

async fn next_request(reader: &mut WorkerReader) -> Value {
    let line = reader
        .next_line()
        .await
        .expect("read request")
        .expect("stream open");
    serde_json::from_str(&line).expect("request is JSON")
}

fn request_id(request: &Value) -> u64 {
    request["id"].as_u64().expect("request carries an id")
}

async fn respond_ok(writer: &mut WorkerWriter, id: u64, result: Value) {
    let frame = json!({"v": 1, "id": id, "result": result});
    writer
        .write_all(format!("{}\n", frame).as_bytes())
        .await
        .expect("write response");
}

#[tokio::test]
async fn test_responses_are_correlated_by_request_id_even_out_of_order() -> Result<()> {
    let (client, mut reader, mut writer) = connect();

    let first = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .call("worker.info", json!({"tag": "first"}), Duration::from_secs(5))
                .await
        })
    };
    let second = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .call("worker.info", json!({"tag": "second"}), Duration::from_secs(5))
                .await
        })
    };

    let req_a = next_request(&mut reader).await;
    let req_b = next_request(&mut reader).await;
    let id_a = request_id(&req_a);
    let id_b = request_id(&req_b);
    assert_ne!(id_a, id_b, "request ids must be fresh");

    // Answer in reverse arrival order; each caller must still get its own.
    respond_ok(&mut writer, id_b, json!({"tag": req_b["params"]["tag"]})).await;
    respond_ok(&mut writer, id_a, json!({"tag": req_a["params"]["tag"]})).await;

    let first = first.await??;
    let second = second.await??;
    assert_eq!(first["tag"], "first");
    assert_eq!(second["tag"], "second");
    Ok(())
}

#[tokio::test]
async fn test_timed_out_call_resolves_once_and_late_response_is_dropped() -> Result<()> {
    let (client, mut reader, mut writer) = connect();

    let err = client
        .call("session.stop", json!({}), Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout { .. }));

    // The worker finally answers, far too late.
    let stale = next_request(&mut reader).await;
    let stale_id = request_id(&stale);
    respond_ok(&mut writer, stale_id, json!({"late": true})).await;

    // The late response must not leak into the next call.
    let fresh = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .call("worker.info", json!({}), Duration::from_secs(5))
                .await
        })
    };
    let req = next_request(&mut reader).await;
    let id = request_id(&req);
    assert_ne!(id, stale_id, "request ids are never reused");
    respond_ok(&mut writer, id, json!({"fresh": true})).await;

    let result = fresh.await??;
    assert_eq!(result["fresh"], true);
    Ok(())
}

#[tokio::test]
async fn test_short_deadline_on_model_load_is_clamped_up() -> Result<()> {
    let (client, mut reader, mut writer) = connect();

    // A 1ms deadline would expire long before the worker answers; the clamp
    // to the model-load timeout class must keep the call alive.
    let call = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .call("model.load", json!({"model": "base.en"}), Duration::from_millis(1))
                .await
        })
    };

    let req = next_request(&mut reader).await;
    let id = request_id(&req);
    tokio::time::sleep(Duration::from_millis(300)).await;
    respond_ok(&mut writer, id, json!({})).await;

    assert!(call.await?.is_ok(), "slow model load must not be misreported as a timeout");
    Ok(())
}

#[tokio::test]
async fn test_worker_error_response_surfaces_as_worker_error() -> Result<()> {
    let (client, mut reader, mut writer) = connect();

    let call = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .call("session.begin", json!({"session_id": 1}), Duration::from_secs(5))
                .await
        })
    };

    let req = next_request(&mut reader).await;
    let id = request_id(&req);
    let frame = json!({"v": 1, "id": id, "error": {"code": 42, "message": "device unavailable"}});
    writer.write_all(format!("{}\n", frame).as_bytes()).await?;

    match call.await?.unwrap_err() {
        CoreError::Worker { code, message } => {
            assert_eq!(code, 42);
            assert_eq!(message, "device unavailable");
        }
        other => panic!("expected Worker error, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_notifications_fan_out_to_every_subscriber() -> Result<()> {
    let (client, _reader, mut writer) = connect();

    let mut sub_a = client.subscribe();
    let mut sub_b = client.subscribe();

    let frame = json!({"v": 1, "method": "status.changed", "params": {"status": "capturing"}});
    writer.write_all(format!("{}\n", frame).as_bytes()).await?;

    let n_a = sub_a.recv().await?;
    let n_b = sub_b.recv().await?;
    assert_eq!(n_a.method, "status.changed");
    assert_eq!(n_b.method, "status.changed");
    Ok(())
}

#[tokio::test]
async fn test_malformed_line_does_not_kill_the_stream() -> Result<()> {
    let (client, _reader, mut writer) = connect();

    let mut sub = client.subscribe();
    writer.write_all(b"this is not json\n").await?;

    let frame = json!({"v": 1, "method": "status.changed", "params": {}});
    writer.write_all(format!("{}\n", frame).as_bytes()).await?;

    // The notification after the garbage line still arrives.
    let n = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("stream should survive a malformed line")?;
    assert_eq!(n.method, "status.changed");
    assert!(!client.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_oversized_frame_tears_down_the_stream_and_fails_pending_calls() -> Result<()> {
    let (client, mut reader, mut writer) = connect();

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .call("worker.info", json!({}), Duration::from_secs(10))
                .await
        })
    };
    // Make sure the call is in flight before poisoning the stream.
    let _ = next_request(&mut reader).await;

    // Feed more than the frame limit without a newline.
    tokio::spawn(async move {
        let chunk = vec![b'x'; 64 * 1024];
        let mut written = 0usize;
        while written <= MAX_FRAME_BYTES + chunk.len() {
            if writer.write_all(&chunk).await.is_err() {
                break;
            }
            written += chunk.len();
        }
    });

    let err = pending.await?.unwrap_err();
    assert!(matches!(err, CoreError::Transport(_)));

    let mut closed = client.closed();
    if !*closed.borrow() {
        tokio::time::timeout(Duration::from_secs(5), closed.changed())
            .await
            .expect("closed watch should flip")?;
    }
    assert!(client.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_stream_eof_fails_in_flight_calls_with_transport() -> Result<()> {
    let (client, mut reader, writer) = connect();

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .call("session.begin", json!({"session_id": 7}), Duration::from_secs(10))
                .await
        })
    };
    let _ = next_request(&mut reader).await;

    // Worker dies: both halves dropped.
    drop(writer);
    drop(reader);

    let err = pending.await?.unwrap_err();
    assert!(matches!(err, CoreError::Transport(_)));
    Ok(())
}

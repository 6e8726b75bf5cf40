//! Protocol tests against an in-process mock workload server.
//!
//! The mock accepts WebSocket connections the way a real workload's server
//! does: the client's throwaway test connection opens and closes without
//! sending anything, then the real connection delivers the job payloads and
//! receives scripted reply frames.

use conductor::channel::{JobRequest, ProtocolVersion, ServiceClient};
use conductor::Error;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Maps the payloads a job sent to the raw reply frames the workload emits.
type Responder = Arc<dyn Fn(&[String]) -> Vec<String> + Send + Sync>;

/// Spawn a mock workload server. After `expected_inputs` text messages
/// arrive on a connection, the responder's frames are sent back; if
/// `close_code` is set the server then closes the socket itself.
async fn spawn_workload(
    expected_inputs: usize,
    responder: Responder,
    close_code: Option<u16>,
) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let responder = Arc::clone(&responder);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let mut inputs = Vec::new();
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(text) => {
                            inputs.push(text);
                            if inputs.len() == expected_inputs {
                                for frame in responder(&inputs) {
                                    if ws.send(Message::Text(frame)).await.is_err() {
                                        return;
                                    }
                                }
                                if let Some(code) = close_code {
                                    let _ = ws
                                        .close(Some(CloseFrame {
                                            code: CloseCode::from(code),
                                            reason: "server closing".into(),
                                        }))
                                        .await;
                                    return;
                                }
                            }
                        }
                        Message::Close(_) => return,
                        _ => {}
                    }
                }
            });
        }
    });

    port
}

fn frames(values: Vec<serde_json::Value>) -> Responder {
    Arc::new(move |_inputs| values.iter().map(|v| v.to_string()).collect())
}

fn stdout_end(data: &str) -> serde_json::Value {
    json!({"type": "stdout", "data": data, "end": true})
}

fn stderr_end(data: &str) -> serde_json::Value {
    json!({"type": "stderr", "data": data, "end": true})
}

fn close(code: i32) -> serde_json::Value {
    json!({"type": "close", "code": code})
}

#[tokio::test]
async fn v1_round_trip_echoes_job_input() {
    // The workload echoes its input document back on stdout.
    let responder: Responder = Arc::new(|inputs| {
        let input = inputs[1].clone();
        vec![
            json!({"type": "stdout", "data": input, "end": true}).to_string(),
            stderr_end("").to_string(),
            close(0).to_string(),
        ]
    });
    let port = spawn_workload(2, responder, None).await;

    let client = ServiceClient::new("127.0.0.1", port, ProtocolVersion::V1);
    let result = client
        .run_job(JobRequest::command(["run"], json!({"echo": "hi"})))
        .await
        .unwrap();
    assert_eq!(result, json!({"echo": "hi"}));
}

#[tokio::test]
async fn v1_sends_command_header_then_input() {
    // The workload replies with what it received so the test can check
    // both payloads.
    let responder: Responder = Arc::new(|inputs| {
        let received = json!({"header": inputs[0], "input": inputs[1]});
        vec![
            json!({"type": "stdout", "data": received.to_string(), "end": true}).to_string(),
            stderr_end("").to_string(),
            close(0).to_string(),
        ]
    });
    let port = spawn_workload(2, responder, None).await;

    let client = ServiceClient::new("127.0.0.1", port, ProtocolVersion::V1);
    let result = client
        .run_job(JobRequest::command(["run", "--fast"], json!({"n": 1})))
        .await
        .unwrap();

    let header: serde_json::Value =
        serde_json::from_str(result["header"].as_str().unwrap()).unwrap();
    assert_eq!(header, json!({"command": "run", "args": ["--fast"]}));
    let input: serde_json::Value = serde_json::from_str(result["input"].as_str().unwrap()).unwrap();
    assert_eq!(input, json!({"n": 1}));
}

#[tokio::test]
async fn v1_completion_is_order_invariant() {
    let permutations: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    for order in permutations {
        let signals = [stdout_end("{\"done\":true}"), stderr_end("warned"), close(0)];
        let scripted: Vec<serde_json::Value> =
            order.iter().map(|&i| signals[i].clone()).collect();
        let port = spawn_workload(2, frames(scripted), None).await;

        let client = ServiceClient::new("127.0.0.1", port, ProtocolVersion::V1);
        let result = client
            .run_job(JobRequest::command(["run"], json!({})))
            .await
            .unwrap();
        assert_eq!(result, json!({"done": true}), "order {order:?}");
    }
}

#[tokio::test]
async fn v1_nonzero_exit_embeds_code_and_stderr() {
    let scripted = vec![stdout_end(""), stderr_end("boom"), close(7)];
    let port = spawn_workload(2, frames(scripted), None).await;

    let client = ServiceClient::new("127.0.0.1", port, ProtocolVersion::V1);
    let err = client
        .run_job(JobRequest::command(["run"], json!({})))
        .await
        .unwrap_err();

    match &err {
        Error::JobFailed { code, stderr } => {
            assert_eq!(*code, 7);
            assert_eq!(stderr, "boom");
        }
        other => panic!("wrong error: {other}"),
    }
    let message = err.to_string();
    assert!(message.contains('7'));
    assert!(message.contains("boom"));
}

#[tokio::test]
async fn v1_unparseable_stdout_embeds_diagnostics() {
    let scripted = vec![stdout_end("this is not json"), stderr_end("context"), close(0)];
    let port = spawn_workload(2, frames(scripted), None).await;

    let client = ServiceClient::new("127.0.0.1", port, ProtocolVersion::V1);
    let err = client
        .run_job(JobRequest::command(["run"], json!({})))
        .await
        .unwrap_err();

    match err {
        Error::OutputParse { code, stderr, .. } => {
            assert_eq!(code, 0);
            assert_eq!(stderr, "context");
        }
        other => panic!("wrong error: {other}"),
    }
}

#[tokio::test]
async fn error_frame_rejects_the_job() {
    let scripted = vec![json!({"type": "error", "error": {"message": "no such computation"}})];
    let port = spawn_workload(2, frames(scripted), None).await;

    let client = ServiceClient::new("127.0.0.1", port, ProtocolVersion::V1);
    let err = client
        .run_job(JobRequest::command(["run"], json!({})))
        .await
        .unwrap_err();
    match err {
        Error::Workload(value) => {
            assert_eq!(value["message"], "no such computation");
        }
        other => panic!("wrong error: {other}"),
    }
}

#[tokio::test]
async fn malformed_frame_rejects_the_job() {
    let responder: Responder = Arc::new(|_| vec!["{ not json".to_string()]);
    let port = spawn_workload(2, responder, None).await;

    let client = ServiceClient::new("127.0.0.1", port, ProtocolVersion::V1);
    let err = client
        .run_job(JobRequest::command(["run"], json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Json(_)));
}

#[tokio::test]
async fn abnormal_server_close_is_a_failure() {
    // The server sends an incomplete frame sequence then closes abnormally.
    let scripted = vec![stdout_end("partial")];
    let port = spawn_workload(2, frames(scripted), Some(1011)).await;

    let client = ServiceClient::new("127.0.0.1", port, ProtocolVersion::V1);
    let err = client
        .run_job(JobRequest::command(["run"], json!({})))
        .await
        .unwrap_err();
    match err {
        Error::AbnormalClose { code } => assert_eq!(code, 1011),
        other => panic!("wrong error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn connection_attempts_stop_after_the_eleventh() {
    // Nothing listens on this port: bind, learn the number, drop.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = ServiceClient::new("127.0.0.1", port, ProtocolVersion::V1);
    let err = client
        .run_job(JobRequest::command(["run"], json!({})))
        .await
        .unwrap_err();
    match err {
        Error::ConnectTimeout { attempts, .. } => assert_eq!(attempts, 11),
        other => panic!("wrong error: {other}"),
    }
}

#[tokio::test]
async fn v2_single_payload_carries_mode_and_data() {
    let responder: Responder = Arc::new(|inputs| {
        vec![json!({"type": "stdout", "data": inputs[0], "end": true}).to_string()]
    });
    let port = spawn_workload(1, responder, None).await;

    let client = ServiceClient::new("127.0.0.1", port, ProtocolVersion::V2);
    let result = client
        .run_job(JobRequest::mode("remote", json!({"iteration": 4})))
        .await
        .unwrap();

    let payload: serde_json::Value =
        serde_json::from_str(result.as_str().unwrap()).unwrap();
    assert_eq!(payload, json!({"mode": "remote", "data": {"iteration": 4}}));
}

#[tokio::test]
async fn v2_finished_stdout_resolves_without_close_or_stderr() {
    let scripted = vec![stdout_end("all done")];
    let port = spawn_workload(1, frames(scripted), None).await;

    let client = ServiceClient::new("127.0.0.1", port, ProtocolVersion::V2);
    let result = client
        .run_job(JobRequest::mode("local", json!({})))
        .await
        .unwrap();
    // v2 payloads come back as the raw stdout text.
    assert_eq!(result, serde_json::Value::String("all done".to_string()));
}

#[tokio::test]
async fn v2_stderr_code_surfaces_as_job_failure() {
    let scripted = vec![json!({
        "type": "stderr",
        "data": "iteration diverged",
        "end": true,
        "code": 3,
    })];
    let port = spawn_workload(1, frames(scripted), None).await;

    let client = ServiceClient::new("127.0.0.1", port, ProtocolVersion::V2);
    let err = client
        .run_job(JobRequest::mode("local", json!({})))
        .await
        .unwrap_err();
    match err {
        Error::JobFailed { code, stderr } => {
            assert_eq!(code, 3);
            assert_eq!(stderr, "iteration diverged");
        }
        other => panic!("wrong error: {other}"),
    }
}

#[tokio::test]
async fn repeated_jobs_reuse_the_same_client() {
    let responder: Responder = Arc::new(|inputs| {
        let input = inputs[1].clone();
        vec![
            json!({"type": "stdout", "data": input, "end": true}).to_string(),
            stderr_end("").to_string(),
            close(0).to_string(),
        ]
    });
    let port = spawn_workload(2, responder, None).await;

    let client = ServiceClient::new("127.0.0.1", port, ProtocolVersion::V1);
    for i in 0..3 {
        let result = client
            .run_job(JobRequest::command(["run"], json!({"i": i})))
            .await
            .unwrap();
        assert_eq!(result, json!({"i": i}));
    }
}

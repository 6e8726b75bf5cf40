//! The per-workload job channel.
//!
//! Every running workload hosts a small WebSocket server on its private
//! port. A job round-trip is: probe the server with a throwaway test
//! connection (retrying while the workload is still booting), open the real
//! connection, send the job, then fold the reply frames into a result via
//! [`JobAssembly`].

mod frame;

pub use frame::{FrameOutcome, JobAssembly, JobOutput, ProtocolVersion, WorkloadFrame};

use crate::error::{Error, Result};
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Total connection attempts before giving up on a booting workload.
const CONNECT_ATTEMPTS: u32 = 11;

/// Base delay between connection attempts; attempt N waits N times this.
const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

/// One job to run inside a workload.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Version-1 command line: first element is the command, the rest are
    /// its arguments.
    pub command: Vec<String>,
    /// Version-2 execution mode.
    pub mode: Option<String>,
    /// The job input, forwarded verbatim.
    pub input: serde_json::Value,
}

impl JobRequest {
    /// A version-1 request: command plus args, then the input document.
    pub fn command<I, S>(command: I, input: serde_json::Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            mode: None,
            input,
        }
    }

    /// A version-2 request: a mode plus the input document.
    pub fn mode(mode: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            command: Vec::new(),
            mode: Some(mode.into()),
            input,
        }
    }
}

/// The callable handle returned by a successful service start.
///
/// Cheap to clone; every [`run_job`](Self::run_job) call opens its own
/// connection, so one client can serve concurrent callers.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    host: String,
    port: u16,
    version: ProtocolVersion,
}

impl ServiceClient {
    pub fn new(host: impl Into<String>, port: u16, version: ProtocolVersion) -> Self {
        Self {
            host: host.into(),
            port,
            version,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    /// Probe the workload's server, retrying while it boots.
    ///
    /// Connection-refused/reset means the server isn't up yet: wait
    /// `attempt × 200ms` and try again, up to 11 attempts, then fail with a
    /// timeout. Any other error propagates immediately. A successful probe
    /// is closed cleanly and the caller opens a fresh connection.
    async fn test_connection(&self) -> Result<()> {
        let url = self.url();
        for attempt in 1..=CONNECT_ATTEMPTS {
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((mut socket, _)) => {
                    let _ = socket
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "Test Connection".into(),
                        }))
                        .await;
                    return Ok(());
                }
                Err(e) if is_connection_retryable(&e) => {
                    if attempt == CONNECT_ATTEMPTS {
                        return Err(Error::ConnectTimeout {
                            host: self.host.clone(),
                            port: self.port,
                            attempts: CONNECT_ATTEMPTS,
                        });
                    }
                    tracing::debug!(
                        attempt,
                        port = self.port,
                        "workload not accepting connections yet, backing off"
                    );
                    tokio::time::sleep(CONNECT_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::ConnectTimeout {
            host: self.host.clone(),
            port: self.port,
            attempts: CONNECT_ATTEMPTS,
        })
    }

    /// Run one job round-trip.
    ///
    /// On success returns the workload's stdout payload: parsed JSON for
    /// version 1, the raw text as a JSON string for version 2. A non-zero
    /// exit code fails with the code and accumulated stderr embedded.
    #[tracing::instrument(skip(self, request), fields(port = self.port))]
    pub async fn run_job(&self, request: JobRequest) -> Result<serde_json::Value> {
        self.test_connection().await?;

        let (socket, _) = tokio_tungstenite::connect_async(self.url()).await?;
        let (mut sink, mut stream) = socket.split();

        match self.version {
            ProtocolVersion::V1 => {
                let header = json!({
                    "command": request.command.first().cloned().unwrap_or_default(),
                    "args": request.command.get(1..).unwrap_or_default(),
                });
                sink.send(Message::Text(header.to_string())).await?;
                let input = serde_json::to_string(&request.input)?;
                tracing::debug!(size = input.len(), "sending job input");
                sink.send(Message::Text(input)).await?;
            }
            ProtocolVersion::V2 => {
                let payload = json!({
                    "mode": request.mode,
                    "data": request.input,
                });
                sink.send(Message::Text(payload.to_string())).await?;
            }
        }

        let mut assembly = JobAssembly::new(self.version);
        let output = loop {
            let Some(message) = stream.next().await else {
                // Stream ended without a close handshake.
                return Err(Error::AbnormalClose { code: 1006 });
            };
            match message? {
                Message::Text(text) => {
                    let value: serde_json::Value = match serde_json::from_str(&text) {
                        Ok(value) => value,
                        Err(e) => {
                            close_with(&mut sink, CloseCode::Error, "Data parse error").await;
                            return Err(Error::Json(e));
                        }
                    };
                    // Frames with an unrecognized `type` are skipped, not
                    // fatal — workloads are free to add frame kinds.
                    let Ok(frame) = serde_json::from_value::<WorkloadFrame>(value) else {
                        continue;
                    };
                    match assembly.apply(frame) {
                        FrameOutcome::Pending => {}
                        FrameOutcome::Complete(output) => {
                            close_with(&mut sink, CloseCode::Normal, "Normal Client disconnect")
                                .await;
                            break output;
                        }
                        FrameOutcome::Failed(error) => {
                            close_with(&mut sink, CloseCode::Error, "Computation start error")
                                .await;
                            return Err(Error::Workload(error));
                        }
                    }
                }
                Message::Close(frame) => {
                    let code = frame.map(|f| u16::from(f.code)).unwrap_or(1006);
                    return Err(Error::AbnormalClose { code });
                }
                // Pongs are answered by the protocol layer; nothing else is
                // expected on this channel.
                _ => {}
            }
        };

        tracing::debug!(code = output.code, size = output.stdout.len(), "job finished");
        if output.code != 0 {
            return Err(Error::JobFailed {
                code: output.code,
                stderr: output.stderr,
            });
        }

        match self.version {
            ProtocolVersion::V1 => {
                serde_json::from_str(&output.stdout).map_err(|e| Error::OutputParse {
                    code: output.code,
                    stderr: output.stderr.clone(),
                    source: e,
                })
            }
            // Version-2 workloads ship their payload pre-rendered; hand it
            // back untouched.
            ProtocolVersion::V2 => Ok(serde_json::Value::String(output.stdout)),
        }
    }
}

/// Send a close frame, ignoring failures — the socket may already be gone.
async fn close_with<S>(sink: &mut S, code: CloseCode, reason: &'static str)
where
    S: Sink<Message> + Unpin,
{
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Refused/reset mean the server socket isn't listening yet — the workload
/// is still booting. Everything else is a real failure.
fn is_connection_retryable(error: &tokio_tungstenite::tungstenite::Error) -> bool {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match error {
        WsError::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
        ),
        _ => false,
    }
}

//! Wire frames and per-job result assembly.
//!
//! A workload answers a job with a sequence of JSON frames tagged by
//! `type`. [`JobAssembly`] folds those frames into a final
//! `{code, stdout, stderr}` triple; one assembly exists per in-flight job.
//! The two protocol versions share the frame vocabulary but complete under
//! different predicates — see [`JobAssembly::apply`].

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Wire protocol version spoken by a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[default]
    V1,
    V2,
}

impl ProtocolVersion {
    /// Map a computation spec version number to a protocol version.
    pub fn from_number(version: u32) -> Result<Self> {
        match version {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            other => Err(Error::InvalidVersion(other)),
        }
    }
}

/// One frame sent by a workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkloadFrame {
    /// The workload could not run the job at all.
    Error { error: serde_json::Value },
    /// Incremental stdout chunk; `end` marks the stream finished.
    Stdout {
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        end: bool,
    },
    /// Incremental stderr chunk; may carry an exit code in version 2.
    Stderr {
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        end: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
    /// The workload process exited with `code`.
    Close { code: i32 },
}

/// Fully assembled job result, before exit-code and output handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// What a frame did to the in-flight job.
#[derive(Debug)]
pub enum FrameOutcome {
    /// More frames needed.
    Pending,
    /// All completion signals arrived; the job resolved exactly once.
    Complete(JobOutput),
    /// The workload sent an `error` frame.
    Failed(serde_json::Value),
}

/// Per-job state machine folding workload frames into a [`JobOutput`].
#[derive(Debug)]
pub struct JobAssembly {
    version: ProtocolVersion,
    stdout: String,
    stderr: String,
    stdout_done: bool,
    stderr_done: bool,
    exit_code: Option<i32>,
}

impl JobAssembly {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            stdout: String::new(),
            stderr: String::new(),
            stdout_done: false,
            stderr_done: false,
            exit_code: None,
        }
    }

    /// Apply one frame and report whether the job completed.
    ///
    /// Version 1 completes only once all three signals have arrived —
    /// stdout finished, stderr finished, exit code received — in any
    /// order.
    ///
    /// Version 2 differs on purpose and the predicates must not be
    /// unified: a finished `stdout` frame resolves immediately with exit
    /// code 0 and empty stderr; a `stderr` frame carrying a code resolves
    /// once stderr is finished; `close` resolves only if both streams are
    /// already done.
    pub fn apply(&mut self, frame: WorkloadFrame) -> FrameOutcome {
        match frame {
            WorkloadFrame::Error { error } => return FrameOutcome::Failed(error),
            WorkloadFrame::Stdout { data, end } => match self.version {
                ProtocolVersion::V1 => {
                    if let Some(chunk) = data {
                        self.stdout.push_str(&chunk);
                    }
                    self.stdout_done = end;
                }
                ProtocolVersion::V2 => {
                    // v2 stdout replaces rather than appends; the payload
                    // arrives whole.
                    if let Some(chunk) = data {
                        self.stdout = chunk;
                    }
                    self.stdout_done = end;
                    if end {
                        return FrameOutcome::Complete(JobOutput {
                            code: 0,
                            stdout: std::mem::take(&mut self.stdout),
                            stderr: String::new(),
                        });
                    }
                }
            },
            WorkloadFrame::Stderr { data, end, code } => {
                if let Some(chunk) = data {
                    self.stderr.push_str(&chunk);
                }
                self.stderr_done = end;
                if self.version == ProtocolVersion::V2 {
                    if let Some(code) = code {
                        self.exit_code = Some(code);
                        if self.stderr_done {
                            return FrameOutcome::Complete(self.take_output());
                        }
                    }
                }
            }
            WorkloadFrame::Close { code } => {
                self.exit_code = Some(code);
            }
        }

        if self.is_complete() {
            FrameOutcome::Complete(self.take_output())
        } else {
            FrameOutcome::Pending
        }
    }

    fn is_complete(&self) -> bool {
        // Both versions end up here for the close-frame path; version 2's
        // early exits have already returned by now.
        self.stdout_done && self.stderr_done && self.exit_code.is_some()
    }

    fn take_output(&mut self) -> JobOutput {
        JobOutput {
            code: self.exit_code.unwrap_or(0),
            stdout: std::mem::take(&mut self.stdout),
            stderr: std::mem::take(&mut self.stderr),
        }
    }
}

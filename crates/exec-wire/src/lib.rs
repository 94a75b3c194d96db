//! Wire contract between the orchestrator and the in-container exec daemon.
//!
//! A request is a JSON body validated against a draft-7 schema before any
//! subprocess is spawned. The response is a single `text/plain` stream of
//! interleaved child output followed by one terminal [`ExecReport`] frame.
//! The frame boundary is an explicit ASCII record-separator sentinel rather
//! than the fragile "last line of the stream" convention: test suites print
//! arbitrary lines, including JSON-looking ones, but they do not emit 0x1E.

use jsonschema::{Draft, JSONSchema};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Byte separating streamed output from the terminal report.
pub const FRAME_SENTINEL: u8 = 0x1e;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("request rejected: {}", violations.join("; "))]
    Rejected { violations: Vec<String> },

    #[error("stream ended without a terminal report")]
    MissingReport,

    #[error("malformed terminal report: {0}")]
    BadReport(#[from] serde_json::Error),
}

/// A command-execution request. `file` is either an argv[0] (when `args` is
/// present) or a full shell command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Milliseconds; the child is killed on expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Terminal record appended after the streamed output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecReport {
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    /// Serialized spawn error when the subprocess never started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecReport {
    pub fn success(&self) -> bool {
        self.error.is_none() && !self.timed_out && self.exit_code == Some(0)
    }
}

static REQUEST_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    let schema = serde_json::json!({
        "type": "object",
        "required": ["file"],
        "additionalProperties": false,
        "properties": {
            "file": { "type": "string", "minLength": 1 },
            "args": {
                "type": "array",
                "items": { "type": "string", "minLength": 1 }
            },
            "timeout": { "type": "number", "minimum": 0 },
            "user": { "type": "string", "minLength": 1 }
        }
    });
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
        .expect("static exec request schema must compile")
});

/// Validate a raw request body. Rejected requests must never spawn a process.
pub fn validate_request(body: &Value) -> Result<(), WireError> {
    if let Err(errors) = REQUEST_SCHEMA.validate(body) {
        let violations = errors
            .map(|error| format!("{} at {}", error, error.instance_path))
            .collect();
        return Err(WireError::Rejected { violations });
    }
    Ok(())
}

/// Encode the terminal frame: newline, sentinel, report JSON, newline.
pub fn encode_report(report: &ExecReport) -> Vec<u8> {
    let mut frame = vec![b'\n', FRAME_SENTINEL];
    frame.extend_from_slice(
        serde_json::to_string(report)
            .expect("report serialization is infallible")
            .as_bytes(),
    );
    frame.push(b'\n');
    frame
}

/// Incremental consumer of the response stream.
///
/// Feed chunks as they arrive; bytes before the sentinel come back as output
/// to display, bytes after it are buffered until [`FrameSplitter::finish`]
/// parses the report. The sentinel itself may land on any chunk boundary.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    trailer: Option<Vec<u8>>,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk, returning the displayable output portion.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        match &mut self.trailer {
            Some(trailer) => {
                trailer.extend_from_slice(chunk);
                Vec::new()
            }
            None => match chunk.iter().position(|&b| b == FRAME_SENTINEL) {
                Some(idx) => {
                    self.trailer = Some(chunk[idx + 1..].to_vec());
                    chunk[..idx].to_vec()
                }
                None => chunk.to_vec(),
            },
        }
    }

    /// Parse the terminal report after the stream has ended.
    pub fn finish(self) -> Result<ExecReport, WireError> {
        let trailer = self.trailer.ok_or(WireError::MissingReport)?;
        let report = serde_json::from_slice(trailer_line(&trailer))?;
        Ok(report)
    }
}

fn trailer_line(trailer: &[u8]) -> &[u8] {
    let end = trailer
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(trailer.len());
    &trailer[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_requests_pass_schema() {
        validate_request(&json!({"file": "echo", "args": ["hello"]})).unwrap();
        validate_request(&json!({"file": "ls -la"})).unwrap();
        validate_request(&json!({"file": "sh", "args": [], "timeout": 5000, "user": "node"}))
            .unwrap();
    }

    #[test]
    fn empty_file_is_rejected() {
        let err = validate_request(&json!({"file": ""})).unwrap_err();
        assert!(matches!(err, WireError::Rejected { .. }));
    }

    #[test]
    fn missing_file_is_rejected() {
        assert!(validate_request(&json!({"args": ["x"]})).is_err());
    }

    #[test]
    fn empty_arg_items_are_rejected() {
        assert!(validate_request(&json!({"file": "echo", "args": [""]})).is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(validate_request(&json!({"file": "echo", "shell": true})).is_err());
    }

    #[test]
    fn report_round_trips_through_frame() {
        let report = ExecReport {
            exit_code: Some(3),
            timed_out: false,
            error: None,
        };
        let frame = encode_report(&report);

        let mut splitter = FrameSplitter::new();
        let shown = splitter.push(b"suite output\n");
        assert_eq!(shown, b"suite output\n");
        let shown = splitter.push(&frame);
        assert_eq!(shown, b"\n");

        let parsed = splitter.finish().unwrap();
        assert_eq!(parsed.exit_code, Some(3));
        assert!(!parsed.success());
    }

    #[test]
    fn frame_split_across_chunk_boundaries() {
        let report = ExecReport {
            exit_code: Some(0),
            ..Default::default()
        };
        let mut bytes = b"partial".to_vec();
        bytes.extend_from_slice(&encode_report(&report));

        let mut splitter = FrameSplitter::new();
        let mut output = Vec::new();
        for chunk in bytes.chunks(3) {
            output.extend_from_slice(&splitter.push(chunk));
        }

        assert_eq!(output, b"partial\n");
        assert!(splitter.finish().unwrap().success());
    }

    #[test]
    fn json_looking_final_output_line_is_not_mistaken_for_the_report() {
        let report = ExecReport {
            exit_code: Some(0),
            ..Default::default()
        };
        let mut splitter = FrameSplitter::new();
        let shown = splitter.push(b"{\"exitCode\": 99}\n");
        assert_eq!(shown, b"{\"exitCode\": 99}\n");
        splitter.push(&encode_report(&report));

        assert_eq!(splitter.finish().unwrap().exit_code, Some(0));
    }

    #[test]
    fn stream_without_report_is_an_error() {
        let mut splitter = FrameSplitter::new();
        splitter.push(b"output only\n");
        assert!(matches!(splitter.finish(), Err(WireError::MissingReport)));
    }
}

//! Wire messages exchanged with the row backend.
//!
//! Requests are plain JSON. Responses arrive as a frame: a JSON `msg` header
//! plus out-of-band binary `buffers`, the shape notebook comm channels use.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{GridError, GridResult};
use crate::models::{Fingerprint, RequestId, RowWindow, SourceKey};

/// `{ "type": "fetch", "source_key", "range": [start, end), "fingerprint", "request_id" }`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "fetch")]
pub struct FetchRequest {
    pub source_key: SourceKey,
    pub range: [u64; 2],
    pub fingerprint: Fingerprint,
    pub request_id: RequestId,
}

impl FetchRequest {
    pub fn new(request_id: RequestId, window: &RowWindow, fingerprint: &Fingerprint) -> Self {
        Self {
            source_key: window.source_key.clone(),
            range: [window.start, window.end],
            fingerprint: fingerprint.clone(),
            request_id,
        }
    }

    pub fn window(&self) -> RowWindow {
        RowWindow::new(self.source_key.clone(), self.range[0], self.range[1])
    }
}

/// Raw frame as delivered by the transport.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ResponseFrame {
    pub msg: Value,
    pub buffers: Vec<Vec<u8>>,
}

impl ResponseFrame {
    /// Success frame carrying an encoded row buffer.
    pub fn rows(request_id: RequestId, buffer: Vec<u8>, total_row_count: u64) -> Self {
        Self {
            msg: json!({ "request_id": request_id, "total_row_count": total_row_count }),
            buffers: vec![buffer],
        }
    }

    /// Error frame.
    pub fn error(request_id: RequestId, error: impl Into<String>) -> Self {
        Self {
            msg: json!({ "request_id": request_id, "error": error.into() }),
            buffers: Vec::new(),
        }
    }

    pub fn buffers_len(&self) -> usize {
        self.buffers.len()
    }
}

/// Body of a parsed response.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Rows { buffer: Vec<u8>, total_row_count: u64 },
    Error { error: String },
    /// The header named a request but the rest of the frame was unusable.
    Malformed { reason: String },
}

/// A response correlated to a request id.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchResponse {
    pub request_id: RequestId,
    pub body: ResponseBody,
}

impl FetchResponse {
    /// Parse a raw frame.
    ///
    /// Fails only when no request id can be recovered; any other defect is
    /// reported as [`ResponseBody::Malformed`] so the matching request still
    /// resolves.
    pub fn from_frame(frame: ResponseFrame) -> GridResult<Self> {
        let request_id = frame
            .msg
            .get("request_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| GridError::Decode("response frame has no request_id".into()))?;

        if let Some(error) = frame.msg.get("error") {
            let error = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Ok(Self {
                request_id,
                body: ResponseBody::Error { error },
            });
        }

        let Some(total_row_count) = frame.msg.get("total_row_count").and_then(Value::as_u64) else {
            return Ok(Self {
                request_id,
                body: ResponseBody::Malformed {
                    reason: "response frame has no total_row_count".into(),
                },
            });
        };

        let mut buffers = frame.buffers;
        if buffers.is_empty() {
            return Ok(Self {
                request_id,
                body: ResponseBody::Malformed {
                    reason: "response frame has no row buffer".into(),
                },
            });
        }
        let buffer = buffers.swap_remove(0);
        Ok(Self {
            request_id,
            body: ResponseBody::Rows {
                buffer,
                total_row_count,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let window = RowWindow::new("df".into(), 0, 100);
        let req = FetchRequest::new(7, &window, &Fingerprint("abc".into()));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "fetch",
                "source_key": "df",
                "range": [0, 100],
                "fingerprint": "abc",
                "request_id": 7
            })
        );
        let back: FetchRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back.window(), window);
    }

    #[test]
    fn test_parse_rows_frame() {
        let resp = FetchResponse::from_frame(ResponseFrame::rows(3, vec![1, 2, 3], 500)).unwrap();
        assert_eq!(resp.request_id, 3);
        assert_eq!(
            resp.body,
            ResponseBody::Rows {
                buffer: vec![1, 2, 3],
                total_row_count: 500
            }
        );
    }

    #[test]
    fn test_parse_error_frame() {
        let resp = FetchResponse::from_frame(ResponseFrame::error(4, "kernel died")).unwrap();
        assert_eq!(
            resp.body,
            ResponseBody::Error {
                error: "kernel died".into()
            }
        );
    }

    #[test]
    fn test_missing_buffer_is_malformed_not_fatal() {
        let frame = ResponseFrame {
            msg: json!({"request_id": 9, "total_row_count": 10}),
            buffers: vec![],
        };
        let resp = FetchResponse::from_frame(frame).unwrap();
        assert!(matches!(resp.body, ResponseBody::Malformed { .. }));
    }

    #[test]
    fn test_missing_request_id_is_decode_error() {
        let frame = ResponseFrame {
            msg: json!({"total_row_count": 10}),
            buffers: vec![vec![]],
        };
        assert!(matches!(
            FetchResponse::from_frame(frame),
            Err(GridError::Decode(_))
        ));
    }
}

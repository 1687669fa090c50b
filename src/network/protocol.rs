//! Request/response envelopes exchanged between clients and device servers.
//!
//! Envelopes use a fixed little-endian binary layout; payloads inside them
//! are JSON documents. Each envelope travels in one length-prefixed frame
//! (see [`crate::network::frame`]).
//!
//! Request layout: `type: u8 | request_id: u32 | payload_len: u32 | payload | timestamp_ms: u64`
//!
//! Response layout: `status: u8 | request_id: u32 | payload_len: u32 | payload |
//! error_len: u32 | error (utf-8) | timestamp_ms: u64`

use crate::device::{DeviceClass, DeviceInfo};
use crate::error::{ErrorKind, PqnError, PqnResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const REQUEST_HEADER_LEN: usize = 9;
const REQUEST_MIN_LEN: usize = 17;
const RESPONSE_MIN_LEN: usize = 21;

fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

fn read_u32(data: &[u8], at: usize) -> PqnResult<u32> {
    data.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| PqnError::Protocol(format!("truncated u32 at offset {}", at)))
}

fn read_u64(data: &[u8], at: usize) -> PqnResult<u64> {
    data.get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| PqnError::Protocol(format!("truncated u64 at offset {}", at)))
}

/// Request kinds, first byte of a request envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestType {
    /// Liveness check, answered with [`PingReply`].
    Ping = 0,
    /// Snapshots of every registered device.
    ListDevices = 1,
    /// [`DeviceDescription`] of one device.
    DescribeDevice = 2,
    /// Fresh snapshot of one device.
    DeviceInfo = 3,
    /// Run an operation, payload [`InvokeRequest`].
    Invoke = 4,
}

impl RequestType {
    /// Parse the wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RequestType::Ping),
            1 => Some(RequestType::ListDevices),
            2 => Some(RequestType::DescribeDevice),
            3 => Some(RequestType::DeviceInfo),
            4 => Some(RequestType::Invoke),
            _ => None,
        }
    }
}

/// Outcome byte of a response envelope. Every failure maps to one [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResponseStatus {
    /// Payload holds the result.
    Success = 0,
    /// `NotFoundError`
    NotFound = 1,
    /// `NotReadyError`
    NotReady = 2,
    /// `HardwareIOError`
    HardwareIo = 3,
    /// `SerializationError`
    Serialization = 4,
    /// `InvalidArgumentError`
    InvalidArgument = 5,
    /// `CancelledError`
    Cancelled = 6,
    /// `ProtocolError`
    Protocol = 7,
    /// `InternalError`, also used for kinds that only exist client-side.
    Internal = 8,
}

impl ResponseStatus {
    /// Parse the wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ResponseStatus::Success),
            1 => Some(ResponseStatus::NotFound),
            2 => Some(ResponseStatus::NotReady),
            3 => Some(ResponseStatus::HardwareIo),
            4 => Some(ResponseStatus::Serialization),
            5 => Some(ResponseStatus::InvalidArgument),
            6 => Some(ResponseStatus::Cancelled),
            7 => Some(ResponseStatus::Protocol),
            8 => Some(ResponseStatus::Internal),
            _ => None,
        }
    }

    /// Status reporting `kind`. Client-side kinds collapse into `Internal`.
    pub fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NotFound => ResponseStatus::NotFound,
            ErrorKind::NotReady => ResponseStatus::NotReady,
            ErrorKind::HardwareIo => ResponseStatus::HardwareIo,
            ErrorKind::Serialization => ResponseStatus::Serialization,
            ErrorKind::InvalidArgument => ResponseStatus::InvalidArgument,
            ErrorKind::Cancelled => ResponseStatus::Cancelled,
            ErrorKind::Protocol => ResponseStatus::Protocol,
            ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::Internal => {
                ResponseStatus::Internal
            }
        }
    }

    /// Error kind carried by a failed status, `None` for success.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ResponseStatus::Success => None,
            ResponseStatus::NotFound => Some(ErrorKind::NotFound),
            ResponseStatus::NotReady => Some(ErrorKind::NotReady),
            ResponseStatus::HardwareIo => Some(ErrorKind::HardwareIo),
            ResponseStatus::Serialization => Some(ErrorKind::Serialization),
            ResponseStatus::InvalidArgument => Some(ErrorKind::InvalidArgument),
            ResponseStatus::Cancelled => Some(ErrorKind::Cancelled),
            ResponseStatus::Protocol => Some(ErrorKind::Protocol),
            ResponseStatus::Internal => Some(ErrorKind::Internal),
        }
    }
}

/// Request envelope.
///
/// Layout: `type: u8 | request_id: u32 | payload_len: u32 | payload | timestamp: u64`,
/// integers little-endian.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Caller-chosen id echoed by the response.
    pub request_id: u32,
    /// What is being asked.
    pub request_type: RequestType,
    /// JSON body, empty for requests without one.
    pub payload: Vec<u8>,
    /// Milliseconds since the Unix epoch at creation.
    pub timestamp: u64,
}

impl ControlRequest {
    /// Request stamped with the current time.
    pub fn new(request_id: u32, request_type: RequestType, payload: Vec<u8>) -> Self {
        Self {
            request_id,
            request_type,
            payload,
            timestamp: now_ms(),
        }
    }

    /// Request whose payload is `body` encoded as JSON.
    pub fn with_json<T: Serialize>(
        request_id: u32,
        request_type: RequestType,
        body: &T,
    ) -> PqnResult<Self> {
        Ok(Self::new(request_id, request_type, serde_json::to_vec(body)?))
    }

    /// Decode the JSON payload.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> PqnResult<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            PqnError::Protocol(format!("malformed {:?} payload: {}", self.request_type, e))
        })
    }

    /// Serialize to the envelope layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REQUEST_MIN_LEN + self.payload.len());

        buf.push(self.request_type as u8);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());

        buf
    }

    /// Parse an envelope; any length mismatch is a `Protocol` error.
    pub fn decode(data: &[u8]) -> PqnResult<Self> {
        if data.len() < REQUEST_MIN_LEN {
            return Err(PqnError::Protocol(
                "insufficient data for ControlRequest".to_string(),
            ));
        }

        let request_type = RequestType::from_u8(data[0])
            .ok_or_else(|| PqnError::Protocol(format!("invalid request type {}", data[0])))?;
        let request_id = read_u32(data, 1)?;
        let payload_len = read_u32(data, 5)? as usize;

        let payload_end = REQUEST_HEADER_LEN + payload_len;
        if data.len() != payload_end + 8 {
            return Err(PqnError::Protocol("payload size mismatch".to_string()));
        }

        let payload = data[REQUEST_HEADER_LEN..payload_end].to_vec();
        let timestamp = read_u64(data, payload_end)?;

        Ok(ControlRequest {
            request_id,
            request_type,
            payload,
            timestamp,
        })
    }
}

/// `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error category.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

/// Response envelope.
///
/// Layout: `status: u8 | request_id: u32 | payload_len: u32 | payload |
/// error_len: u32 | error_message | timestamp: u64`, integers little-endian.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Id of the request being answered.
    pub request_id: u32,
    /// Success or the error category.
    pub status: ResponseStatus,
    /// JSON result on success.
    pub payload: Vec<u8>,
    /// Error detail on failure, empty otherwise.
    pub error_message: String,
    /// Milliseconds since the Unix epoch at creation.
    pub timestamp: u64,
}

impl ControlResponse {
    /// Response stamped with the current time.
    pub fn new(request_id: u32, status: ResponseStatus, payload: Vec<u8>) -> Self {
        Self {
            request_id,
            status,
            payload,
            error_message: String::new(),
            timestamp: now_ms(),
        }
    }

    /// Successful response carrying `result` as JSON.
    pub fn success<T: Serialize>(request_id: u32, result: &T) -> Self {
        match serde_json::to_vec(result) {
            Ok(payload) => Self::new(request_id, ResponseStatus::Success, payload),
            Err(e) => Self::error(request_id, &PqnError::from(e)),
        }
    }

    /// Failed response reporting `err`.
    pub fn error(request_id: u32, err: &PqnError) -> Self {
        Self {
            request_id,
            status: ResponseStatus::from_kind(err.kind()),
            payload: Vec::new(),
            error_message: err.message(),
            timestamp: now_ms(),
        }
    }

    /// Whether the status is `Success`.
    pub fn ok(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// The `error` member, present only on failure.
    pub fn error_body(&self) -> Option<ErrorBody> {
        self.status.kind().map(|kind| ErrorBody {
            kind,
            message: self.error_message.clone(),
        })
    }

    /// Result value on success (`null` for an empty payload), or the reported error.
    pub fn into_result(self) -> PqnResult<Value> {
        if let Some(body) = self.error_body() {
            return Err(PqnError::from_remote(body.kind, body.message));
        }
        if self.payload.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| PqnError::Protocol(format!("malformed response payload: {}", e)))
    }

    /// Serialize to the envelope layout.
    pub fn encode(&self) -> Vec<u8> {
        let error_bytes = self.error_message.as_bytes();
        let capacity = RESPONSE_MIN_LEN + self.payload.len() + error_bytes.len();
        let mut buf = Vec::with_capacity(capacity);

        buf.push(self.status as u8);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);

        buf.extend_from_slice(&(error_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(error_bytes);

        buf.extend_from_slice(&self.timestamp.to_le_bytes());

        buf
    }

    /// Parse an envelope; any length mismatch is a `Protocol` error.
    pub fn decode(data: &[u8]) -> PqnResult<Self> {
        if data.len() < RESPONSE_MIN_LEN {
            return Err(PqnError::Protocol(
                "insufficient data for ControlResponse".to_string(),
            ));
        }

        let status = ResponseStatus::from_u8(data[0])
            .ok_or_else(|| PqnError::Protocol(format!("invalid response status {}", data[0])))?;
        let request_id = read_u32(data, 1)?;
        let payload_len = read_u32(data, 5)? as usize;

        let payload_end = 9 + payload_len;
        if data.len() < payload_end + 4 {
            return Err(PqnError::Protocol("payload size mismatch".to_string()));
        }
        let payload = data[9..payload_end].to_vec();

        let error_len = read_u32(data, payload_end)? as usize;
        let error_end = payload_end + 4 + error_len;
        if data.len() != error_end + 8 {
            return Err(PqnError::Protocol("error message size mismatch".to_string()));
        }

        let error_message = String::from_utf8(data[payload_end + 4..error_end].to_vec())
            .map_err(|e| PqnError::Protocol(e.to_string()))?;
        let timestamp = read_u64(data, error_end)?;

        Ok(ControlResponse {
            request_id,
            status,
            payload,
            error_message,
            timestamp,
        })
    }
}

// =============================================================================
// JSON payloads
// =============================================================================

/// Payload of an `Invoke` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    /// Target device on the receiving server.
    pub device: String,
    /// Operation name.
    pub operation: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: BTreeMap<String, Value>,
    /// Caller's deadline; the server cancels the operation's token when it passes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Payload of `DescribeDevice` and `DeviceInfo` requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceQuery {
    /// Device name.
    pub device: String,
}

/// Static description returned by `DescribeDevice`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescription {
    /// Device name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Hardware address.
    pub address: String,
    /// Hardware category.
    pub class: DeviceClass,
    /// Registered operation names, sorted.
    pub operations: Vec<String>,
}

impl From<&DeviceInfo> for DeviceDescription {
    fn from(info: &DeviceInfo) -> Self {
        Self {
            name: info.name.clone(),
            description: info.description.clone(),
            address: info.address.clone(),
            class: info.class,
            operations: info.operations.clone(),
        }
    }
}

/// Reply to `Ping`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingReply {
    /// Name the server was started under.
    pub server: String,
    /// Registered device count.
    pub devices: usize,
    /// Connected client count.
    pub sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_request_roundtrip() {
        let body = InvokeRequest {
            device: "pol".to_string(),
            operation: "read".to_string(),
            args: vec![json!(1), json!("x")],
            kwargs: BTreeMap::new(),
            timeout_ms: Some(5000),
        };
        let req = ControlRequest::with_json(7, RequestType::Invoke, &body).unwrap();
        let decoded = ControlRequest::decode(&req.encode()).unwrap();

        assert_eq!(decoded.request_id, 7);
        assert_eq!(decoded.request_type, RequestType::Invoke);
        assert_eq!(decoded.timestamp, req.timestamp);
        assert_eq!(decoded.json::<InvokeRequest>().unwrap(), body);
    }

    #[test]
    fn test_control_response_error_roundtrip() {
        let err = PqnError::NotFound("operation 'x' not found in 'pol'".to_string());
        let resp = ControlResponse::error(3, &err);
        let decoded = ControlResponse::decode(&resp.encode()).unwrap();

        assert!(!decoded.ok());
        assert_eq!(
            decoded.error_body(),
            Some(ErrorBody {
                kind: ErrorKind::NotFound,
                message: "operation 'x' not found in 'pol'".to_string(),
            })
        );
        assert!(matches!(decoded.into_result(), Err(PqnError::NotFound(_))));
    }

    #[test]
    fn test_success_payload() {
        let resp = ControlResponse::success(1, &json!([0.25, 0.5]));
        let decoded = ControlResponse::decode(&resp.encode()).unwrap();
        assert!(decoded.ok());
        assert!(decoded.error_body().is_none());
        assert_eq!(decoded.into_result().unwrap(), json!([0.25, 0.5]));
    }

    #[test]
    fn test_empty_success_is_null() {
        let resp = ControlResponse::new(1, ResponseStatus::Success, Vec::new());
        assert_eq!(resp.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_invalid_data() {
        assert!(ControlRequest::decode(&[0u8; 4]).is_err());

        let mut bad_type = ControlRequest::new(1, RequestType::Ping, vec![]).encode();
        bad_type[0] = 99;
        assert!(matches!(
            ControlRequest::decode(&bad_type),
            Err(PqnError::Protocol(_))
        ));

        let mut truncated = ControlResponse::success(1, &json!(1)).encode();
        truncated.pop();
        assert!(ControlResponse::decode(&truncated).is_err());
    }

    #[test]
    fn test_client_side_kinds_not_sent() {
        let err = PqnError::Timeout(std::time::Duration::from_millis(5));
        let resp = ControlResponse::error(1, &err);
        assert_eq!(resp.status, ResponseStatus::Internal);
    }
}

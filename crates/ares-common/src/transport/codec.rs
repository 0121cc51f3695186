use crate::protocol::error::Result;
use crate::protocol::{CallRequest, CallResponse};

/// JSON codec for call messages.
///
/// Argument and result payloads stay opaque `serde_json::Value`s to the rest
/// of the framework.
///
/// # Example
///
/// ```
/// use ares_common::transport::JsonCodec;
/// use ares_common::protocol::{CallRequest, ServiceDescriptor};
/// use serde_json::json;
///
/// let service = ServiceDescriptor::new("ares.demo.HelloService", "127.0.0.1", 8081);
/// let request = CallRequest::new(service, "sayHello", vec![json!("ares")]);
///
/// let encoded = JsonCodec::encode_request(&request).unwrap();
/// let decoded = JsonCodec::decode_request(&encoded).unwrap();
/// assert_eq!(request, decoded);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode_request(request: &CallRequest) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    pub fn decode_request(data: &[u8]) -> Result<CallRequest> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn encode_response(response: &CallResponse) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    pub fn decode_response(data: &[u8]) -> Result<CallResponse> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FailureKind, ServiceDescriptor};
    use serde_json::json;

    #[test]
    fn test_response_failure_survives_encoding() {
        let response = CallResponse::failure("c-1".to_string(), 200, FailureKind::Rejected, "busy");

        let encoded = JsonCodec::encode_response(&response).unwrap();
        let decoded = JsonCodec::decode_response(&encoded).unwrap();

        assert_eq!(response, decoded);
    }

    #[test]
    fn test_received_at_is_not_sent_when_unset() {
        let response = CallResponse::success("c-2".to_string(), 200, json!(1));
        let encoded = JsonCodec::encode_response(&response).unwrap();
        let text = String::from_utf8(encoded).unwrap();
        assert!(!text.contains("received_at_ms"));
    }

    #[test]
    fn test_complex_arguments() {
        let service = ServiceDescriptor::new("svc", "127.0.0.1", 1);
        let request = CallRequest::new(
            service,
            "complex",
            vec![
                json!({"nested": {"array": [1, 2, 3, "four", null], "flag": true}}),
                json!(42.5),
                json!(null),
            ],
        );

        let encoded = JsonCodec::encode_request(&request).unwrap();
        let decoded = JsonCodec::decode_request(&encoded).unwrap();

        assert_eq!(request, decoded);
    }

    #[test]
    fn test_invalid_data_returns_error() {
        assert!(JsonCodec::decode_request(&[0xFF, 0xFF]).is_err());
        assert!(JsonCodec::decode_response(&[0x00]).is_err());
    }
}

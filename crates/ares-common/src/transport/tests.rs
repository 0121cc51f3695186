//! Integration tests for the transport layer
//!
//! These tests push encoded call messages through real TCP frames.

#[cfg(test)]
mod tests {
    use crate::protocol::{CallRequest, CallResponse, ServiceDescriptor};
    use crate::transport::{JsonCodec, TcpTransport};
    use serde_json::json;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_request_and_response_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // Echo server: answers each request with its first argument
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while let Some(frame) = TcpTransport::receive_message(&mut stream).await.unwrap() {
                let request = JsonCodec::decode_request(&frame).unwrap();
                let value = request.args.first().cloned().unwrap_or(json!(null));
                let response = CallResponse::success(request.id, request.timeout_ms, value);
                let bytes = JsonCodec::encode_response(&response).unwrap();
                TcpTransport::send_message(&mut stream, &bytes).await.unwrap();
            }
        });

        let transport = TcpTransport::new();
        let mut stream = transport.connect(&addr).await.unwrap();

        let service = ServiceDescriptor::new("svc", "127.0.0.1", 1);
        let request = CallRequest::new(service, "echo", vec![json!({"n": 7})]).with_timeout(300);
        let bytes = JsonCodec::encode_request(&request).unwrap();
        TcpTransport::send_message(&mut stream, &bytes).await.unwrap();

        let frame = TcpTransport::receive_message(&mut stream).await.unwrap().unwrap();
        let response = JsonCodec::decode_response(&frame).unwrap();

        assert_eq!(response.id, request.id);
        assert_eq!(response.timeout_ms, 300);
        assert!(response.is_success());
    }
}

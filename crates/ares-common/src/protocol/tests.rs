//! Tests for the protocol module
//!
//! These tests verify request construction, correlation id generation and
//! response handling.

#[cfg(test)]
mod tests {
    use super::super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn service() -> ServiceDescriptor {
        ServiceDescriptor::new("ares.demo.HelloService", "127.0.0.1", 8081).with_timeout(750)
    }

    #[test]
    fn test_request_inherits_service_timeout() {
        let req = CallRequest::new(service(), "sayHello", vec![json!("ares")]);
        assert_eq!(req.method, "sayHello");
        assert_eq!(req.args, vec![json!("ares")]);
        assert_eq!(req.timeout_ms, 750);
    }

    #[test]
    fn test_request_with_timeout_overrides() {
        let req = CallRequest::new(service(), "sayHello", vec![]).with_timeout(50);
        assert_eq!(req.timeout_ms, 50);
        assert_eq!(req.timeout(), std::time::Duration::from_millis(50));
    }

    #[test]
    fn test_correlation_id_uniqueness() {
        let ids: HashSet<_> = (0..1000)
            .map(|_| CallRequest::new(service(), "m", vec![]).id)
            .collect();
        assert_eq!(ids.len(), 1000, "All correlation ids should be unique");
    }

    #[test]
    fn test_response_success() {
        let resp = CallResponse::success("id-1".to_string(), 100, json!({"ok": true}));
        assert!(resp.is_success());
        assert_eq!(resp.outcome, Outcome::Success(json!({"ok": true})));
        assert!(resp.received_at_ms.is_none());
    }

    #[test]
    fn test_response_failure() {
        let resp = CallResponse::failure("id-2".to_string(), 100, FailureKind::MethodNotFound, "nope");
        assert!(!resp.is_success());
        match resp.outcome {
            Outcome::Failure(f) => {
                assert_eq!(f.kind, FailureKind::MethodNotFound);
                assert_eq!(f.message, "nope");
            }
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn test_stamp_received_sets_timestamp() {
        let mut resp = CallResponse::success("id-3".to_string(), 100, json!(null));
        resp.stamp_received();
        assert!(resp.received_at_ms.unwrap() > 0);
    }

    #[test]
    fn test_timeout_error_family() {
        assert!(RpcError::Timeout(5).is_timeout());
        assert!(RpcError::PoolTimeout(5).is_timeout());
        assert!(RpcError::Rejected("busy".into()).is_timeout());
        assert!(!RpcError::Connection("down".into()).is_timeout());
    }

    #[test]
    fn test_into_result_maps_rejection_to_timeout_family() {
        let rejected = CallResponse::failure("id-4".to_string(), 100, FailureKind::Rejected, "busy");
        let err = rejected.into_result().unwrap_err();
        assert!(matches!(err, RpcError::Rejected(ref m) if m == "busy"));
        assert!(err.is_timeout());

        let failed = CallResponse::failure("id-5".to_string(), 100, FailureKind::MethodNotFound, "nope");
        assert!(matches!(failed.into_result(), Err(RpcError::Remote(f)) if f.kind == FailureKind::MethodNotFound));

        let ok = CallResponse::success("id-6".to_string(), 100, json!(3));
        assert_eq!(ok.into_result().unwrap(), json!(3));
    }
}

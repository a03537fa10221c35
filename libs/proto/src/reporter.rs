//! Agent → controller inventory report.
//!
//! The report is a unary call: the agent posts its full local image
//! inventory (never a delta) and the controller replaces its per-node view.
//! The body is a prost-encoded [`ReporterRequest`]; the response is a
//! [`ReporterResponse`] with a status the agent treats as a hard error when
//! not [`ReporterStatus::Ok`].

/// HTTP path of the unary report procedure.
pub const REPORT_PATH: &str = "/lagoon.v1.Reporter/Report";

/// Content type for prost-encoded unary bodies.
pub const CONTENT_TYPE_PROTO: &str = "application/proto";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReporterRequest {
    /// Name of the reporting node.
    #[prost(string, tag = "1")]
    pub node: String,

    /// Full local inventory of qualified image names.
    #[prost(string, repeated, tag = "2")]
    pub image: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReporterResponse {
    #[prost(enumeration = "ReporterStatus", tag = "1")]
    pub status: i32,

    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ReporterStatus {
    Unspecified = 0,
    Ok = 1,
    Error = 2,
}

impl ReporterResponse {
    pub fn ok() -> Self {
        Self {
            status: ReporterStatus::Ok as i32,
            message: "ok".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReporterStatus::Ok as i32
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let request = ReporterRequest {
            node: "node1".to_string(),
            image: vec![
                "docker.io/library/golang:latest".to_string(),
                "docker.io/library/nginx:latest".to_string(),
            ],
        };

        let bytes = request.encode_to_vec();
        let back = ReporterRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_response_status() {
        let response = ReporterResponse::ok();
        assert!(response.is_ok());

        let bytes = response.encode_to_vec();
        let back = ReporterResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(back.status(), ReporterStatus::Ok);
        assert_eq!(back.message, "ok");

        let failed = ReporterResponse {
            status: ReporterStatus::Error as i32,
            message: "node name missing".to_string(),
        };
        assert!(!failed.is_ok());
    }
}

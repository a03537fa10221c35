//! Reporter ingest endpoint.
//!
//! Unary proto-over-HTTP/2 handler the agents post their inventories to.
//! The body is a prost-encoded `ReporterRequest`; the response mirrors the
//! shape back with a status the agent checks.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use lagoon_proto::reporter::{
    ReporterRequest, ReporterResponse, ReporterStatus, CONTENT_TYPE_PROTO,
};
use prost::Message;
use tracing::debug;

use crate::api::AppState;

pub async fn report(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match ReporterRequest::decode(body.as_ref()) {
        Ok(request) => request,
        Err(err) => {
            return proto_response(
                StatusCode::BAD_REQUEST,
                ReporterResponse {
                    status: ReporterStatus::Error as i32,
                    message: format!("malformed report: {err}"),
                },
            );
        }
    };

    if request.node.is_empty() {
        return proto_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            ReporterResponse {
                status: ReporterStatus::Error as i32,
                message: "node name missing".to_string(),
            },
        );
    }

    debug!(
        node = %request.node,
        images = request.image.len(),
        "ingesting inventory report"
    );
    state.node_refs.add_images(&request.node, &request.image);

    proto_response(StatusCode::OK, ReporterResponse::ok())
}

fn proto_response(status: StatusCode, response: ReporterResponse) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, CONTENT_TYPE_PROTO)],
        response.encode_to_vec(),
    )
        .into_response()
}

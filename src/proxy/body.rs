use bytes::{Bytes, BytesMut};
use http::{header, Response, StatusCode};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use thiserror::Error;

/// Body type for every response the proxy produces
pub type ProxyBody = UnsyncBoxBody<Bytes, std::io::Error>;

#[derive(Debug, Error)]
pub enum BodyLimitError {
    #[error("Request body too large: more than {limit} bytes")]
    TooLarge { limit: usize },

    #[error("Failed to read request body: {0}")]
    Read(String),
}

impl BodyLimitError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BodyLimitError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            BodyLimitError::Read(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Collect an inbound body, failing as soon as it exceeds `limit` bytes
pub async fn read_body_with_limit(mut body: Incoming, limit: usize) -> Result<Bytes, BodyLimitError> {
    let mut collected = BytesMut::new();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| BodyLimitError::Read(e.to_string()))?;
        if let Ok(data) = frame.into_data() {
            if collected.len() + data.len() > limit {
                return Err(BodyLimitError::TooLarge { limit });
            }
            collected.extend_from_slice(&data);
        }
    }

    Ok(collected.freeze())
}

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}

/// Plain-text response generated by the proxy itself
pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let mut response = Response::new(full(message.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

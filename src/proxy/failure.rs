use http::StatusCode;
use serde_json::json;

use super::http::codec::HeaderList;
use super::translate::TranslatedRequest;

/// Maps a capture failure to the status code reported to the client:
/// timeouts read as gateway timeouts, connection-level failures as bad
/// gateway, everything else as a plain internal error.
pub fn classify(err: &anyhow::Error) -> StatusCode {
    for cause in err.chain() {
        if cause.is::<tokio::time::error::Elapsed>() {
            return StatusCode::GATEWAY_TIMEOUT;
        }
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            match io_err.kind() {
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected => return StatusCode::BAD_GATEWAY,
                std::io::ErrorKind::TimedOut => return StatusCode::GATEWAY_TIMEOUT,
                _ => {}
            }
        }
    }
    StatusCode::INTERNAL_SERVER_ERROR
}

/// Diagnostic JSON body attached to origin and storage failures, carrying
/// enough of the request to reproduce the capture by hand.
pub fn diagnostic_body(err: &anyhow::Error, request: &TranslatedRequest) -> Vec<u8> {
    let report = json!({
        "error": format!("{err:#}"),
        "url": request.full_url,
        "method": request.method.as_str(),
        "requestHeaders": headers_json(&request.headers),
    });
    serde_json::to_vec_pretty(&report).unwrap_or_else(|_| b"{}".to_vec())
}

fn headers_json(headers: &HeaderList) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .map(|(name, value)| (name.to_string(), json!(value)))
        .collect();
    serde_json::Value::Object(map)
}

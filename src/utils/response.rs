//! Downstream responses written by plugins that terminate a request.

use bytes::Bytes;
use http::{header, StatusCode};
use pingora_error::Result;
use pingora_http::ResponseHeader;
use pingora_proxy::Session;

pub const TEXT_PLAIN: &str = "text/plain";

/// Build a proxy ResponseHeader for plugins
pub fn build_proxy_response(
    status: StatusCode,
    message: Option<&str>,
    headers: Option<&[(&str, &str)]>,
) -> Result<ResponseHeader> {
    let mut resp = ResponseHeader::build(status, None)?;

    if let Some(msg) = message {
        resp.insert_header(header::CONTENT_LENGTH, msg.len().to_string())?;
        resp.insert_header(header::CONTENT_TYPE, TEXT_PLAIN)?;
    }

    if let Some(hdrs) = headers {
        for (name, value) in hdrs {
            resp.insert_header(name.to_string(), value.to_string())?;
        }
    }

    Ok(resp)
}

/// Send a terminating error response from a plugin
pub async fn send_proxy_error(
    session: &mut Session,
    status: StatusCode,
    message: Option<&str>,
    headers: Option<&[(&str, &str)]>,
) -> Result<()> {
    let resp = build_proxy_response(status, message, headers)?;
    session
        .write_response_header(Box::new(resp), message.is_none())
        .await?;

    if let Some(msg) = message {
        session
            .write_response_body(Some(Bytes::copy_from_slice(msg.as_bytes())), true)
            .await?;
    }

    Ok(())
}

//! Request headers for the event stream.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::ServerConfig;
use crate::error::TransportError;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CACHE_CONTROL: &str = "cache-control";
pub const HEADER_REQUESTED_WITH: &str = "x-requested-with";
pub const HEADER_AUTHORIZATION: &str = "authorization";

/// Build the header set for the streaming GET.
///
/// Extra headers from the config are applied last and may override the
/// defaults.
///
/// # Errors
/// Returns `TransportError::InvalidHeader` for names or values that are not
/// valid HTTP.
pub fn build_headers(config: &ServerConfig) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    insert(&mut headers, HEADER_ACCEPT, "text/event-stream")?;
    insert(&mut headers, HEADER_CACHE_CONTROL, "no-cache")?;
    insert(&mut headers, HEADER_REQUESTED_WITH, "XMLHttpRequest")?;

    if let Some(authorization) = config.authorization() {
        insert(&mut headers, HEADER_AUTHORIZATION, &authorization)?;
    }

    for (name, value) in &config.extra_headers {
        insert(&mut headers, &name.trim().to_ascii_lowercase(), value.trim())?;
    }

    Ok(headers)
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), TransportError> {
    let header_name =
        HeaderName::from_bytes(name.as_bytes()).map_err(|e| TransportError::InvalidHeader {
            name: name.to_owned(),
            reason: e.to_string(),
        })?;
    let header_value = HeaderValue::from_str(value).map_err(|e| TransportError::InvalidHeader {
        name: name.to_owned(),
        reason: e.to_string(),
    })?;
    headers.insert(header_name, header_value);
    Ok(())
}

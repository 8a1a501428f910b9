use axum::http::HeaderMap;

pub mod health;
pub mod security;

/// Client address for lockout accounting. Prefers the first hop recorded by
/// the edge proxy, since the socket peer is the proxy itself.
pub(crate) fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|val| val.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|val| val.to_str().ok())
        .map_or_else(|| "unknown".to_string(), |ip| ip.trim().to_string())
}

pub(crate) fn user_agent(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|val| val.to_str().ok())
}

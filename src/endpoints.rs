use url::Url;

use crate::error::ConnectionError;

pub const AGENT_SOCKET_PATH: &str = "/v1/ws/agent";
pub const UPLOAD_PATH: &str = "/v1/agent/upload-model";

/// WebSocket url of the agent endpoint, carrying the api key as `api_key`.
///
/// `http://` and `https://` server addresses are accepted and mapped to
/// `ws://` and `wss://`. A path prefix on the server address is kept.
pub fn agent_socket_url(server_url: &str, api_key: &str) -> Result<Url, ConnectionError> {
    let mut url = with_scheme(server_url, |scheme| match scheme {
        "ws" | "http" => Some("ws"),
        "wss" | "https" => Some("wss"),
        _ => None,
    })?;
    append_path(&mut url, AGENT_SOCKET_PATH);
    url.query_pairs_mut().clear().append_pair("api_key", api_key);
    Ok(url)
}

/// HTTP url of the artifact upload endpoint on the same server.
pub fn upload_url(server_url: &str) -> Result<Url, ConnectionError> {
    let mut url = with_scheme(server_url, |scheme| match scheme {
        "ws" | "http" => Some("http"),
        "wss" | "https" => Some("https"),
        _ => None,
    })?;
    append_path(&mut url, UPLOAD_PATH);
    url.set_query(None);
    Ok(url)
}

fn with_scheme(
    server_url: &str,
    map: impl Fn(&str) -> Option<&'static str>,
) -> Result<Url, ConnectionError> {
    let mut url = Url::parse(server_url.trim())
        .map_err(|err| ConnectionError::InvalidUrl(format!("{server_url}: {err}")))?;
    let scheme = map(url.scheme()).ok_or_else(|| {
        ConnectionError::InvalidUrl(format!("{server_url}: unsupported scheme {}", url.scheme()))
    })?;
    url.set_scheme(scheme)
        .map_err(|_| ConnectionError::InvalidUrl(format!("{server_url}: cannot use {scheme}")))?;
    Ok(url)
}

fn append_path(url: &mut Url, suffix: &str) {
    let prefix = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{prefix}{suffix}"));
}

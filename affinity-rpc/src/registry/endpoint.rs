//! Endpoint URIs of the form `scheme://host:port`.

use url::Url;

use crate::error::{Error, Result};

pub fn new(scheme: &str, host: &str) -> String {
    format!("{scheme}://{host}")
}

/// Returns the `host:port` of the first endpoint using `scheme`.
///
/// Blank entries are skipped; `Ok(None)` means no endpoint uses the scheme.
/// A malformed endpoint aborts the scan with a config error.
pub fn parse_endpoint(endpoints: &[String], scheme: &str) -> Result<Option<String>> {
    for raw in endpoints {
        if raw.trim().is_empty() {
            continue;
        }
        let url = Url::parse(raw)
            .map_err(|err| Error::Config(format!("bad endpoint '{raw}': {err}")))?;
        if url.scheme() != scheme {
            continue;
        }
        let Some(host) = url.host_str() else {
            return Ok(None);
        };
        return Ok(Some(match url.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }));
    }
    Ok(None)
}

/// Returns the first raw endpoint whose scheme is `scheme`.
pub fn find<'a>(endpoints: &'a [String], scheme: &str) -> Option<&'a str> {
    endpoints
        .iter()
        .filter_map(|raw| Url::parse(raw).ok().map(|url| (raw, url)))
        .find(|(_, url)| url.scheme() == scheme)
        .map(|(raw, _)| raw.as_str())
}

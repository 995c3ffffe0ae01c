use crate::{CancelToken, ImageProvider, ProviderError};
use std::io::Read;
use wasmxds_schema::{BackendKind, ProviderKey};

const READ_CHUNK: usize = 64 * 1024;

/// Read a response body to the end, checking `cancel` between chunks.
pub(crate) fn read_body(
    mut reader: impl Read,
    cancel: &CancelToken,
    location: &str,
) -> Result<Vec<u8>, ProviderError> {
    let mut body = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        cancel.check()?;
        let n = reader
            .read(&mut chunk)
            .map_err(|e| ProviderError::fetch_failed(location, e))?;
        if n == 0 {
            return Ok(body);
        }
        body.extend_from_slice(&chunk[..n]);
    }
}

/// Issue one GET and return the body of a 2xx response.
pub(crate) fn get(
    agent: &ureq::Agent,
    url: &str,
    location: &str,
    cancel: &CancelToken,
) -> Result<Vec<u8>, ProviderError> {
    cancel.check()?;
    tracing::debug!("GET {url}");
    let resp = match agent.get(url).call() {
        Ok(r) => r,
        Err(ureq::Error::StatusCode(code)) => {
            return Err(ProviderError::fetch_failed(
                location,
                format!("HTTP {code} for {url}"),
            ));
        }
        Err(e) => return Err(ProviderError::fetch_failed(location, e)),
    };

    let code = resp.status().as_u16();
    if !(200..300).contains(&code) {
        return Err(ProviderError::fetch_failed(
            location,
            format!("HTTP {code} for {url}"),
        ));
    }
    read_body(resp.into_body().into_reader(), cancel, location)
}

/// Plain HTTP provider. Locations are `host[:port]/path`; the scheme comes
/// from the provider, never from the location.
pub struct HttpProvider {
    agent: ureq::Agent,
}

impl HttpProvider {
    pub fn new() -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
        }
    }
}

impl Default for HttpProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageProvider for HttpProvider {
    fn fetch(&self, cancel: &CancelToken, location: &str) -> Result<Vec<u8>, ProviderError> {
        get(&self.agent, &format!("http://{location}"), location, cancel)
    }

    fn provider_key(&self) -> ProviderKey {
        ProviderKey::new(BackendKind::Http.as_str())
    }
}

/// HTTPS provider.
///
/// `insecure` disables server certificate verification. Only for test and
/// constrained environments.
pub struct HttpsProvider {
    agent: ureq::Agent,
}

impl HttpsProvider {
    pub fn new(insecure: bool) -> Self {
        if insecure {
            tracing::warn!("HTTPS provider accepts unverified server certificates");
        }
        let tls = ureq::tls::TlsConfig::builder()
            .disable_verification(insecure)
            .build();
        let config = ureq::Agent::config_builder().tls_config(tls).build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

impl ImageProvider for HttpsProvider {
    fn fetch(&self, cancel: &CancelToken, location: &str) -> Result<Vec<u8>, ProviderError> {
        get(&self.agent, &format!("https://{location}"), location, cancel)
    }

    fn provider_key(&self) -> ProviderKey {
        ProviderKey::new(BackendKind::Https.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockResponse, MockServer};

    #[test]
    fn http_fetch_returns_body() {
        let server = MockServer::start(|req| {
            if req.path == "/filters/a.wasm" {
                MockResponse::ok(vec![1u8, 2])
            } else {
                MockResponse::status(404)
            }
        });
        let provider = HttpProvider::new();
        let bytes = provider
            .fetch(&CancelToken::new(), &format!("{}/filters/a.wasm", server.addr))
            .unwrap();
        assert_eq!(bytes, vec![1, 2]);
        assert_eq!(server.requests()[0].method, "GET");
    }

    #[test]
    fn http_non_2xx_is_fetch_failed() {
        let server = MockServer::start(|_| MockResponse::status(404));
        let err = HttpProvider::new()
            .fetch(&CancelToken::new(), &format!("{}/missing.wasm", server.addr))
            .unwrap_err();
        match err {
            ProviderError::FetchFailed { reason, .. } => assert!(reason.contains("404"), "{reason}"),
            other => panic!("expected FetchFailed, got {other:?}"),
        }
    }

    #[test]
    fn http_connection_refused_is_fetch_failed() {
        let err = HttpProvider::new()
            .fetch(&CancelToken::new(), "127.0.0.1:1/a.wasm")
            .unwrap_err();
        assert!(matches!(err, ProviderError::FetchFailed { .. }), "{err}");
    }

    #[test]
    fn cancelled_fetch_makes_no_request() {
        let server = MockServer::start(|_| MockResponse::ok(vec![0u8]));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = HttpProvider::new()
            .fetch(&cancel, &format!("{}/a.wasm", server.addr))
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
        assert!(server.requests().is_empty());
    }

    #[test]
    fn large_body_is_read_completely() {
        let payload: Vec<u8> = (0..300_000).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let server = MockServer::start(move |_| MockResponse::ok(payload.clone()));
        let bytes = HttpProvider::new()
            .fetch(&CancelToken::new(), &format!("{}/big.wasm", server.addr))
            .unwrap();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn provider_keys_match_backend_kinds() {
        assert_eq!(HttpProvider::new().provider_key(), "http");
        assert_eq!(HttpsProvider::new(false).provider_key(), "https");
    }

    #[test]
    fn https_connection_refused_is_fetch_failed() {
        let err = HttpsProvider::new(false)
            .fetch(&CancelToken::new(), "127.0.0.1:1/a.wasm")
            .unwrap_err();
        assert!(matches!(err, ProviderError::FetchFailed { .. }), "{err}");
    }
}

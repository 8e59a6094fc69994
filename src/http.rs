//! HTTPS client shared by the rewrite and webhook clients.

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use log::warn;

type HttpsConn = hyper_rustls::HttpsConnector<HttpConnector>;
pub type HttpClient = Client<HttpsConn, Full<Bytes>>;

/// A fully read response.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Builds a client trusting the platform's native roots, or the bundled webpki
/// roots when the platform store cannot be loaded.
///
/// Debug builds also accept plain `http://` URLs so local fakes can stand in for
/// the real endpoints.
pub fn build_client() -> HttpClient {
    let connector = match HttpsConnectorBuilder::new().with_native_roots() {
        Ok(builder) => builder,
        Err(e) => {
            warn!("Native root certificates unavailable ({}), using webpki roots", e);
            HttpsConnectorBuilder::new().with_webpki_roots()
        }
    };
    #[cfg(debug_assertions)]
    let connector = connector.https_or_http();
    #[cfg(not(debug_assertions))]
    let connector = connector.https_only();
    let https = connector.enable_http1().build();

    Client::builder(TokioExecutor::new()).build(https)
}

/// `name/version` of this crate, sent as `User-Agent`.
pub fn user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// POSTs a JSON document and reads the whole response body.
///
/// Only transport-level failures are errors; any status code is returned to the
/// caller for interpretation.
pub async fn post_json(
    client: &HttpClient,
    url: &str,
    bearer: Option<&str>,
    json_body: String,
) -> Result<HttpResponse> {
    let mut builder = Request::builder()
        .method(hyper::Method::POST)
        .uri(url)
        .header("content-type", "application/json")
        .header("user-agent", user_agent());
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let request = builder
        .body(Full::new(Bytes::from(json_body)))
        .with_context(|| format!("Failed to build request for {}", url))?;

    let response = client
        .request(request)
        .await
        .with_context(|| format!("Request to {} failed", url))?;
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .with_context(|| format!("Failed to read response body from {}", url))?
        .to_bytes();

    Ok(HttpResponse { status, body })
}

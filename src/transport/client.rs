use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, Uri};
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{VgateError, VgateResult};

/// Shared hyper client with connection pooling (HTTP/HTTPS via rustls)
///
/// - Single client instance reused across requests to enable pooling
/// - Supports both http and https backends
static SHARED_CLIENT: Lazy<Arc<Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>>> =
    Lazy::new(|| Arc::new(build_client()));

fn build_client() -> Client<hyper_rustls::HttpsConnector<HttpConnector>, Body> {
    let mut http = HttpConnector::new();
    http.enforce_http(false); // allow absolute-form URIs
    http.set_nodelay(true);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(32)
        .build::<_, Body>(https)
}

pub fn shared_client() -> Arc<Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>> {
    Arc::clone(&SHARED_CLIENT)
}

/// Lightweight GET returning only the status code, used by health probes.
/// The timeout covers connect plus first response byte.
pub async fn get_status(url: &str, timeout: Duration) -> VgateResult<hyper::StatusCode> {
    let uri: Uri = url.parse()?;
    let req = Request::builder()
        .method(hyper::Method::GET)
        .uri(uri)
        .body(Body::empty())?;

    let client = shared_client();
    let resp = tokio::time::timeout(timeout, client.request(req))
        .await
        .map_err(|_| VgateError::network(format!("probe timed out after {:?}", timeout)))??;
    Ok(resp.status())
}

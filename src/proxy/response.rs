use anyhow::{Context, Result, anyhow};
use rama::http::{Body, Response, StatusCode, header};
use serde::Serialize;
use serde_json::json;
use tokio_util::io::ReaderStream;

use crate::{
    cache::Tarball,
    config::Config,
    error::ProxyError,
    registry::PackageDocument,
};

/// Responds with JSON content
pub fn respond_json<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<Body>> {
    let encoded = serde_json::to_vec(body).context("encoding json response")?;
    Response::builder()
        .status(status)
        .header(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json; charset=utf-8"),
        )
        .header(header::CONTENT_LENGTH, encoded.len())
        .body(Body::from(encoded))
        .map_err(Into::into)
}

/// `{"error": message}` with the given status.
pub fn respond_error(status: StatusCode, message: &str) -> Result<Response<Body>> {
    respond_json(status, &json!({ "error": message }))
}

/// Maps a core failure to its client-visible outcome.
pub fn respond_proxy_error(err: &ProxyError) -> Result<Response<Body>> {
    match err {
        ProxyError::UpstreamUnavailable(message) => {
            respond_error(StatusCode::BAD_GATEWAY, &format!("upstream unavailable: {message}"))
        }
        ProxyError::Unauthorized => respond_error(StatusCode::UNAUTHORIZED, "invalid credentials"),
        ProxyError::BadRequest(message) => respond_error(StatusCode::BAD_REQUEST, message),
        ProxyError::Storage(_) => {
            respond_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// A package document with its validator and freshness headers.
pub fn respond_document(
    document: &PackageDocument,
    etag: &str,
    cache_control: &str,
) -> Result<Response<Body>> {
    let encoded = serde_json::to_vec(document).context("encoding package document")?;
    let mut builder = Response::builder().status(StatusCode::OK);
    {
        let headers = builder
            .headers_mut()
            .ok_or_else(|| anyhow!("failed to get headers for document response"))?;
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json; charset=utf-8"),
        );
        headers.insert(
            header::CONTENT_LENGTH,
            header::HeaderValue::from_str(&encoded.len().to_string())?,
        );
        headers.insert(header::ETAG, header::HeaderValue::from_str(etag)?);
        headers.insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_str(cache_control)?,
        );
    }
    builder.body(Body::from(encoded)).map_err(Into::into)
}

/// 304 with no body.
pub fn respond_not_modified(etag: Option<&str>) -> Result<Response<Body>> {
    let mut builder = Response::builder().status(StatusCode::NOT_MODIFIED);
    if let Some(etag) = etag {
        builder = builder.header(header::ETAG, header::HeaderValue::from_str(etag)?);
    }
    builder.body(Body::empty()).map_err(Into::into)
}

/// Streams a stored tarball, declaring its length up front.
pub fn respond_tarball(tarball: Tarball, cache_control: &str) -> Result<Response<Body>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/octet-stream"),
        )
        .header(header::CONTENT_LENGTH, tarball.size)
        .header(header::CACHE_CONTROL, header::HeaderValue::from_str(cache_control)?)
        .body(Body::from_stream(ReaderStream::new(tarball.file)))
        .map_err(Into::into)
}

/// Responds with the homepage HTML
pub fn respond_homepage(config: &Config) -> Result<Response<Body>> {
    let upstream = html_escape(config.upstream.url.as_str());
    let body = format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <title>elephant</title>
    <style>
      body {{
        margin: 0;
        min-height: 100vh;
        display: flex;
        align-items: center;
        justify-content: center;
        font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", sans-serif;
      }}
      main {{
        max-width: 640px;
        padding: 3rem;
      }}
      code {{
        padding: 0.2rem 0.45rem;
        border-radius: 8px;
        background: rgba(127, 127, 127, 0.2);
      }}
    </style>
  </head>
  <body>
    <main>
      <h1>elephant</h1>
      <p>A caching proxy for <code>{upstream}</code>.</p>
      <p>Point npm at this host:</p>
      <p><code>npm config set registry http://{host}/</code></p>
    </main>
  </body>
</html>
"#,
        host = html_escape(&config.server.fallback_public_host()),
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/html; charset=utf-8"),
        )
        .header(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-cache"),
        )
        .body(Body::from(body))
        .map_err(Into::into)
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rama::http::body::util::BodyExt;

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn error_body_is_json() {
        let response = respond_error(StatusCode::NOT_FOUND, "no tarball found").unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json; charset=utf-8"
        );
        assert_eq!(body_json(response).await, json!({ "error": "no tarball found" }));
    }

    #[tokio::test]
    async fn proxy_errors_map_to_statuses() {
        let cases = [
            (ProxyError::upstream("timed out"), StatusCode::BAD_GATEWAY),
            (ProxyError::Unauthorized, StatusCode::UNAUTHORIZED),
            (ProxyError::bad_request("bad json"), StatusCode::BAD_REQUEST),
            (
                ProxyError::Storage(anyhow!("disk full")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(respond_proxy_error(&err).unwrap().status(), status);
        }
    }

    #[tokio::test]
    async fn storage_details_are_not_leaked() {
        let response = respond_proxy_error(&ProxyError::Storage(anyhow!("/secret/path"))).unwrap();
        assert_eq!(body_json(response).await, json!({ "error": "internal error" }));
    }

    #[test]
    fn document_response_carries_validator_headers() {
        let document = PackageDocument::from_slice(br#"{"name":"lodash"}"#).unwrap();
        let response = respond_document(&document, "\"v1\"", "public, max-age=300").unwrap();
        assert_eq!(response.headers().get(header::ETAG).unwrap(), "\"v1\"");
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "public, max-age=300"
        );
    }

    #[tokio::test]
    async fn not_modified_has_empty_body() {
        let response = respond_not_modified(Some("\"v1\"")).unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.is_empty());
    }

    #[test]
    fn homepage_escapes_config_values() {
        let mut config = Config::default();
        config.server.public_host = Some("<script>".to_string());
        let response = respond_homepage(&config).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(html_escape("<a href=\"x\">&</a>"), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
    }
}

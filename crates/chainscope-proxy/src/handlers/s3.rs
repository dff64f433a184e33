//! S3 reverse proxy with AWS SigV4 request signing.
//!
//! Sandbox code talks plain HTTP to `/s3/…`; the handler strips any inbound
//! `Authorization`, re-signs the request with the bucket credentials
//! (unsigned payload, so bodies stream through), and forwards it to the
//! configured endpoint.

use std::time::{Duration, SystemTime};

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
    sign, PayloadChecksumKind, PercentEncodingMode, SignableBody, SignableRequest,
    SigningSettings, UriPathNormalizationMode,
};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use axum::extract::Request;
use axum::response::Response;
use http::StatusCode;

use super::{error_response, relay_response, scrub_request_headers};

/// S3 target settings. Credentials live only in the proxy process.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3-compatible endpoint URL.
    pub endpoint: String,
    /// Access key.
    pub access_key: String,
    /// Secret key.
    pub secret_key: String,
    /// Bucket name (surfaced through discovery).
    pub bucket: String,
    /// Signing region.
    pub region: String,
    /// Public URL prefix for uploaded objects.
    pub public_url_prefix: Option<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

/// Signing reverse proxy for a single S3 endpoint.
pub struct S3Handler {
    cfg: S3Config,
    endpoint: Option<String>,
    client: reqwest::Client,
}

impl S3Handler {
    /// Build a handler. An unparseable endpoint marks the target
    /// unconfigured (500 on use) instead of failing startup.
    pub fn new(cfg: S3Config) -> Self {
        let endpoint = match reqwest::Url::parse(&cfg.endpoint) {
            Ok(url) => Some(url.to_string().trim_end_matches('/').to_string()),
            Err(err) => {
                tracing::error!(
                    endpoint = %cfg.endpoint,
                    error = %err,
                    "S3 endpoint failed to parse; target marked unconfigured"
                );
                None
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .expect("reqwest client construction cannot fail with static options");

        Self {
            cfg,
            endpoint,
            client,
        }
    }

    /// The configured bucket name.
    pub fn bucket(&self) -> &str {
        &self.cfg.bucket
    }

    /// Public URL for an uploaded object: the configured prefix when
    /// present, otherwise `endpoint/bucket/key`.
    pub fn public_url(&self, key: &str) -> String {
        match &self.cfg.public_url_prefix {
            Some(prefix) if !prefix.is_empty() => {
                format!("{}/{key}", prefix.trim_end_matches('/'))
            }
            _ => format!(
                "{}/{}/{key}",
                self.cfg.endpoint.trim_end_matches('/'),
                self.cfg.bucket
            ),
        }
    }

    /// Forward one request, re-signed.
    pub async fn handle(&self, req: Request) -> Response {
        let Some(endpoint) = &self.endpoint else {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "datasource misconfigured");
        };

        let path = req.uri().path();
        let stripped = path.strip_prefix("/s3").unwrap_or(path);
        let mut url = format!("{endpoint}{stripped}");
        if let Some(query) = req.uri().query() {
            url.push('?');
            url.push_str(query);
        }

        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;
        // Any inbound Authorization (the proxy bearer token) must not reach
        // the signer or the upstream.
        scrub_request_headers(&mut headers);

        let signed = match self.signed_headers(&parts.method, &url, &headers) {
            Ok(signed) => signed,
            Err(err) => {
                tracing::error!(error = %err, "S3 request signing failed");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "request signing failed");
            }
        };

        let result = self
            .client
            .request(parts.method.clone(), &url)
            .headers(signed)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await;

        match result {
            Ok(upstream) => relay_response(upstream),
            Err(err) => {
                tracing::warn!(error = %err, "S3 upstream request failed");
                error_response(StatusCode::BAD_GATEWAY, "upstream request failed")
            }
        }
    }

    /// Produce the header set for the outgoing request: the forwarded
    /// headers plus `host` and the SigV4 signature headers.
    fn signed_headers(
        &self,
        method: &http::Method,
        url: &str,
        headers: &http::HeaderMap,
    ) -> Result<http::HeaderMap, anyhow::Error> {
        let parsed = reqwest::Url::parse(url)?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => anyhow::bail!("S3 URL has no host: {url}"),
        };

        let mut to_sign = headers.clone();
        to_sign.insert(http::header::HOST, host.parse()?);

        let mut settings = SigningSettings::default();
        settings.percent_encoding_mode = PercentEncodingMode::Single;
        settings.payload_checksum_kind = PayloadChecksumKind::XAmzSha256;
        settings.uri_path_normalization_mode = UriPathNormalizationMode::Disabled;

        let identity: Identity = Credentials::new(
            self.cfg.access_key.clone(),
            self.cfg.secret_key.clone(),
            None,
            None,
            "chainscope-proxy",
        )
        .into();

        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.cfg.region)
            .name("s3")
            .time(SystemTime::now())
            .settings(settings)
            .build()
            .map_err(|e| anyhow::anyhow!("building signing params: {e}"))?;

        let header_pairs: Vec<(&str, &str)> = to_sign
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
            .collect();

        let signable = SignableRequest::new(
            method.as_str(),
            url,
            header_pairs.into_iter(),
            SignableBody::UnsignedPayload,
        )
        .map_err(|e| anyhow::anyhow!("building signable request: {e}"))?;

        let (instructions, _signature) = sign(signable, &params.into())
            .map_err(|e| anyhow::anyhow!("signing request: {e}"))?
            .into_parts();

        let mut request = http::Request::builder().method(method).uri(url).body(())?;
        *request.headers_mut() = to_sign;
        instructions.apply_to_request_http1x(&mut request);

        Ok(request.headers().clone())
    }
}

//! Streaming request forwarding to self-hosted clusters.

use axum::body::Body;
use axum::http::{HeaderMap, Method};
use axum::response::Response;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use reqwest::{Certificate, Client, Identity, Url};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use super::hmac::apply_signature;
use crate::config::{ConfigError, Secret};
use crate::error::{Error, Result};

/// Overall timeout for forwarded calls. Generation can take a long time.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(120);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 100;

/// Request headers that are never copied to the upstream.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "te",
    "upgrade",
    "authorization",
];

/// Response headers describing the upstream hop rather than the payload.
const HOP_BY_HOP_RESPONSE_HEADERS: &[&str] = &["connection", "transfer-encoding", "upgrade"];

/// Dedicated transport for a cluster using client certificates.
struct MtlsTransport {
    client: Client,
    /// Host the request URL is rewritten to, so the TLS server name is the
    /// cluster name while the socket still goes to the configured endpoint.
    server_name: String,
}

/// Forwards canonical requests to clusters with their configured credentials.
///
/// Clusters without mTLS share one pooled client; each mTLS cluster gets its
/// own client carrying its identity.
pub struct Forwarder {
    client: Client,
    hmac_secrets: DashMap<String, Secret>,
    mtls: DashMap<String, MtlsTransport>,
}

fn builder() -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(FORWARD_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .no_gzip()
}

impl Forwarder {
    pub fn new() -> Result<Self> {
        let client = builder()
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            hmac_secrets: DashMap::new(),
            mtls: DashMap::new(),
        })
    }

    /// Sign every request to `target` with `secret`.
    pub fn set_hmac(&self, target: &str, secret: Secret) {
        self.hmac_secrets.insert(target.to_string(), secret);
    }

    /// Give `target` a dedicated transport presenting the certificate/key pair.
    ///
    /// The endpoint's address is resolved once, here. Requests then connect to
    /// that address while presenting and verifying `target` as the TLS server
    /// name. Certificates in `ca_file` are trusted next to the built-in roots.
    pub async fn set_mtls(
        &self,
        target: &str,
        endpoint: &str,
        cert_file: &Path,
        key_file: &Path,
        ca_file: Option<&Path>,
    ) -> std::result::Result<(), ConfigError> {
        let tls_err = |message: String| ConfigError::Tls {
            cluster: target.to_string(),
            message,
        };

        let mut pem = tokio::fs::read(cert_file)
            .await
            .map_err(|e| tls_err(format!("cannot read {}: {}", cert_file.display(), e)))?;
        let key = tokio::fs::read(key_file)
            .await
            .map_err(|e| tls_err(format!("cannot read {}: {}", key_file.display(), e)))?;
        pem.push(b'\n');
        pem.extend_from_slice(&key);

        let identity = Identity::from_pem(&pem).map_err(|e| tls_err(e.to_string()))?;

        let roots = match ca_file {
            Some(path) => {
                let pem = tokio::fs::read(path)
                    .await
                    .map_err(|e| tls_err(format!("cannot read {}: {}", path.display(), e)))?;
                Certificate::from_pem_bundle(&pem).map_err(|e| tls_err(e.to_string()))?
            }
            None => Vec::new(),
        };

        let url = Url::parse(endpoint).map_err(|e| tls_err(format!("invalid endpoint: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| tls_err("endpoint has no host".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| tls_err("endpoint has no port".to_string()))?;

        let mut named = url.clone();
        named
            .set_host(Some(target))
            .map_err(|e| tls_err(format!("cluster name is not a valid TLS server name: {}", e)))?;

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| tls_err(format!("cannot resolve {}: {}", host, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(tls_err(format!("{} resolved to no addresses", host)));
        }

        let client = roots
            .into_iter()
            .fold(builder().use_rustls_tls(), |b, root| b.add_root_certificate(root))
            .identity(identity)
            .resolve_to_addrs(target, &addrs)
            .build()
            .map_err(|e| tls_err(e.to_string()))?;

        self.mtls.insert(
            target.to_string(),
            MtlsTransport {
                client,
                server_name: target.to_string(),
            },
        );
        tracing::info!(cluster = %target, endpoint = %endpoint, "Configured mTLS transport");
        Ok(())
    }

    pub fn has_hmac(&self, target: &str) -> bool {
        self.hmac_secrets.contains_key(target)
    }

    pub fn has_mtls(&self, target: &str) -> bool {
        self.mtls.contains_key(target)
    }

    /// Forward a request to `endpoint` on behalf of `target`.
    ///
    /// Status and headers come back verbatim and the body is streamed as it
    /// arrives. Dropping the returned body drops the upstream connection.
    pub async fn forward(
        &self,
        target: &str,
        endpoint: &str,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response> {
        let raw_url = format!("{}{}", endpoint.trim_end_matches('/'), path_and_query);
        let mut url = Url::parse(&raw_url)
            .map_err(|e| Error::Internal(format!("Invalid upstream URL '{}': {}", raw_url, e)))?;

        // Clone the client out so no map guard is held across the request.
        let client = match self.mtls.get(target) {
            Some(transport) => {
                url.set_host(Some(&transport.server_name)).map_err(|e| {
                    Error::Internal(format!("Invalid TLS server name '{}': {}", target, e))
                })?;
                transport.client.clone()
            }
            None => self.client.clone(),
        };

        let mut outbound = headers.clone();
        for name in STRIPPED_REQUEST_HEADERS {
            outbound.remove(*name);
        }

        if let Some(secret) = self.hmac_secrets.get(target) {
            let path = path_and_query.split('?').next().unwrap_or_default();
            apply_signature(
                &mut outbound,
                secret.expose_secret().as_bytes(),
                chrono::Utc::now().timestamp(),
                method.as_str(),
                path,
                &body,
            )?;
        }

        let upstream = client
            .request(method, url)
            .headers(outbound)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                let err = Error::upstream(target, e);
                tracing::error!(cluster = %target, error = %err, "Failed to forward request");
                err
            })?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        for name in HOP_BY_HOP_RESPONSE_HEADERS {
            response_headers.remove(*name);
        }

        let target_name = target.to_string();
        let stream = upstream.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| {
                tracing::error!(cluster = %target_name, error = %e, "Error streaming from cluster");
                std::io::Error::other(e)
            })
        });

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

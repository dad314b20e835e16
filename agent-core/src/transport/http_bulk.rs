//! Elasticsearch-style bulk HTTP indexer transport (§4.6). Each batch
//! becomes one newline-delimited bulk request: an `index` action line
//! followed by a document line, per event. Built on raw `hyper` rather
//! than a higher-level HTTP client, mirroring how this crate already
//! wraps sockets in `TokioIo` elsewhere instead of pulling in a second
//! client stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::json;
use tracing::warn;

use crate::error::TransportError;
use crate::event::Event;
use crate::output::Transport;

#[derive(Debug, Clone)]
pub struct HttpBulkConfig {
    pub endpoint: String,
    pub index_pattern: String,
    pub basic_auth: Option<(String, String)>,
    pub timeout: Duration,
}

impl Default for HttpBulkConfig {
    fn default() -> Self {
        HttpBulkConfig {
            endpoint: "http://localhost:9200/_bulk".into(),
            index_pattern: "logstash-%Y.%m.%d".into(),
            basic_auth: None,
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct HttpBulkTransport {
    config: HttpBulkConfig,
    client: Client<HttpConnector, Full<Bytes>>,
    ready: AtomicBool,
}

impl HttpBulkTransport {
    pub fn new(config: HttpBulkConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        HttpBulkTransport { config, client, ready: AtomicBool::new(false) }
    }

    fn index_name(&self) -> String {
        chrono::Local::now().format(&self.config.index_pattern).to_string()
    }

    fn bulk_body(&self, batch: &[Event]) -> String {
        let index = self.index_name();
        let mut body = String::new();
        for event in batch {
            let doc_type = match event.kind {
                crate::event::Kind::Log => "log",
                crate::event::Kind::Metric => "metric",
            };
            let id = BASE64.encode(uuid::Uuid::new_v4().as_bytes());
            let action = json!({ "index": { "_index": index, "_type": doc_type, "_id": id } });
            body.push_str(&action.to_string());
            body.push('\n');

            let doc = json!({
                "state": event.state,
                "service": event.service,
                "host": event.host,
                "description": event.description,
                "metric": event.metric,
                "tags": event.tags,
                "attributes": event.attributes,
                "time": event.time,
                "ttl": event.ttl,
            });
            body.push_str(&doc.to_string());
            body.push('\n');
        }
        body.pop();
        body
    }

    fn build_request(&self, body: String) -> Result<Request<Full<Bytes>>, TransportError> {
        let uri: Uri = self
            .config
            .endpoint
            .parse()
            .map_err(|_| TransportError::Fatal(format!("invalid endpoint {:?}", self.config.endpoint)))?;

        let mut builder = Request::post(uri).header(CONTENT_TYPE, "application/x-ndjson");

        if let Some((user, pass)) = &self.config.basic_auth {
            let token = BASE64.encode(format!("{user}:{pass}"));
            builder = builder.header(AUTHORIZATION, format!("Basic {token}"));
        }

        builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|err| TransportError::Fatal(err.to_string()))
    }
}

#[async_trait]
impl Transport for HttpBulkTransport {
    async fn connect(&self) {
        // A connection pool has nothing to pre-establish; readiness for
        // the HTTP transport means only "configured with a parseable
        // endpoint", checked once up front so bad config fails fast.
        self.ready.store(self.config.endpoint.parse::<Uri>().is_ok(), Ordering::SeqCst);
    }

    async fn send(&self, batch: Vec<Event>) -> Result<(), TransportError> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = self.bulk_body(&batch);
        let request = self.build_request(body)?;

        let response = tokio::time::timeout(self.config.timeout, self.client.request(request))
            .await
            .map_err(|_| TransportError::Fatal("bulk request timed out".into()))?
            .map_err(|err| TransportError::Fatal(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let _ = drain(response.into_body()).await;
            warn!(status = %status, "bulk indexer rejected batch");
            return Err(TransportError::BadStatus(status.as_u16()));
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn pressure(&self) -> i64 {
        0
    }

    async fn stop(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }
}

async fn drain(body: Incoming) -> Result<Bytes, hyper::Error> {
    Ok(body.collect().await?.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_body_pairs_action_and_doc_lines() {
        let transport = HttpBulkTransport::new(HttpBulkConfig::default());
        let body = transport.bulk_body(&[Event::metric("svc", "host", 1.0)]);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"index\""));
        assert!(lines[1].contains("\"svc\""));
    }

    #[tokio::test]
    async fn connect_rejects_unparseable_endpoint() {
        let transport =
            HttpBulkTransport::new(HttpBulkConfig { endpoint: "::not a uri::".into(), ..HttpBulkConfig::default() });
        transport.connect().await;
        assert!(!transport.is_ready());
    }

    #[test]
    fn pressure_is_always_zero() {
        let transport = HttpBulkTransport::new(HttpBulkConfig::default());
        assert_eq!(transport.pressure(), 0);
    }
}

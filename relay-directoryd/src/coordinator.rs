//! Replication between partner directories.
//!
//! Every partner holds the same signing key. Outbound deltas are encoded, signed and
//! pushed to each partner by a small worker pool fed from an unbounded queue, so the
//! registration path never waits on a partner. Inbound deltas are authenticated
//! against the shared key before they are decoded and merged.

use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use shared::protocol::{COORDINATION_PATH, PARAM_DIGEST, PARAM_PAYLOAD};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;
use crate::crypto::Authority;
use crate::delta::RecordDelta;
use crate::registry::Registry;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// An encoded delta with its detached authority signature, both base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedDelta {
    pub payload: String,
    pub digest: String,
}

pub struct Coordinator {
    authority: Arc<Authority>,
    registry: Arc<Registry>,
    endpoints: Vec<Url>,
    http: reqwest::Client,
}

impl Coordinator {
    pub fn new(authority: Arc<Authority>, registry: Arc<Registry>, partners: &[Url]) -> Result<Self> {
        let endpoints = partners
            .iter()
            .map(|partner| {
                let endpoint = format!(
                    "{}{}",
                    partner.as_str().trim_end_matches('/'),
                    COORDINATION_PATH
                );
                Url::parse(&endpoint)
                    .with_context(|| format!("Invalid partner endpoint: {}", endpoint))
            })
            .collect::<Result<Vec<_>>>()?;

        let http = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .context("Failed to build partner HTTP client")?;

        Ok(Self {
            authority,
            registry,
            endpoints,
            http,
        })
    }

    /// Encode and sign a delta for transmission
    pub fn seal(&self, delta: &RecordDelta) -> Result<SealedDelta> {
        let payload = delta.encode();
        let digest = self.authority.sign(&payload)?;
        Ok(SealedDelta {
            payload: B64.encode(payload),
            digest: B64.encode(digest),
        })
    }

    /// Push a sealed delta to every partner. Failures are logged and never retried.
    pub async fn deliver(&self, sealed: &SealedDelta) {
        let form = [
            (PARAM_PAYLOAD, sealed.payload.as_str()),
            (PARAM_DIGEST, sealed.digest.as_str()),
        ];

        let deliveries = self.endpoints.iter().map(|endpoint| async move {
            let result = self
                .http
                .post(endpoint.clone())
                .form(&form)
                .send()
                .await
                .and_then(|response| response.error_for_status());
            if let Err(e) = result {
                tracing::warn!("Delivery to partner {} failed: {}", endpoint, e);
            }
        });

        futures::future::join_all(deliveries).await;
    }

    /// Authenticate, decode and merge a delta pushed by a partner.
    ///
    /// Anything that fails is dropped without telling the sender. Returns whether the
    /// local registry changed.
    pub async fn ingest(&self, payload: &str, digest: &str) -> bool {
        let (Ok(payload), Ok(digest)) = (B64.decode(payload), B64.decode(digest)) else {
            tracing::debug!("Dropping partner delta: malformed base64");
            return false;
        };

        if !self.authority.verify(&payload, &digest) {
            tracing::debug!("Dropping partner delta: digest does not verify");
            return false;
        }

        let delta = match RecordDelta::decode(&payload) {
            Ok(delta) => delta,
            Err(e) => {
                tracing::warn!("Dropping authenticated partner delta: {}", e);
                return false;
            }
        };

        let service_id = delta.service_id();
        if !self.registry.merge(delta) {
            return false;
        }
        tracing::debug!("Merged partner delta for service {}", service_id);

        if let Err(e) = self.registry.persist().await {
            tracing::error!("Failed to persist snapshot after merge: {}", e);
        }
        true
    }

    /// Start `workers` outbound delivery tasks draining `rx`
    pub fn spawn_workers(
        self: &Arc<Self>,
        rx: flume::Receiver<RecordDelta>,
        workers: usize,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..workers)
            .map(|idx| {
                let coordinator = self.clone();
                let rx = rx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { coordinator.run_worker(idx, rx, cancel).await })
            })
            .collect()
    }

    async fn run_worker(
        &self,
        idx: usize,
        rx: flume::Receiver<RecordDelta>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                next = rx.recv_async() => {
                    let Ok(delta) = next else {
                        break;
                    };
                    match self.seal(&delta) {
                        Ok(sealed) => self.deliver(&sealed).await,
                        Err(e) => tracing::error!("Failed to seal delta for service {}: {}", delta.service_id(), e),
                    }
                }
                _ = cancel.cancelled() => {
                    break;
                }
            }
        }
        tracing::info!("Coordination worker {} shutting down", idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{node_key, other_key, signed_proxy, signed_service, test_registry};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn coordinator(key: &rsa::RsaPrivateKey, partners: &[Url]) -> Arc<Coordinator> {
        let authority = Arc::new(Authority::new(key.clone()));
        Arc::new(Coordinator::new(authority, Arc::new(test_registry()), partners).unwrap())
    }

    fn form_field(body: &[u8], name: &str) -> String {
        url::form_urlencoded::parse(body)
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
            .unwrap()
    }

    async fn wait_for_requests(server: &MockServer, count: usize) -> Vec<wiremock::Request> {
        for _ in 0..100 {
            let requests = server.received_requests().await.unwrap();
            if requests.len() >= count {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("partner did not receive {} requests", count);
    }

    #[test]
    fn test_partner_endpoints() {
        let partners = vec![
            Url::parse("http://dir2.example.net:7888").unwrap(),
            Url::parse("http://dir3.example.net/directory/").unwrap(),
        ];
        let coordinator = coordinator(node_key(), &partners);
        let endpoints: Vec<_> = coordinator.endpoints.iter().map(Url::as_str).collect();
        assert_eq!(
            endpoints,
            vec![
                "http://dir2.example.net:7888/coord",
                "http://dir3.example.net/directory/coord"
            ]
        );
    }

    #[tokio::test]
    async fn test_sealed_delta_merges_on_partner() {
        let local = coordinator(node_key(), &[]);
        let partner = coordinator(node_key(), &[]);
        let record = signed_proxy(1001, "allow *:*");

        let sealed = local.seal(&RecordDelta::NewRegistration(record.clone())).unwrap();
        assert!(partner.ingest(&sealed.payload, &sealed.digest).await);
        assert_eq!(partner.registry.all(), vec![record.clone()]);

        let later = record.created_time + chrono::Duration::minutes(1);
        let check_in = RecordDelta::CheckIn {
            service_id: 1001,
            last_checkin_time: later,
        };
        let sealed = local.seal(&check_in).unwrap();
        assert!(partner.ingest(&sealed.payload, &sealed.digest).await);
        assert_eq!(partner.registry.get(1001).unwrap().last_checkin_time, later);
    }

    #[tokio::test]
    async fn test_foreign_signature_is_dropped() {
        let outsider = coordinator(other_key(), &[]);
        let partner = coordinator(node_key(), &[]);

        let sealed = outsider
            .seal(&RecordDelta::NewRegistration(signed_service(5)))
            .unwrap();
        assert!(!partner.ingest(&sealed.payload, &sealed.digest).await);
        assert!(partner.registry.is_empty());
    }

    #[tokio::test]
    async fn test_authenticated_garbage_is_dropped() {
        let partner = coordinator(node_key(), &[]);
        let payload = vec![0x07, 1, 2, 3];
        let digest = partner.authority.sign(&payload).unwrap();

        assert!(!partner.ingest(&B64.encode(&payload), &B64.encode(digest)).await);
        assert!(!partner.ingest("%%%", "%%%").await);
        assert!(partner.registry.is_empty());
    }

    #[tokio::test]
    async fn test_workers_deliver_to_every_partner() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/coord"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        // The unreachable partner must not hold up delivery to the live one.
        let partners = vec![
            Url::parse("http://127.0.0.1:1").unwrap(),
            Url::parse(&server.uri()).unwrap(),
        ];
        let local = coordinator(node_key(), &partners);
        let (tx, rx) = flume::unbounded();
        let cancel = CancellationToken::new();
        let workers = local.spawn_workers(rx, 2, cancel.clone());

        let record = signed_service(77);
        tx.send(RecordDelta::NewRegistration(record.clone())).unwrap();

        let requests = wait_for_requests(&server, 1).await;
        let payload = form_field(&requests[0].body, "payload");
        let digest = form_field(&requests[0].body, "digest");

        let partner = coordinator(node_key(), &[]);
        assert!(partner.ingest(&payload, &digest).await);
        assert_eq!(partner.registry.all(), vec![record]);

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }
}

use std::sync::Arc;
use std::time::Duration;
use relay_directoryd::api::routes::{router, AppState};
use relay_directoryd::config::RegistryConfig;
use relay_directoryd::coordinator::Coordinator;
use relay_directoryd::crypto::{sign_record, Authority};
use relay_directoryd::registry::Registry;
use relay_directoryd::verifier::ExitPolicyVerifier;
use rsa::RsaPrivateKey;
use shared::types::{DirectoryRecord, RecordKind};
use tokio_util::sync::CancellationToken;
use url::Url;

struct Directory {
    registry: Arc<Registry>,
    url: Url,
}

async fn start_directory(
    authority: Arc<Authority>,
    partners: &[Url],
    cancel: &CancellationToken,
) -> Directory {
    let (tx, rx) = flume::unbounded();
    let registry = Arc::new(
        Registry::new(RegistryConfig::default(), Arc::new(ExitPolicyVerifier)).with_replication(tx),
    );
    let coordinator =
        Arc::new(Coordinator::new(authority.clone(), registry.clone(), partners).unwrap());
    coordinator.spawn_workers(rx, 1, cancel.clone());

    let app = router(AppState {
        registry: registry.clone(),
        coordinator,
        authority,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();

    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
            .unwrap();
    });

    Directory { registry, url }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_registration_and_check_in_reach_partner() {
    let mut rng = rand::thread_rng();
    let authority_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let node_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let authority = Arc::new(Authority::new(authority_key));
    let cancel = CancellationToken::new();

    let partner = start_directory(authority.clone(), &[], &cancel).await;
    let local = start_directory(authority, &[partner.url.clone()], &cancel).await;

    let kind = RecordKind::Proxy {
        bandwidth: 2048,
        exit_policy: "allow *:443".to_string(),
        version: "2.1".to_string(),
    };
    let mut record = DirectoryRecord::new(4242, "", "edge-relay", kind, Vec::new());
    sign_record(&mut record, &node_key).unwrap();

    local.registry.register(record.clone()).await.unwrap();
    eventually(|| partner.registry.get(4242).is_some()).await;
    assert_eq!(partner.registry.get(4242), Some(record.clone()));

    tokio::time::sleep(Duration::from_millis(5)).await;
    let stamped = local.registry.check_in(&record).unwrap();
    eventually(|| {
        partner
            .registry
            .get(4242)
            .is_some_and(|r| r.last_checkin_time == stamped)
    })
    .await;

    cancel.cancel();
}

#[tokio::test]
async fn test_partner_with_foreign_key_ignores_deltas() {
    let mut rng = rand::thread_rng();
    let cancel = CancellationToken::new();
    let partner_authority = Arc::new(Authority::new(RsaPrivateKey::new(&mut rng, 1024).unwrap()));
    let local_authority = Arc::new(Authority::new(RsaPrivateKey::new(&mut rng, 1024).unwrap()));
    let node_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();

    let partner = start_directory(partner_authority, &[], &cancel).await;
    let local = start_directory(local_authority, &[partner.url.clone()], &cancel).await;

    let mut record = DirectoryRecord::new(7, "", "forwarder", RecordKind::Service, Vec::new());
    sign_record(&mut record, &node_key).unwrap();
    local.registry.register(record).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(partner.registry.is_empty());
    cancel.cancel();
}

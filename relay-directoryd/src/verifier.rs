use std::sync::Arc;
use std::time::Duration;
use futures::future::BoxFuture;
use shared::types::{DirectoryRecord, RecordKind};

/// Decides whether a structurally valid record may join the directory.
pub trait NodeVerifier: Send + Sync + 'static {
    /// Resolves to `true` when the node is acceptable.
    fn verify(&self, record: DirectoryRecord) -> BoxFuture<'static, bool>;
}

/// Accepts proxies whose exit policy carries an explicit "allow" clause, and all services.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitPolicyVerifier;

impl NodeVerifier for ExitPolicyVerifier {
    fn verify(&self, record: DirectoryRecord) -> BoxFuture<'static, bool> {
        Box::pin(async move {
            match &record.kind {
                RecordKind::Proxy { exit_policy, .. } => exit_policy.contains("allow"),
                // TODO: probe service reachability before accepting
                RecordKind::Service => true,
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected,
    TimedOut,
}

/// Run the verifier as its own task, giving up after `timeout`.
///
/// A panicking verifier counts as a rejection. On timeout the task is aborted.
pub async fn verify_within(
    verifier: &Arc<dyn NodeVerifier>,
    record: &DirectoryRecord,
    timeout: Duration,
) -> Verdict {
    let task = tokio::spawn(verifier.verify(record.clone()));
    let abort = task.abort_handle();

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(true)) => Verdict::Accepted,
        Ok(Ok(false)) => Verdict::Rejected,
        Ok(Err(e)) => {
            tracing::warn!("Verifier failed for service {}: {}", record.service_id, e);
            Verdict::Rejected
        }
        Err(_) => {
            abort.abort();
            Verdict::TimedOut
        }
    }
}

//! Requests to the OpenShift / Kubernetes cluster.

pub mod pods;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Interval of the warm-pool maintenance task.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Client for pod and job management in the gateway's namespace.
pub struct Kuber {
    pub namespace: String,
    client: kube::Client,
    config: Arc<Config>,
}

#[derive(Debug)]
pub enum KuberError {
    Client(kube::Error),
    Namespace(String),
    /// A claimed placeholder job has no single matching pod.
    NoPodForJob,
    /// The assigned pod reports no IP yet.
    PodWithoutIp,
    PodReadyTimeout,
}

impl fmt::Display for KuberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KuberError::Client(e) => write!(f, "cluster request failed: {e}"),
            KuberError::Namespace(msg) => write!(f, "{msg}"),
            KuberError::NoPodForJob => write!(f, "found no pod for job identifier"),
            KuberError::PodWithoutIp => write!(f, "assigned pod has no IP address"),
            KuberError::PodReadyTimeout => write!(f, "timeout while waiting for pod readiness"),
        }
    }
}

impl std::error::Error for KuberError {}

impl From<kube::Error> for KuberError {
    fn from(e: kube::Error) -> Self {
        KuberError::Client(e)
    }
}

impl Kuber {
    /// Build a client from the ambient cluster configuration.
    pub async fn new(config: Arc<Config>) -> Result<Self, KuberError> {
        let client = kube::Client::try_default().await?;
        let namespace = namespace()?;
        Ok(Self {
            namespace,
            client,
            config,
        })
    }

    /// Warm-pool maintenance: garbage-collect completed pods every minute
    /// and keep a placeholder around when the image version changes.
    pub async fn run_maintenance(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.tick().await;
        let mut last_image_version = self.config.lfs_image_version();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.delete_completed_pods().await {
                        tracing::warn!(%e, "failed to delete completed pods");
                    }

                    let current = self.config.lfs_image_version();
                    if current != last_image_version {
                        tracing::info!(version = %current, "changed image version of the LFS.X");
                        last_image_version = current;
                        self.ensure_placeholder().await;
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("stopped looking for completed pods");
                    return;
                }
            }
        }
    }

    /// Create a single placeholder job if none exists for the current image
    /// version. The initial image pull is slow, so one warm pod pays off.
    pub async fn ensure_placeholder(&self) {
        match self.placeholders().await {
            Ok(jobs) if jobs.is_empty() => {
                if let Err(e) = self.create_placeholder_job().await {
                    tracing::warn!(%e, "failed to create placeholder on startup / image change");
                }
            }
            Ok(jobs) => {
                tracing::debug!(
                    placeholders = jobs.len(),
                    "no creation of placeholders is required"
                );
            }
            Err(e) => tracing::debug!(%e, "failed to list placeholders"),
        }
    }
}

/// Namespace from `KUBERNETES_NAMESPACE`, or the service account when
/// running inside the cluster.
fn namespace() -> Result<String, KuberError> {
    if let Ok(ns) = std::env::var("KUBERNETES_NAMESPACE") {
        return Ok(ns);
    }

    if let Ok(data) = std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
    {
        let ns = data.trim();
        if !ns.is_empty() {
            return Ok(ns.to_string());
        }
    }

    Err(KuberError::Namespace(
        "unable to get namespace to operate in, set KUBERNETES_NAMESPACE to provide it".to_string(),
    ))
}

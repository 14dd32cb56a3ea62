//! Pod lookup, the placeholder-pool claim algorithm and job creation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams};
use rand::Rng;

use crate::models::user::User;

use super::{Kuber, KuberError};

/// How long the readiness watch waits for a bespoke pod.
const POD_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters a pod is rendered from.
#[derive(Debug, Clone)]
pub(crate) struct PodTemplateData {
    pub username: String,
    pub db: String,
    pub lfs_service_endpoint: String,
    pub lfs_config_dir: String,
    pub image: String,
    pub image_version: String,
    pub base_name: String,
    pub namespace: String,
    pub is_placeholder: bool,
}

impl Kuber {
    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Return the IP of the pod assigned to the user, assigning one if
    /// needed. The second value states whether the pod was newly assigned.
    pub async fn pod_for_user(self: &Arc<Self>, user: &User) -> Result<(String, bool), KuberError> {
        if let Some(pod) = self.find_pod_for_user(user).await? {
            return Ok((pod_ip(&pod)?, false));
        }

        let pod = self.assign_pod(user).await?;
        Ok((pod_ip(&pod)?, true))
    }

    /// A pod already claimed for this user, regardless of image version so
    /// the user returns to the same pod across gateway updates.
    async fn find_pod_for_user(&self, user: &User) -> Result<Option<Pod>, KuberError> {
        let selector = format!(
            "app={}-lfs,db={},user={},placeholder=false",
            self.config.base_app_name,
            user.database.label(),
            user.db_user.to_lowercase(),
        );
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await?;

        let pod = pods.items.into_iter().next();
        if let Some(pod) = &pod {
            tracing::debug!(
                user = %user.db_user,
                ip = pod.status.as_ref().and_then(|s| s.pod_ip.as_deref()).unwrap_or(""),
                "found pod for user"
            );
        }
        Ok(pod)
    }

    /// Claim a placeholder for the user, or create a bespoke job when the
    /// pool is empty.
    async fn assign_pod(self: &Arc<Self>, user: &User) -> Result<Pod, KuberError> {
        let selector = format!(
            "appGeneric=lfs,placeholder=true,imageVersion={}",
            self.config.lfs_image_version()
        );
        let claim_labels = serde_json::json!({
            "db": user.database.label(),
            "user": user.db_user.to_lowercase(),
            "placeholder": "false",
        });

        loop {
            let mut jobs = self
                .jobs()
                .list(&ListParams::default().labels(&selector))
                .await?
                .items;
            if jobs.is_empty() {
                break;
            }
            // Oldest jobs are claimed first.
            jobs.sort_by(|a, b| a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp));
            let pool_size = jobs.len();

            for job in &jobs {
                let (Some(name), Some(resource_version)) = (
                    job.metadata.name.as_deref(),
                    job.metadata.resource_version.as_deref(),
                ) else {
                    continue;
                };

                // The resourceVersion gates the patch: whoever patches first
                // owns the placeholder, everybody else moves on.
                let patch = serde_json::json!({
                    "metadata": {
                        "labels": claim_labels,
                        "resourceVersion": resource_version,
                    }
                });
                match self
                    .jobs()
                    .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    Ok(_) => {
                        let identifier = job
                            .metadata
                            .labels
                            .as_ref()
                            .and_then(|l| l.get("user"))
                            .cloned()
                            .ok_or(KuberError::NoPodForJob)?;
                        tracing::debug!(
                            placeholder = %identifier,
                            user = %user.username,
                            "found and updated placeholder job"
                        );

                        let pod = self.claim_pod(&identifier, &claim_labels).await?;
                        self.spawn_replacements(pool_size);
                        return Ok(pod);
                    }
                    Err(e) => {
                        tracing::debug!(
                            job = %name,
                            resource_version = %resource_version,
                            ?e,
                            "failed to update job, it may have been claimed by another gateway"
                        );
                    }
                }
            }
            // Every candidate was lost to a race; list again.
        }

        // No placeholder available: refill the pool in the background and
        // build a job for this user right now.
        self.spawn_placeholders(2);
        self.create_job_for_user(user).await
    }

    /// Patch the pod belonging to a freshly claimed placeholder job.
    async fn claim_pod(
        &self,
        identifier: &str,
        claim_labels: &serde_json::Value,
    ) -> Result<Pod, KuberError> {
        let selector = format!(
            "appGeneric=lfs,placeholder=true,imageVersion={},user={}",
            self.config.lfs_image_version(),
            identifier,
        );
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await?
            .items;
        if pods.len() != 1 {
            return Err(KuberError::NoPodForJob);
        }

        let pod = &pods[0];
        let (Some(name), Some(resource_version)) = (
            pod.metadata.name.as_deref(),
            pod.metadata.resource_version.as_deref(),
        ) else {
            return Err(KuberError::NoPodForJob);
        };

        let patch = serde_json::json!({
            "metadata": {
                "labels": claim_labels,
                "resourceVersion": resource_version,
            }
        });
        self.pods()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(KuberError::Client)
    }

    /// All unclaimed placeholder jobs for the current image version.
    pub async fn placeholders(&self) -> Result<Vec<Job>, KuberError> {
        let selector = format!(
            "appGeneric=lfs,placeholder=true,imageVersion={}",
            self.config.lfs_image_version()
        );
        Ok(self
            .jobs()
            .list(&ListParams::default().labels(&selector))
            .await?
            .items)
    }

    /// Create a pre-warmed job that a later user can claim.
    pub async fn create_placeholder_job(&self) -> Result<Job, KuberError> {
        let identifier = placeholder_identifier();
        tracing::debug!(identifier = %identifier, "creating placeholder job");

        let job = render_job(&self.template_data(&identifier, "placeholder", true));
        self.jobs()
            .create(&PostParams::default(), &job)
            .await
            .map_err(KuberError::Client)
    }

    /// Create a job for this specific user and block until its pod is
    /// running and ready.
    async fn create_job_for_user(&self, user: &User) -> Result<Pod, KuberError> {
        tracing::debug!(user = %user.db_user, "creating job for user");

        let data = self.template_data(&user.db_user.to_lowercase(), &user.database.label(), false);
        let job = render_job(&data);
        self.jobs().create(&PostParams::default(), &job).await?;

        let selector = format!("db={},user={}", data.db, data.username);
        let mut watch = self
            .pods()
            .watch(&WatchParams::default().labels(&selector), "0")
            .await?
            .boxed();

        let result = tokio::time::timeout(POD_READY_TIMEOUT, async {
            while let Some(event) = watch.try_next().await? {
                match event {
                    WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                        if pod_is_ready(&pod) {
                            return Ok(pod);
                        }
                        tracing::trace!(
                            phase = pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or(""),
                            "pod was changed but it is not ready yet"
                        );
                    }
                    _ => {}
                }
            }
            Err(KuberError::PodReadyTimeout)
        })
        .await;

        match result {
            Ok(ready) => ready,
            Err(_) => Err(KuberError::PodReadyTimeout),
        }
    }

    /// Remove completed pods that are already scheduled for deletion.
    pub async fn delete_completed_pods(&self) -> Result<(), KuberError> {
        let params = ListParams::default()
            .labels("appGeneric=lfs")
            .fields("status.phase=completed");
        let pods = self.pods().list(&params).await?;

        for pod in pods.items {
            if pod.metadata.deletion_timestamp.is_none() {
                continue;
            }
            let Some(name) = pod.metadata.name else {
                continue;
            };
            tracing::debug!(pod = %name, "trying to delete pod");
            if let Err(e) = self
                .pods()
                .delete(&name, &DeleteParams::default().grace_period(5))
                .await
            {
                tracing::debug!(?e, pod = %name, "failed to delete pod");
            }
        }
        Ok(())
    }

    fn template_data(&self, username: &str, db: &str, is_placeholder: bool) -> PodTemplateData {
        let lfs_config_dir = if self.config.production {
            "/opt/lfs-user/config-prod"
        } else {
            "/opt/lfs-user/config-dev"
        };
        PodTemplateData {
            username: username.to_string(),
            db: db.to_string(),
            lfs_service_endpoint: self.config.lfs_service_endpoint.clone(),
            lfs_config_dir: lfs_config_dir.to_string(),
            image: self.config.lfs_image(),
            image_version: self.config.lfs_image_version(),
            base_name: self.config.base_app_name.clone(),
            namespace: self.namespace.clone(),
            is_placeholder,
        }
    }

    fn spawn_placeholders(self: &Arc<Self>, count: usize) {
        let kuber = self.clone();
        tokio::spawn(async move {
            for _ in 0..count {
                if let Err(e) = kuber.create_placeholder_job().await {
                    tracing::warn!(%e, "failed to create placeholder job");
                }
            }
        });
    }

    /// Refill the pool after a claim; one extra when it was nearly drained.
    fn spawn_replacements(self: &Arc<Self>, pool_size: usize) {
        let kuber = self.clone();
        tokio::spawn(async move {
            if let Err(e) = kuber.create_placeholder_job().await {
                tracing::warn!(%e, "failed to create placeholder job");
            }
            if pool_size < 2 {
                tracing::debug!(pool = pool_size, "starting another placeholder");
                if let Err(e) = kuber.create_placeholder_job().await {
                    tracing::warn!(%e, "failed to create placeholder job");
                }
            }
        });
    }
}

fn pod_ip(pod: &Pod) -> Result<String, KuberError> {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .ok_or(KuberError::PodWithoutIp)
}

fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "ContainersReady" && c.status == "True")
}

/// Random identifier linking a placeholder job to its pod.
fn placeholder_identifier() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let body: String = (0..24)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect();
    format!("p{body}p")
}

fn render_job(data: &PodTemplateData) -> Job {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), format!("{}-lfs", data.base_name));
    labels.insert("appGeneric".to_string(), "lfs".to_string());
    labels.insert("db".to_string(), data.db.clone());
    labels.insert("user".to_string(), data.username.clone());
    labels.insert("placeholder".to_string(), data.is_placeholder.to_string());
    labels.insert("imageVersion".to_string(), data.image_version.clone());

    let env = vec![
        EnvVar {
            name: "APP_LFS_SERVICE_ENDPOINT".to_string(),
            value: Some(data.lfs_service_endpoint.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "APP_LFS_CONFIG_DIR".to_string(),
            value: Some(data.lfs_config_dir.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "APP_USERNAME".to_string(),
            value: Some(data.username.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "APP_DB".to_string(),
            value: Some(data.db.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "APP_PLACEHOLDER".to_string(),
            value: Some(data.is_placeholder.to_string()),
            ..Default::default()
        },
    ];

    let ports = vec![
        ContainerPort {
            container_port: 5910,
            name: Some("vnc".to_string()),
            ..Default::default()
        },
        ContainerPort {
            container_port: 4822,
            name: Some("guacd".to_string()),
            ..Default::default()
        },
        ContainerPort {
            container_port: 8888,
            name: Some("app".to_string()),
            ..Default::default()
        },
        ContainerPort {
            container_port: 4021,
            name: Some("host-api".to_string()),
            ..Default::default()
        },
    ];

    Job {
        metadata: ObjectMeta {
            name: Some(format!("{}-lfs-{}-{}", data.base_name, data.username, data.db)),
            namespace: Some(data.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(60),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "lfs".to_string(),
                        image: Some(data.image.clone()),
                        env: Some(env),
                        ports: Some(ports),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

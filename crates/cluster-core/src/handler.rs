//! Running one operation across every configured subsystem.
//!
//! [`ServiceHandler::run_concurrent`] is the primitive: an optional `first`
//! service runs alone, then every other service runs concurrently, then an
//! optional `last` service runs alone. The barriers are hard: nothing in a
//! later tier starts before the earlier tier has returned, and a failed tier
//! stops all later tiers.
//!
//! Removal runs virtualization first because it references objects owned by
//! storage and network, and the cluster daemon's own membership last so a
//! partial failure leaves the node a member that can be retried. Bootstrap
//! and join go the other way round.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::intent::JoinPlan;
use crate::service::{Disk, Service, ServiceError, ServiceType};

/// Time allowed for one service to bootstrap.
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Time allowed for one service to join an existing cluster.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A service invocation that failed.
#[derive(Debug)]
pub struct ServiceFailure {
    pub service: ServiceType,
    pub error: ServiceError,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{}", describe_failures(.0))]
    Services(Vec<ServiceFailure>),

    #[error("Member {0:?} not found on any service")]
    MemberNotFound(String),
}

impl HandlerError {
    /// Services whose invocation failed.
    pub fn failed_services(&self) -> Vec<ServiceType> {
        match self {
            Self::Services(failures) => failures.iter().map(|f| f.service).collect(),
            Self::MemberNotFound(_) => Vec::new(),
        }
    }
}

fn describe_failures(failures: &[ServiceFailure]) -> String {
    let mut out = String::new();
    for (i, failure) in failures.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        let _ = write!(out, "{}: {}", failure.service, failure.error);
    }
    out
}

/// Members and disks of one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub members: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,
}

/// Combined status of every service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub services: BTreeMap<ServiceType, ServiceStatus>,
}

/// The set of subsystems configured on this machine.
#[derive(Clone, Default)]
pub struct ServiceHandler {
    services: BTreeMap<ServiceType, Arc<dyn Service>>,
}

impl ServiceHandler {
    pub fn new(services: impl IntoIterator<Item = Arc<dyn Service>>) -> Self {
        Self {
            services: services
                .into_iter()
                .map(|s| (s.service_type(), s))
                .collect(),
        }
    }

    pub fn get(&self, service: ServiceType) -> Option<&Arc<dyn Service>> {
        self.services.get(&service)
    }

    pub fn types(&self) -> Vec<ServiceType> {
        self.services.keys().copied().collect()
    }

    /// Run `f` on every service honoring the `first` and `last` barriers.
    ///
    /// `None` disables a barrier. A barrier naming a service that is not
    /// configured is ignored.
    pub async fn run_concurrent<F, Fut>(
        &self,
        first: Option<ServiceType>,
        last: Option<ServiceType>,
        f: F,
    ) -> Result<(), HandlerError>
    where
        F: Fn(Arc<dyn Service>) -> Fut,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        let first = first.and_then(|t| self.services.get(&t).cloned());
        let last = last.and_then(|t| self.services.get(&t).cloned());

        if let Some(service) = &first {
            let kind = service.service_type();
            debug!(service = %kind, "Running first");
            if let Err(error) = f(service.clone()).await {
                return Err(HandlerError::Services(vec![ServiceFailure {
                    service: kind,
                    error,
                }]));
            }
        }

        let mut pending = BTreeSet::new();
        let mut tasks = JoinSet::new();
        for (kind, service) in &self.services {
            let is_barrier = |barrier: &Option<Arc<dyn Service>>| {
                barrier.as_ref().is_some_and(|b| b.service_type() == *kind)
            };
            if is_barrier(&first) || is_barrier(&last) {
                continue;
            }

            let kind = *kind;
            let fut = f(service.clone());
            pending.insert(kind);
            tasks.spawn(async move { (kind, fut.await) });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((kind, result)) => {
                    pending.remove(&kind);
                    if let Err(error) = result {
                        failures.push(ServiceFailure {
                            service: kind,
                            error,
                        });
                    }
                }
                Err(e) => warn!("Service task failed: {}", e),
            }
        }

        // Anything still pending panicked or was aborted
        for kind in pending {
            failures.push(ServiceFailure {
                service: kind,
                error: ServiceError::Request {
                    service: kind,
                    message: "task did not complete".to_string(),
                },
            });
        }

        if !failures.is_empty() {
            failures.sort_by_key(|f| f.service);
            return Err(HandlerError::Services(failures));
        }

        if let Some(service) = &last {
            let kind = service.service_type();
            debug!(service = %kind, "Running last");
            if let Err(error) = f(service.clone()).await {
                return Err(HandlerError::Services(vec![ServiceFailure {
                    service: kind,
                    error,
                }]));
            }
        }

        Ok(())
    }

    /// Form a new cluster on every service.
    pub async fn bootstrap(&self, ctx: &Context) -> Result<(), HandlerError> {
        let ctx = ctx.clone();
        self.run_concurrent(
            Some(ServiceType::Cluster),
            Some(ServiceType::Virtualization),
            move |service| {
                let ctx = ctx.clone();
                async move {
                    let kind = service.service_type();
                    let (ctx, _cancel) =
                        ctx.with_timeout(BOOTSTRAP_TIMEOUT, format!("Timed out bootstrapping {kind}"));
                    ctx.run(service.bootstrap(&ctx)).await??;
                    info!(service = %kind, "Bootstrapped service");
                    Ok::<(), ServiceError>(())
                }
            },
        )
        .await
    }

    /// Join every service using the tokens in `plan`.
    pub async fn join(&self, ctx: &Context, plan: &JoinPlan) -> Result<(), HandlerError> {
        let ctx = ctx.clone();
        let plan = plan.clone();
        self.run_concurrent(
            Some(ServiceType::Cluster),
            Some(ServiceType::Virtualization),
            move |service| {
                let ctx = ctx.clone();
                let config = plan.join_config(service.service_type());
                async move {
                    let kind = service.service_type();
                    let config = config.ok_or(ServiceError::MissingToken(kind))?;
                    let (ctx, _cancel) =
                        ctx.with_timeout(JOIN_TIMEOUT, format!("Timed out joining {kind}"));
                    ctx.run(service.join(&ctx, &config)).await??;
                    info!(service = %kind, "Joined service");
                    Ok::<(), ServiceError>(())
                }
            },
        )
        .await
    }

    /// Remove `name` from every service that has it, in dependency order.
    pub async fn remove_member(
        &self,
        ctx: &Context,
        name: &str,
        force: bool,
    ) -> Result<(), HandlerError> {
        let ctx = ctx.clone();
        let member = name.to_string();
        let removed = Arc::new(Mutex::new(Vec::new()));
        let seen = removed.clone();

        self.run_concurrent(
            Some(ServiceType::Virtualization),
            Some(ServiceType::Cluster),
            move |service| {
                let ctx = ctx.clone();
                let member = member.clone();
                let removed = removed.clone();
                async move {
                    let kind = service.service_type();
                    let members = ctx.run(service.cluster_members(&ctx)).await??;
                    if !members.contains_key(&member) {
                        debug!(service = %kind, member = %member, "Member not present, skipping");
                        return Ok(());
                    }

                    ctx.run(service.delete_cluster_member(&ctx, &member, force))
                        .await??;
                    info!(service = %kind, member = %member, "Removed cluster member");
                    removed.lock().unwrap_or_else(|e| e.into_inner()).push(kind);
                    Ok::<(), ServiceError>(())
                }
            },
        )
        .await?;

        if seen.lock().unwrap_or_else(|e| e.into_inner()).is_empty() {
            return Err(HandlerError::MemberNotFound(name.to_string()));
        }

        Ok(())
    }

    /// Members and disks of every service.
    pub async fn status(&self, ctx: &Context) -> Result<StatusReport, HandlerError> {
        let ctx = ctx.clone();
        let report = Arc::new(Mutex::new(StatusReport::default()));
        let shared = report.clone();

        self.run_concurrent(None, None, move |service| {
            let ctx = ctx.clone();
            let report = shared.clone();
            async move {
                let kind = service.service_type();
                let members = ctx.run(service.cluster_members(&ctx)).await??;
                let disks = match service.as_disk_lister() {
                    Some(lister) => ctx.run(lister.list_disks(&ctx)).await??,
                    None => Vec::new(),
                };

                report
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .services
                    .insert(kind, ServiceStatus { members, disks });
                Ok::<(), ServiceError>(())
            }
        })
        .await?;

        let report = report.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(report)
    }
}

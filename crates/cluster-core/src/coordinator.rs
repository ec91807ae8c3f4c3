//! Growing every subsystem's cluster by several peers at once.
//!
//! Tokens for all peers and services are issued concurrently. Peers are then
//! joined in batches: when more than [`JoinPolicy::threshold`] peers are
//! added, the first `threshold` join alone and the rest follow after a settle
//! delay, so no consensus group absorbs more than a handful of membership
//! changes at a time. Each batch is handed to a [`JoinDispatcher`] and its
//! completion stream is drained until every peer reported, the stream closed
//! or the deadline passed. Finally every service must agree with the cluster
//! service on the member count.
//!
//! Callers that want to follow along pass a channel to
//! [`JoinCoordinator::add_peers_with_progress`] and receive a [`JoinEvent`]
//! as each step happens.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::{Cancelled, Context};
use crate::handler::{HandlerError, ServiceHandler};
use crate::intent::JoinPlan;
use crate::service::{ServiceError, ServiceType};

/// Peers allowed to join in the first batch.
pub const DEFAULT_QUORUM_THRESHOLD: usize = 2;

/// Pause between batches so consensus roles can settle.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Deadline for one batch to report completion.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Reported for peers still pending when the completion stream ends.
pub const STREAM_CLOSED: &str = "Completion stream closed before the peer reported";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPolicy {
    pub threshold: usize,
    pub settle_delay: Duration,
    pub timeout: Duration,
}

impl Default for JoinPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_QUORUM_THRESHOLD,
            settle_delay: DEFAULT_SETTLE_DELAY,
            timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// A system to add to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerTarget {
    pub name: String,
    pub address: String,
}

/// A peer together with everything it needs to join.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPlan {
    pub name: String,
    pub plan: JoinPlan,
}

/// One entry of a completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerReport {
    pub peer: String,
    pub result: Result<(), String>,
}

impl PeerReport {
    pub fn joined(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            result: Ok(()),
        }
    }

    pub fn failed(peer: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            result: Err(error.into()),
        }
    }
}

/// Hands join plans to their peers.
pub trait JoinDispatcher: Send + Sync {
    /// Start joining every peer in `batch`. Each peer reports exactly once on
    /// the returned stream.
    fn dispatch(&self, ctx: &Context, batch: Vec<PeerPlan>) -> mpsc::Receiver<PeerReport>;
}

/// Run `join` for every plan in its own task and stream the outcomes.
pub fn dispatch_each<F, Fut>(ctx: &Context, batch: Vec<PeerPlan>, join: F) -> mpsc::Receiver<PeerReport>
where
    F: Fn(Context, PeerPlan) -> Fut,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(batch.len().max(1));
    for plan in batch {
        let tx = tx.clone();
        let peer = plan.name.clone();
        let fut = join(ctx.clone(), plan);
        tokio::spawn(async move {
            let report = PeerReport {
                peer,
                result: fut.await,
            };
            let _ = tx.send(report).await;
        });
    }

    rx
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerFailure {
    pub peer: String,
    pub error: String,
}

/// Outcome of adding peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinReport {
    pub joined: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<PeerFailure>,
    /// Peers never dispatched because an earlier batch failed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
    /// Member count every service agreed on
    #[serde(default)]
    pub members: usize,
}

/// Progress of [`JoinCoordinator::add_peers_with_progress`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JoinEvent {
    /// Every peer holds a token for every service.
    TokensIssued { peers: Vec<String> },
    /// A batch was handed to the dispatcher.
    Batch {
        batch: usize,
        of: usize,
        peers: Vec<String>,
    },
    Joined { peer: String },
    Failed { peer: String, error: String },
    /// Not dispatched because an earlier batch failed.
    Skipped { peer: String },
}

type Progress = mpsc::UnboundedSender<JoinEvent>;

fn emit(progress: &Progress, event: JoinEvent) {
    // A caller that stopped listening does not stop the join.
    let _ = progress.send(event);
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("No cluster service configured")]
    NoClusterService,

    #[error("Peer {0:?} is listed more than once")]
    DuplicatePeer(String),

    #[error("Failed to issue join tokens: {0}")]
    Tokens(HandlerError),

    #[error("Join plan for {peer:?} has no token for {}", describe_services(.missing))]
    IncompletePlan {
        peer: String,
        missing: Vec<ServiceType>,
    },

    #[error("Timed out after {timeout:?} waiting for peers to join: {}", .pending.join(", "))]
    Timeout {
        timeout: Duration,
        pending: Vec<String>,
    },

    #[error("Received a join report for unexpected peer {0:?}")]
    UnknownPeer(String),

    #[error("{}", describe_report(.0))]
    PeersFailed(JoinReport),

    #[error("Failed to list {service} members: {source}")]
    Members {
        service: ServiceType,
        source: ServiceError,
    },

    #[error("{service} has {actual} members but the cluster has {expected}")]
    Inconsistent {
        service: ServiceType,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

fn describe_services(services: &[ServiceType]) -> String {
    services
        .iter()
        .map(ServiceType::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_report(report: &JoinReport) -> String {
    let mut out = String::from("Some peers failed to join");
    for failure in &report.failed {
        let _ = write!(out, "; {}: {}", failure.peer, failure.error);
    }
    if !report.joined.is_empty() {
        let _ = write!(out, " (joined: {})", report.joined.join(", "));
    }
    if !report.skipped.is_empty() {
        let _ = write!(out, " (skipped: {})", report.skipped.join(", "));
    }
    out
}

/// Split peers into the batches they join in.
fn stage(peers: Vec<PeerPlan>, threshold: usize) -> Vec<Vec<PeerPlan>> {
    if threshold == 0 || peers.len() <= threshold {
        return vec![peers];
    }

    let mut first = peers;
    let rest = first.split_off(threshold);
    vec![first, rest]
}

pub struct JoinCoordinator {
    handler: ServiceHandler,
    dispatcher: Arc<dyn JoinDispatcher>,
    policy: JoinPolicy,
}

impl JoinCoordinator {
    pub fn new(handler: ServiceHandler, dispatcher: Arc<dyn JoinDispatcher>) -> Self {
        Self {
            handler,
            dispatcher,
            policy: JoinPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: JoinPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Join `peers` to every local service.
    ///
    /// A failing peer does not undo peers that already joined. Timeouts and
    /// reports for unexpected peers abort the whole operation.
    pub async fn add_peers(
        &self,
        ctx: &Context,
        peers: &[PeerTarget],
    ) -> Result<JoinReport, CoordinatorError> {
        let (progress, _) = mpsc::unbounded_channel();
        self.add_peers_with_progress(ctx, peers, progress).await
    }

    /// Like [`JoinCoordinator::add_peers`], reporting each step on `progress`.
    pub async fn add_peers_with_progress(
        &self,
        ctx: &Context,
        peers: &[PeerTarget],
        progress: mpsc::UnboundedSender<JoinEvent>,
    ) -> Result<JoinReport, CoordinatorError> {
        if self.handler.get(ServiceType::Cluster).is_none() {
            return Err(CoordinatorError::NoClusterService);
        }

        let mut names = BTreeSet::new();
        for peer in peers {
            if !names.insert(peer.name.as_str()) {
                return Err(CoordinatorError::DuplicatePeer(peer.name.clone()));
            }
        }

        if peers.is_empty() {
            let members = self.check_consistency(ctx).await?;
            return Ok(JoinReport {
                members,
                ..Default::default()
            });
        }

        let mut plans = self.issue_tokens(ctx, peers).await?;

        // A peer must never be sent a plan it cannot fully act on.
        let services = self.handler.types();
        for peer in peers {
            let missing = plans
                .get(&peer.name)
                .map(|plan| plan.missing_tokens(&services))
                .unwrap_or_else(|| services.clone());
            if !missing.is_empty() {
                warn!(peer = %peer.name, ?missing, "Incomplete join plan");
                self.revoke_tokens(ctx, &plans).await;
                return Err(CoordinatorError::IncompletePlan {
                    peer: peer.name.clone(),
                    missing,
                });
            }
        }
        emit(
            &progress,
            JoinEvent::TokensIssued {
                peers: peers.iter().map(|p| p.name.clone()).collect(),
            },
        );

        let ordered = peers
            .iter()
            .filter_map(|p| {
                plans.remove(&p.name).map(|plan| PeerPlan {
                    name: p.name.clone(),
                    plan,
                })
            })
            .collect();

        let batches = stage(ordered, self.policy.threshold);
        let total = batches.len();
        let mut report = JoinReport::default();

        for (i, batch) in batches.into_iter().enumerate() {
            if !report.failed.is_empty() {
                for peer in batch {
                    emit(&progress, JoinEvent::Skipped { peer: peer.name.clone() });
                    report.skipped.push(peer.name);
                }
                continue;
            }

            if i > 0 {
                debug!(delay = ?self.policy.settle_delay, "Waiting for cluster to settle");
                ctx.run(tokio::time::sleep(self.policy.settle_delay)).await?;
            }

            let names: Vec<String> = batch.iter().map(|p| p.name.clone()).collect();
            info!(batch = i + 1, of = total, peers = ?names, "Dispatching join batch");
            emit(
                &progress,
                JoinEvent::Batch {
                    batch: i + 1,
                    of: total,
                    peers: names.clone(),
                },
            );

            let reports = self.dispatcher.dispatch(ctx, batch);
            self.wait_batch(ctx, names, reports, &mut report, &progress)
                .await?;
        }

        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), joined = report.joined.len(), "Peers failed to join");
            return Err(CoordinatorError::PeersFailed(report));
        }

        report.members = self.check_consistency(ctx).await?;
        info!(joined = report.joined.len(), members = report.members, "Cluster grown");
        Ok(report)
    }

    /// Issue a token for every peer on every service.
    async fn issue_tokens(
        &self,
        ctx: &Context,
        peers: &[PeerTarget],
    ) -> Result<BTreeMap<String, JoinPlan>, CoordinatorError> {
        let plans: BTreeMap<String, JoinPlan> = peers
            .iter()
            .map(|p| (p.name.clone(), JoinPlan::new(p.address.as_str())))
            .collect();
        let plans = Arc::new(Mutex::new(plans));
        let names: Arc<Vec<String>> = Arc::new(peers.iter().map(|p| p.name.clone()).collect());

        let shared = plans.clone();
        let task_ctx = ctx.clone();
        let result = self
            .handler
            .run_concurrent(None, None, move |service| {
                let ctx = task_ctx.clone();
                let names = names.clone();
                let plans = shared.clone();
                async move {
                    let kind = service.service_type();
                    let (ctx, service, plans) = (&ctx, &service, &plans);

                    let issued = join_all(names.iter().map(move |peer| async move {
                        let token = ctx
                            .run(service.issue_token(ctx, peer))
                            .await?
                            .map_err(|e| ServiceError::Request {
                                service: kind,
                                message: format!("Failed to issue token for peer {peer:?}: {e}"),
                            })?;

                        let mut plans = plans.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(plan) = plans.get_mut(peer) {
                            plan.add_token(kind, token);
                        }
                        Ok::<_, ServiceError>(())
                    }))
                    .await;

                    issued.into_iter().collect::<Result<Vec<_>, _>>()?;
                    debug!(service = %kind, peers = names.len(), "Issued join tokens");
                    Ok::<(), ServiceError>(())
                }
            })
            .await;

        let plans = std::mem::take(&mut *plans.lock().unwrap_or_else(|e| e.into_inner()));
        if let Err(e) = result {
            self.revoke_tokens(ctx, &plans).await;
            return Err(CoordinatorError::Tokens(e));
        }

        Ok(plans)
    }

    /// Best effort cleanup of tokens issued before a failure.
    async fn revoke_tokens(&self, ctx: &Context, plans: &BTreeMap<String, JoinPlan>) {
        for (peer, plan) in plans {
            for kind in plan.services() {
                let Some(service) = self.handler.get(kind) else {
                    continue;
                };
                if let Err(e) = service.delete_token(ctx, peer).await {
                    warn!(service = %kind, peer = %peer, "Failed to clean up join token: {}", e);
                }
            }
        }
    }

    async fn wait_batch(
        &self,
        ctx: &Context,
        names: Vec<String>,
        mut reports: mpsc::Receiver<PeerReport>,
        report: &mut JoinReport,
        progress: &Progress,
    ) -> Result<(), CoordinatorError> {
        let timeout = self.policy.timeout;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut pending: BTreeSet<String> = names.into_iter().collect();
        while !pending.is_empty() {
            let next = tokio::select! {
                biased;
                cause = ctx.cancelled_cause() => return Err(cause.into()),
                _ = &mut deadline => {
                    return Err(CoordinatorError::Timeout {
                        timeout,
                        pending: pending.into_iter().collect(),
                    });
                }
                next = reports.recv() => next,
            };

            let Some(PeerReport { peer, result }) = next else {
                warn!(pending = pending.len(), "Completion stream closed early");
                for peer in std::mem::take(&mut pending) {
                    emit(
                        progress,
                        JoinEvent::Failed {
                            peer: peer.clone(),
                            error: STREAM_CLOSED.to_string(),
                        },
                    );
                    report.failed.push(PeerFailure {
                        peer,
                        error: STREAM_CLOSED.to_string(),
                    });
                }
                break;
            };

            if !pending.remove(&peer) {
                return Err(CoordinatorError::UnknownPeer(peer));
            }

            match result {
                Ok(()) => {
                    info!(peer = %peer, "Peer joined the cluster");
                    emit(progress, JoinEvent::Joined { peer: peer.clone() });
                    report.joined.push(peer);
                }
                Err(error) => {
                    warn!(peer = %peer, error = %error, "Peer failed to join");
                    emit(
                        progress,
                        JoinEvent::Failed {
                            peer: peer.clone(),
                            error: error.clone(),
                        },
                    );
                    report.failed.push(PeerFailure { peer, error });
                }
            }
        }

        Ok(())
    }

    /// Every service must report as many members as the cluster service.
    async fn check_consistency(&self, ctx: &Context) -> Result<usize, CoordinatorError> {
        let count = move |kind: ServiceType| async move {
            let Some(service) = self.handler.get(kind) else {
                return Err(CoordinatorError::NoClusterService);
            };
            let members = ctx
                .run(service.cluster_members(ctx))
                .await?
                .map_err(|source| CoordinatorError::Members {
                    service: kind,
                    source,
                })?;
            Ok::<_, CoordinatorError>(members.len())
        };

        let expected = count(ServiceType::Cluster).await?;
        for kind in self.handler.types() {
            if kind == ServiceType::Cluster {
                continue;
            }

            let actual = count(kind).await?;
            if actual != expected {
                return Err(CoordinatorError::Inconsistent {
                    service: kind,
                    expected,
                    actual,
                });
            }
        }

        Ok(expected)
    }
}

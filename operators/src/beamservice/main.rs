//! K8S beam-service operator: watches BeamService CRs and drives each one to
//! a RUNNING Flink job built from the packaged artifact named in the spec.
//! There is a maximum retry limit that fully resets the resource so the next
//! tick restarts the lifecycle cleanly.
//!
//! Jobs that vanish from the job manager (404) or report FAILED are healed
//! by a full redeploy.

use beam_operators::{
    args,
    crd::{timestamp, BeamService, BeamServiceStatus},
    events, fetch,
};
use chrono::Utc;
use clap::{App, Arg, ArgMatches};
use flink_client::{FlinkClient, JobQuery};
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    Client, CustomResourceExt, ResourceExt,
};
use kube_runtime::controller::{Context, Controller, ReconcilerAction};
use serde_json::json;
use snafu::Snafu;
use std::{collections::HashMap, ops::Deref, sync::Arc, time::Duration};
use tracing::{debug, error, info, trace, warn};

const WHO_AM_I: &str = "BeamService Operator";
const WHO_AM_I_SHORT: &str = "beamservice-operator";
const FINALIZER: &str = "oisp.org/beamservice-protection";

/// Synthetic pipeline state recorded while a FAILED job is torn down.
const STATE_RESTARTING: &str = "RESTARTING";

/// Errors generated during the reconciliation loop
#[derive(Debug, Snafu)]
pub(crate) enum Error {
    #[snafu(display(
        "Failed to reconcile '{}' CRD within set limits, aborting operation",
        name
    ))]
    /// Error generated when the loop stops processing
    ReconcileError {
        name: String,
    },
    #[snafu(display("Kubernetes client error: {}", source))]
    /// k8s client error
    Kube {
        source: kube::Error,
    },
    #[snafu(display("{}", reason))]
    /// Spec is unusable until the user edits it; no requeue
    Permanent {
        reason: String,
    },
    #[snafu(display("{}", reason))]
    /// Transient failure, requeued after the carried delay
    Retry {
        reason: String,
        delay: Duration,
    },
}

/// The next transition for an initialized resource, evaluated in the fixed
/// rule order of the lifecycle: deploy phase first, then submission phase,
/// then monitoring. Inconsistent flag pairs are healed before anything else
/// runs in their phase.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Step {
    RequestDeploy,
    ClearDeploying,
    Deploy,
    RequestSubmit,
    ClearJobCreating,
    SubmitJob,
    Monitor,
}

fn next_step(status: &BeamServiceStatus) -> Step {
    if !status.deployed && !status.deploying {
        Step::RequestDeploy
    } else if status.deployed && status.deploying {
        Step::ClearDeploying
    } else if status.deploying {
        Step::Deploy
    } else if !status.job_created && !status.job_creating {
        Step::RequestSubmit
    } else if status.job_creating && status.job_created {
        Step::ClearJobCreating
    } else if status.job_creating {
        Step::SubmitJob
    } else {
        Step::Monitor
    }
}

/// Additional per resource context during the runtime; it is volatile
#[derive(Clone)]
pub(crate) struct ResourceContext {
    /// The latest CRD known to us
    inner: BeamService,
    /// Counter that keeps track of how many times the reconcile loop has run
    /// within the current state
    num_retries: u32,
    /// Set when the spec.reset value changed against the previous snapshot
    reset_requested: bool,
    /// Reference to the operator context
    ctx: Arc<OperatorContext>,
}

impl Deref for ResourceContext {
    type Target = BeamService;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Data we want access to in error/reconcile calls
pub(crate) struct OperatorContext {
    /// Reference to our k8s client
    k8s: Client,
    /// Hashtable of name and the full last seen CRD
    inventory: tokio::sync::RwLock<HashMap<String, ResourceContext>>,
    /// Flink cluster client
    flink: FlinkClient,
    /// HTTP client for artifact download
    http: reqwest::Client,
    /// Timer interval
    interval: u64,
    /// Upload failure backoff
    backoff: u64,
    /// Retries before the resource is reset
    retries: u32,
}

impl OperatorContext {
    /// Upsert the potential new CRD into the operator context. If an existing
    /// resource with the same resource version is present, its retry counter
    /// is bumped and the old entry returned; a new resource version swaps the
    /// entry out and resets the counter.
    pub(crate) async fn upsert(
        &self,
        ctx: Arc<OperatorContext>,
        bs: BeamService,
    ) -> ResourceContext {
        let resource = ResourceContext {
            inner: bs,
            num_retries: 0,
            reset_requested: false,
            ctx,
        };

        let mut i = self.inventory.write().await;
        debug!(count = ?i.keys().count(), "current number of CRDS");

        match i.get_mut(&resource.name()) {
            Some(p) => {
                if p.resource_version() == resource.resource_version() {
                    debug!(status = ?resource.status, "duplicate event or long running operation");
                    p.num_retries += 1;
                    return p.clone();
                }

                // Its a new resource version which means we will swap it out
                // to reset the counter.
                let mut resource = resource;
                resource.reset_requested = resource.inner.spec.reset.is_some()
                    && p.spec.reset != resource.inner.spec.reset;
                let p = i
                    .insert(resource.name(), resource.clone())
                    .expect("existing resource should be present");
                info!(name = ?p.name(), "new resource_version inserted");
                resource
            }

            None => {
                let p = i.insert(resource.name(), resource.clone());
                assert!(p.is_none());
                resource
            }
        }
    }

    /// Remove the resource from the operator
    pub(crate) async fn remove(&self, name: String) -> Option<ResourceContext> {
        let mut i = self.inventory.write().await;
        let removed = i.remove(&name);
        if let Some(removed) = removed {
            info!(name = ?removed.name(), "removed from inventory");
            return Some(removed);
        }
        None
    }

    /// The reset hook ran; do not run it again for this resource version.
    pub(crate) async fn clear_reset(&self, name: &str) {
        let mut i = self.inventory.write().await;
        if let Some(entry) = i.get_mut(name) {
            entry.reset_requested = false;
        }
    }
}

/// Unlink the downloaded artifact recorded in the status, if any.
fn delete_jar(status: &BeamServiceStatus) {
    if let Some(path) = &status.jar_path {
        let path = std::path::Path::new(path);
        if path.is_file() {
            if let Err(error) = std::fs::remove_file(path) {
                warn!(path = %path.display(), %error, "failed to remove jar artifact");
            }
        }
    }
}

impl ResourceContext {
    /// Construct an API handle for the resource
    fn api(&self) -> Api<BeamService> {
        Api::namespaced(self.ctx.k8s.clone(), &self.namespace().unwrap())
    }

    /// Patch the given status onto the resource; one merge-patch per handler
    /// exit keeps the write atomic from the API server's view.
    async fn patch_status(&self, status: BeamServiceStatus) -> Result<BeamService, Error> {
        let status = json!({ "status": status });

        let ps = PatchParams::apply(WHO_AM_I);

        let o = self
            .api()
            .patch_status(&self.name(), &ps, &Patch::Merge(&status))
            .await
            .map_err(|source| Error::Kube { source })?;

        debug!(name = ?o.name(), old = ?self.status, new = ?o.status, "status changed");

        Ok(o)
    }

    fn requeue(&self) -> ReconcilerAction {
        ReconcilerAction {
            requeue_after: Some(Duration::from_secs(self.ctx.interval)),
        }
    }

    /// Make sure our finalizer is on the resource so deletion waits for the
    /// job cancellation and artifact cleanup.
    async fn ensure_finalizer(&self) -> Result<(), Error> {
        let mut finalizers = self.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        finalizers.push(FINALIZER.to_string());
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.api()
            .patch(&self.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|source| Error::Kube { source })?;
        Ok(())
    }

    async fn remove_finalizer(&self) -> Result<(), Error> {
        let finalizers: Vec<String> = self
            .metadata
            .finalizers
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != FINALIZER)
            .collect();
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.api()
            .patch(&self.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|source| Error::Kube { source })?;
        Ok(())
    }

    /// Initialize the status when there is none: the resource is new. Every
    /// lifecycle flag starts false so the first tick requests the deploy.
    async fn start(&self) -> Result<ReconcilerAction, Error> {
        self.k8s_notify("Creating", "Creating", "Creating beamservice", "Normal")
            .await;
        let _ = self.patch_status(BeamServiceStatus::initial()).await?;
        Ok(ReconcilerAction {
            requeue_after: None,
        })
    }

    /// One timer tick: run the first applicable lifecycle rule.
    #[tracing::instrument(fields(name = ?self.name(), status = ?self.status) skip(self))]
    async fn tick(self) -> Result<ReconcilerAction, Error> {
        let status = match &self.status {
            None => return self.start().await,
            Some(status) => status.clone(),
        };
        if self.reset_requested {
            return self.reset(status).await;
        }
        match next_step(&status) {
            Step::RequestDeploy => self.request_deploy(status).await,
            Step::ClearDeploying => self.clear_deploying(status).await,
            Step::Deploy => self.deploy(status).await,
            Step::RequestSubmit => self.request_submit(status).await,
            Step::ClearJobCreating => self.clear_job_creating(status).await,
            Step::SubmitJob => self.submit_job(status).await,
            Step::Monitor => self.monitor(status).await,
        }
    }

    /// Record the deploy intent; the follow-up event consumes it.
    async fn request_deploy(&self, status: BeamServiceStatus) -> Result<ReconcilerAction, Error> {
        self.k8s_notify(
            "Jar deployment",
            "JarDeploying",
            "Requesting to deploy jar",
            "Normal",
        )
        .await;
        let _ = self
            .patch_status(BeamServiceStatus {
                deploying: true,
                updated_on: Some(timestamp()),
                ..status
            })
            .await?;
        Ok(self.requeue())
    }

    /// `deployed && deploying` means the deploy handler died unfinished.
    async fn clear_deploying(&self, status: BeamServiceStatus) -> Result<ReconcilerAction, Error> {
        self.k8s_notify(
            "Jar deployment",
            "JarDeploying",
            "Inconsistent state. Fixing",
            "Normal",
        )
        .await;
        let _ = self
            .patch_status(BeamServiceStatus {
                deploying: false,
                updated_on: Some(timestamp()),
                ..status
            })
            .await?;
        Ok(self.requeue())
    }

    /// Record the submit intent; the follow-up event consumes it.
    async fn request_submit(&self, status: BeamServiceStatus) -> Result<ReconcilerAction, Error> {
        self.k8s_notify(
            "Job submission",
            "JobSubmitting",
            "Requesting job submission Task",
            "Normal",
        )
        .await;
        let _ = self
            .patch_status(BeamServiceStatus {
                job_creating: true,
                updated_on: Some(timestamp()),
                ..status
            })
            .await?;
        Ok(self.requeue())
    }

    async fn clear_job_creating(
        &self,
        status: BeamServiceStatus,
    ) -> Result<ReconcilerAction, Error> {
        self.k8s_notify(
            "Job submission",
            "JobSubmitting",
            "Inconsistent state. Fixing",
            "Normal",
        )
        .await;
        let _ = self
            .patch_status(BeamServiceStatus {
                job_creating: false,
                updated_on: Some(timestamp()),
                ..status
            })
            .await?;
        Ok(self.requeue())
    }

    /// Download the artifact and upload it to the job manager. Runs while
    /// `deploying` is set; on success the flag flips to `deployed`.
    #[tracing::instrument(fields(name = ?self.name(), retries = self.num_retries) skip(self, status))]
    async fn deploy(self, status: BeamServiceStatus) -> Result<ReconcilerAction, Error> {
        if self.num_retries > self.ctx.retries {
            return self.give_up(status).await;
        }

        // a previous incarnation's artifact must not outlive the new jar
        if status.jar_path.is_some() {
            delete_jar(&status);
        }

        let path = match fetch::fetch_jar(&self.ctx.http, &self.spec.package).await {
            Ok(path) => path,
            Err(error) if error.is_permanent() => {
                self.k8s_notify(
                    "Jar download",
                    "BeamDeploymentFailed",
                    "Invalid url (must start with http or ftp)",
                    "Warning",
                )
                .await;
                return Err(Error::Permanent {
                    reason: error.to_string(),
                });
            }
            Err(error) => {
                self.k8s_notify(
                    "Jar download",
                    "BeamDeploymentFailed",
                    &format!("Could not fetch jar: {}", error),
                    "Warning",
                )
                .await;
                return Err(Error::Retry {
                    reason: "No jar_path returned. Try later again.".to_string(),
                    delay: Duration::from_secs(5),
                });
            }
        };

        match self.ctx.flink.upload_jar(&path).await {
            Ok(jar_id) => {
                self.k8s_notify(
                    "Jar upload",
                    "BeamDeploymentSuccess",
                    &format!("Submitted jar with id: {}", jar_id),
                    "Normal",
                )
                .await;
                let _ = self
                    .patch_status(BeamServiceStatus {
                        deployed: true,
                        deploying: false,
                        jar_path: Some(path.display().to_string()),
                        jar_id: Some(jar_id),
                        updated_on: Some(timestamp()),
                        ..status
                    })
                    .await?;
                Ok(self.requeue())
            }
            Err(error) => {
                // nothing recorded the download yet, so it must not survive
                // this attempt
                let _ = std::fs::remove_file(&path);
                self.k8s_notify(
                    "Jar upload",
                    "BeamDeploymentFailed",
                    &format!("Could not submit jar, server returned: {}", error),
                    "Warning",
                )
                .await;
                Err(Error::Retry {
                    reason: "Jar submission failed.".to_string(),
                    delay: Duration::from_secs(self.ctx.backoff),
                })
            }
        }
    }

    /// Submit the job from the uploaded jar. Runs while `job_creating` is
    /// set; admission-checked against the free task slots.
    #[tracing::instrument(fields(name = ?self.name(), retries = self.num_retries) skip(self, status))]
    async fn submit_job(self, status: BeamServiceStatus) -> Result<ReconcilerAction, Error> {
        if self.num_retries > self.ctx.retries {
            return self.give_up(status).await;
        }

        match self.ctx.flink.free_slots().await {
            Ok(slots) if slots > 0 => {}
            Ok(_) => {
                self.k8s_notify(
                    "Job submission",
                    "JobSubmitting",
                    "No free task slots available",
                    "Warning",
                )
                .await;
                return Err(Error::Retry {
                    reason: "No free task slots available".to_string(),
                    delay: Duration::from_secs(5),
                });
            }
            Err(error) => {
                return Err(Error::Retry {
                    reason: format!("Could not query free slots: {}", error),
                    delay: Duration::from_secs(5),
                });
            }
        }

        let jar_id = match &status.jar_id {
            Some(jar_id) => jar_id.clone(),
            None => return self.invariant_broken("jarId").await,
        };

        let program_args = match args::build_args(&self.spec.args, &self.spec.tokens) {
            Ok(program_args) => program_args,
            Err(error) => {
                self.k8s_notify(
                    "Job submission",
                    "BeamExecutionFailed",
                    &format!("Could not render program args: {}", error),
                    "Warning",
                )
                .await;
                return Err(Error::Retry {
                    reason: error.to_string(),
                    delay: Duration::from_secs(5),
                });
            }
        };
        debug!(jar_id = %jar_id, args = %program_args, "submitting job");

        match self
            .ctx
            .flink
            .run_job(&jar_id, &self.spec.entry_class, &program_args)
            .await
        {
            Ok(job_id) => {
                self.k8s_notify(
                    "Job submission",
                    "JobCreated",
                    &format!("Job id: {}", job_id),
                    "Normal",
                )
                .await;
                let _ = self
                    .patch_status(BeamServiceStatus {
                        job_id: Some(job_id),
                        job_created: true,
                        job_creating: false,
                        updated_on: Some(timestamp()),
                        ..status
                    })
                    .await?;
                Ok(self.requeue())
            }
            Err(error) => {
                self.k8s_notify(
                    "Job submission",
                    "BeamExecutionFailed",
                    &format!("Could not run job, server returned: {}", error),
                    "Warning",
                )
                .await;
                Err(Error::Retry {
                    reason: "No job returned. Try later again.".to_string(),
                    delay: Duration::from_secs(5),
                })
            }
        }
    }

    /// Check the Flink state of the submitted job. A 404 triggers a full
    /// redeploy, FAILED tears everything down, network errors change
    /// nothing.
    #[tracing::instrument(fields(name = ?self.name(), status = ?self.status) skip(self, status))]
    async fn monitor(self, status: BeamServiceStatus) -> Result<ReconcilerAction, Error> {
        let job_id = match &status.job_id {
            Some(job_id) => job_id.clone(),
            None => return self.invariant_broken("jobId").await,
        };

        match self.ctx.flink.get_job(&job_id).await {
            Ok(JobQuery::NotFound) => {
                self.k8s_notify(
                    "Monitoring",
                    "JobNotFound",
                    "Job not found, triggering redeploy.",
                    "Warning",
                )
                .await;
                let _ = self
                    .patch_status(BeamServiceStatus {
                        deployed: false,
                        job_created: false,
                        updated_on: Some(timestamp()),
                        ..status
                    })
                    .await?;
                Ok(self.requeue())
            }
            Ok(JobQuery::Found(details)) => {
                if details.failed() {
                    self.k8s_notify(
                        "Monitoring",
                        "JobFailed",
                        "Pipeline FAILED, canceling and restarting.",
                        "Warning",
                    )
                    .await;
                    self.cancel_job(&status).await;
                    delete_jar(&status);
                    let mut reset = status.reset();
                    reset.state = Some(STATE_RESTARTING.to_string());
                    let _ = self.patch_status(reset).await?;
                } else if details.state.is_some() && details.state != status.state {
                    let _ = self
                        .patch_status(BeamServiceStatus {
                            state: details.state,
                            ..status
                        })
                        .await?;
                }
                Ok(self.requeue())
            }
            Err(error) => {
                // leave the status untouched; the job manager will be back
                debug!(%error, "could not query job state");
                Ok(self.requeue())
            }
        }
    }

    /// The retry budget for the current handler is used up: tear everything
    /// down so the next tick restarts the lifecycle from the beginning.
    async fn give_up(&self, status: BeamServiceStatus) -> Result<ReconcilerAction, Error> {
        self.k8s_notify(
            "Retries exhausted",
            "MaxRetry",
            &format!(
                "Handler reached maximum retries ({}). Reset states.",
                self.ctx.retries
            ),
            "Warning",
        )
        .await;
        self.cancel_job(&status).await;
        delete_jar(&status);
        let _ = self.patch_status(status.reset()).await?;
        Ok(self.requeue())
    }

    /// The spec.reset value changed: cancel, unlink and start over.
    async fn reset(self, status: BeamServiceStatus) -> Result<ReconcilerAction, Error> {
        self.k8s_notify("Reset", "ResetTriggered", "Reset triggered in spec.", "Normal")
            .await;
        self.cancel_job(&status).await;
        delete_jar(&status);
        let _ = self.patch_status(status.reset()).await?;
        self.ctx.clear_reset(&self.name()).await;
        Ok(self.requeue())
    }

    /// Our notification that the resource is going away: cancel the job and
    /// remove the artifact, then release the finalizer.
    #[tracing::instrument(fields(name = ?self.name()) skip(self))]
    async fn cleanup(self) -> Result<ReconcilerAction, Error> {
        if let Some(status) = self.status.clone() {
            self.cancel_job(&status).await;
            delete_jar(&status);
        }
        self.k8s_notify(
            "Deleting",
            "Deleting",
            "Job canceled and artifact removed",
            "Normal",
        )
        .await;
        let finalizers = self.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == FINALIZER) {
            self.remove_finalizer().await?;
        }
        self.ctx.remove(self.name()).await;
        Ok(ReconcilerAction {
            requeue_after: None,
        })
    }

    /// Cancel the Flink job recorded in the status, best effort. Missing
    /// job ids and unreachable job managers only produce a warning event.
    async fn cancel_job(&self, status: &BeamServiceStatus) {
        if let Some(job_id) = &status.job_id {
            if let Err(error) = self.ctx.flink.cancel_job(job_id).await {
                self.k8s_notify(
                    "Cancel job",
                    "CancelJob",
                    &format!("Could not cancel job {}: {}", job_id, error),
                    "Warning",
                )
                .await;
            }
        }
    }

    /// The status lost a field the state machine relies on; the resource
    /// stays stuck until it is manually reset.
    async fn invariant_broken(&self, field: &str) -> Result<ReconcilerAction, Error> {
        self.k8s_notify(
            "Invariant",
            "StatusBroken",
            &format!("status is missing '{}' after initialization", field),
            "Warning",
        )
        .await;
        Err(Error::ReconcileError { name: self.name() })
    }

    async fn k8s_notify(&self, action: &str, reason: &str, message: &str, type_: &str) {
        events::notify(
            &self.ctx.k8s,
            &self.inner,
            WHO_AM_I_SHORT,
            action,
            reason,
            message,
            type_,
        )
        .await
    }
}

/// ensure the CRD is installed. This creates a chicken and egg problem. When
/// the CRD is removed, the operator will fail to list the CRD going into a
/// error loop.
///
/// To prevent that, we will simply panic, and hope we can make progress after
/// restart.
async fn ensure_crd(
    k8s: Client,
    crd_name: &str,
    crd: k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
) {
    let crds: Api<
        k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    > = Api::all(k8s);
    let lp = ListParams::default().fields(&format!("metadata.name={}", crd_name));
    let existing = crds.list(&lp).await.expect("failed to list CRDS");

    // the CRD has not been installed yet, to avoid overwriting (and create
    // upgrade issues) only install it when there is no crd with the given
    // name
    if existing.iter().count() == 0 {
        info!(
            "Creating CRD: {}",
            serde_json::to_string_pretty(&crd).unwrap()
        );

        let pp = PostParams::default();
        match crds.create(&pp, &crd).await {
            Ok(o) => {
                info!(crd = ?o.name(), "created");
                // let the CRD settle this purely to avoid errors messages in
                // the console that are harmless but can cause some confusion
                // maybe.
                tokio::time::sleep(Duration::from_secs(5)).await;
            }

            Err(e) => {
                error!("failed to create CRD error {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                std::process::exit(1);
            }
        }
    } else {
        info!("CRD present")
    }
}

/// Determine what we want to do when dealing with errors from the
/// reconciliation loop
fn error_policy(error: &Error, _ctx: Context<OperatorContext>) -> ReconcilerAction {
    let duration = match error {
        Error::Retry { delay, .. } => *delay,

        Error::ReconcileError { .. } | Error::Permanent { .. } => {
            warn!("{}, waiting for a spec change", error);
            return ReconcilerAction {
                requeue_after: None,
            };
        }
        _ => Duration::from_secs(5),
    };

    let when = Utc::now()
        .checked_add_signed(chrono::Duration::from_std(duration).unwrap())
        .unwrap();
    warn!(
        "{}, retry scheduled @{} ({} seconds from now)",
        error,
        when.to_rfc2822(),
        duration.as_secs()
    );
    ReconcilerAction {
        requeue_after: Some(duration),
    }
}

/// The main work horse
#[tracing::instrument(fields(name = %bs.name(), status = ?bs.status) skip(bs, ctx))]
async fn reconcile(
    bs: BeamService,
    ctx: Context<OperatorContext>,
) -> Result<ReconcilerAction, Error> {
    let ctx = ctx.into_inner();
    let bs = ctx.upsert(ctx.clone(), bs).await;

    if bs.metadata.deletion_timestamp.is_some() {
        return bs.cleanup().await;
    }
    bs.ensure_finalizer().await?;
    bs.tick().await
}

async fn service_controller(args: ArgMatches<'_>) -> anyhow::Result<()> {
    let k8s = Client::try_default().await?;
    let namespace = args.value_of("namespace").unwrap().to_string();
    ensure_crd(k8s.clone(), "beamservices.oisp.org", BeamService::crd()).await;

    let bs: Api<BeamService> = Api::namespaced(k8s.clone(), &namespace);
    let lp = ListParams::default();

    let flink_url = args
        .value_of("flink-url")
        .map(str::to_string)
        .unwrap_or_else(|| format!("http://flink-jobmanager-rest.{}:8081", namespace));
    let gateway_url = args
        .value_of("sql-gateway-url")
        .map(str::to_string)
        .unwrap_or_else(|| format!("http://flink-sql-gateway.{}:9000", namespace));

    let interval: Duration = args
        .value_of("interval")
        .unwrap()
        .parse::<humantime::Duration>()
        .expect("interval value is invalid")
        .into();
    let backoff: Duration = args
        .value_of("backoff")
        .unwrap()
        .parse::<humantime::Duration>()
        .expect("backoff value is invalid")
        .into();

    let context = Context::new(OperatorContext {
        k8s,
        inventory: tokio::sync::RwLock::new(HashMap::new()),
        flink: FlinkClient::new(flink_url, gateway_url),
        http: reqwest::Client::new(),
        interval: interval.as_secs(),
        backoff: backoff.as_secs(),
        retries: args
            .value_of("retries")
            .unwrap()
            .parse::<u32>()
            .expect("retries value is invalid"),
    });

    info!(
        "Starting BeamService Operator in namespace {}",
        namespace
    );

    Controller::new(bs, lp)
        .run(reconcile, error_policy, context)
        .for_each(|res| async move {
            match res {
                Ok(o) => {
                    trace!(?o);
                }
                Err(e) => {
                    trace!(?e);
                }
            }
        })
        .await;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let matches = App::new(WHO_AM_I_SHORT)
        .version(clap::crate_version!())
        .settings(&[
            clap::AppSettings::ColoredHelp,
            clap::AppSettings::ColorAlways,
        ])
        .arg(
            Arg::with_name("namespace")
                .long("namespace")
                .short("n")
                .env("OISP_NAMESPACE")
                .required(true)
                .help("the namespace we are supposed to operate in"),
        )
        .arg(
            Arg::with_name("flink-url")
                .long("flink-url")
                .short("f")
                .env("OISP_FLINK_REST")
                .help("base URL of the Flink job manager REST endpoint"),
        )
        .arg(
            Arg::with_name("sql-gateway-url")
                .long("sql-gateway-url")
                .short("g")
                .env("OISP_FLINK_SQL_GATEWAY")
                .help("base URL of the Flink SQL gateway"),
        )
        .arg(
            Arg::with_name("interval")
                .short("i")
                .long("interval")
                .env("TIMER_INTERVAL")
                .default_value("5s")
                .help("specify timer based reconciliation loop"),
        )
        .arg(
            Arg::with_name("backoff")
                .short("b")
                .long("backoff")
                .env("TIMER_BACKOFF_INTERVAL")
                .default_value("10s")
                .help("retry delay after a failed jar upload"),
        )
        .arg(
            Arg::with_name("retries")
                .short("r")
                .long("retries")
                .env("OISP_BEAMOPERATOR_RETRY")
                .default_value("20")
                .help("the number of retries before the resource is reset"),
        )
        .get_matches();

    init_tracing();

    service_controller(matches).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn status() -> BeamServiceStatus {
        BeamServiceStatus::default()
    }

    #[test]
    fn fresh_resources_request_a_deploy() {
        assert_eq!(next_step(&status()), Step::RequestDeploy);
    }

    #[test]
    fn deploy_intent_is_consumed_before_submission() {
        let s = BeamServiceStatus {
            deploying: true,
            ..status()
        };
        assert_eq!(next_step(&s), Step::Deploy);
    }

    #[test]
    fn inconsistent_deploy_flags_are_healed_first() {
        let s = BeamServiceStatus {
            deployed: true,
            deploying: true,
            job_creating: true,
            ..status()
        };
        assert_eq!(next_step(&s), Step::ClearDeploying);
    }

    #[test]
    fn deployed_resources_request_a_submission() {
        let s = BeamServiceStatus {
            deployed: true,
            jar_id: Some("jar".to_string()),
            ..status()
        };
        assert_eq!(next_step(&s), Step::RequestSubmit);
    }

    #[test]
    fn submit_intent_is_consumed() {
        let s = BeamServiceStatus {
            deployed: true,
            jar_id: Some("jar".to_string()),
            job_creating: true,
            ..status()
        };
        assert_eq!(next_step(&s), Step::SubmitJob);
    }

    #[test]
    fn inconsistent_submit_flags_are_healed() {
        let s = BeamServiceStatus {
            deployed: true,
            job_created: true,
            job_creating: true,
            ..status()
        };
        assert_eq!(next_step(&s), Step::ClearJobCreating);
    }

    #[test]
    fn goal_state_only_monitors() {
        let s = BeamServiceStatus {
            deployed: true,
            job_created: true,
            jar_id: Some("jar".to_string()),
            job_id: Some("job".to_string()),
            state: Some("RUNNING".to_string()),
            ..status()
        };
        assert_eq!(next_step(&s), Step::Monitor);
    }

    #[test]
    fn happy_path_steps_in_order() {
        // timer 1: request the deploy
        let mut s = status();
        assert_eq!(next_step(&s), Step::RequestDeploy);
        s.deploying = true;

        // follow-up: deploy, flipping to deployed
        assert_eq!(next_step(&s), Step::Deploy);
        s.deploying = false;
        s.deployed = true;
        s.jar_id = Some("J".to_string());

        // timer 2: request the submission
        assert_eq!(next_step(&s), Step::RequestSubmit);
        s.job_creating = true;

        // follow-up: submit, flipping to created
        assert_eq!(next_step(&s), Step::SubmitJob);
        s.job_creating = false;
        s.job_created = true;
        s.job_id = Some("R".to_string());

        // timer 3 onwards: monitor
        assert_eq!(next_step(&s), Step::Monitor);
    }

    #[test]
    fn job_vanishing_restarts_the_lifecycle() {
        // monitoring observed a 404 and clears both phase flags
        let s = BeamServiceStatus {
            deployed: false,
            job_created: false,
            jar_id: Some("J".to_string()),
            job_id: Some("R".to_string()),
            ..status()
        };
        assert_eq!(next_step(&s), Step::RequestDeploy);
    }
}

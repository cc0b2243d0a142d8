//! K8S beam-sql-statement-set operator: watches BeamSqlStatementSet CRs,
//! compiles the referenced BeamSqlTable resources into CREATE TABLE DDL and
//! deploys the composed statement set to the Flink SQL gateway as one
//! pipeline.
//!
//! The lifecycle is tracked in `status.state`:
//! `INITIALIZED` resources are deployed, deployed resources are monitored
//! against the job manager, deletion cancels the job and waits for the
//! `CANCELED` confirmation. A resource that reaches `CANCELED` outside of
//! deletion stays there; there is no automatic resubmission.

use beam_operators::{
    crd::{BeamSqlStatementSet, BeamSqlStatementSetStatus, BeamSqlTable, StatementSetState},
    ddl, events,
    tables::{self, TableIndex},
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
use std::{ops::Deref, sync::Arc, time::Duration};
use tracing::{debug, error, info, trace, warn};

const WHO_AM_I: &str = "BeamSqlStatementSet Operator";
const WHO_AM_I_SHORT: &str = "beamsqlstatementset-operator";
const FINALIZER: &str = "oisp.org/beamsqlstatementset-protection";

/// Errors generated during the reconciliation loop
#[derive(Debug, Snafu)]
pub(crate) enum Error {
    #[snafu(display("Kubernetes client error: {}", source))]
    /// k8s client error
    Kube {
        source: kube::Error,
    },
    #[snafu(display("{}", reason))]
    /// Transient failure, requeued after the carried delay
    Retry {
        reason: String,
        delay: Duration,
    },
}

/// Per resource context; the operator context reference gives the handlers
/// access to the shared clients and the table index.
#[derive(Clone)]
pub(crate) struct ResourceContext {
    /// The latest CRD known to us
    inner: BeamSqlStatementSet,
    /// Reference to the operator context
    ctx: Arc<OperatorContext>,
}

impl Deref for ResourceContext {
    type Target = BeamSqlStatementSet;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Data we want access to in error/reconcile calls
pub(crate) struct OperatorContext {
    /// Reference to our k8s client
    k8s: Client,
    /// Flink cluster client
    flink: FlinkClient,
    /// Snapshot of the BeamSqlTable resources, kept in sync by the watch
    tables: TableIndex,
    /// Timer interval
    interval: u64,
    /// Backoff after unclassified reconcile errors
    backoff: u64,
    /// Backoff after temporary upstream failures
    temporary_failure_backoff: u64,
}

impl OperatorContext {
    fn temporary_backoff(&self) -> Duration {
        Duration::from_secs(self.temporary_failure_backoff)
    }
}

impl ResourceContext {
    /// Construct an API handle for the resource
    fn api(&self) -> Api<BeamSqlStatementSet> {
        Api::namespaced(self.ctx.k8s.clone(), &self.namespace().unwrap())
    }

    fn requeue(&self) -> ReconcilerAction {
        ReconcilerAction {
            requeue_after: Some(Duration::from_secs(self.ctx.interval)),
        }
    }

    /// One merge-patch per handler exit keeps the status write atomic from
    /// the API server's view.
    async fn patch_status(
        &self,
        status: BeamSqlStatementSetStatus,
    ) -> Result<BeamSqlStatementSet, Error> {
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

    /// Initialize the status: `INITIALIZED` with no job id.
    async fn start(&self) -> Result<ReconcilerAction, Error> {
        let name = self.name();
        let namespace = self.namespace().unwrap();
        self.k8s_notify(
            "Creating",
            "Creating",
            &format!("Creating beamsqlstatementsets {} in namespace {}", name, namespace),
            "Normal",
        )
        .await;
        info!(
            "Created beamsqlstatementsets {} in namespace {}",
            name, namespace
        );
        let _ = self
            .patch_status(BeamSqlStatementSetStatus::initial())
            .await?;
        Ok(ReconcilerAction {
            requeue_after: None,
        })
    }

    /// One timer tick, gated by the current state.
    #[tracing::instrument(fields(name = ?self.name(), status = ?self.status) skip(self))]
    async fn tick(self) -> Result<ReconcilerAction, Error> {
        let status = match &self.status {
            None => return self.start().await,
            Some(status) => status.clone(),
        };
        match status.state {
            StatementSetState::Initialized | StatementSetState::DeploymentFailure => {
                self.deploy(status).await
            }
            // terminal/in-progress deletions are not re-monitored
            StatementSetState::Canceled | StatementSetState::Canceling => Ok(self.requeue()),
            _ => self.monitor(status).await,
        }
    }

    /// Resolve every referenced table, synthesize the DDL prolog and submit
    /// the whole statement set to the SQL gateway.
    #[tracing::instrument(fields(name = ?self.name()) skip(self, status))]
    async fn deploy(
        self,
        status: BeamSqlStatementSetStatus,
    ) -> Result<ReconcilerAction, Error> {
        let namespace = self.namespace().unwrap();
        let name = self.name();

        let mut ddls = Vec::with_capacity(self.spec.tables.len());
        for table_name in &self.spec.tables {
            let table: BeamSqlTable = match self.ctx.tables.get(&namespace, table_name).await {
                Some(table) => table,
                None => {
                    self.k8s_notify(
                        "Deploying",
                        "TableMissing",
                        &format!(
                            "Table {}/{} is not known. Check the table definitions and references.",
                            namespace, table_name
                        ),
                        "Warning",
                    )
                    .await;
                    return Err(Error::Retry {
                        reason: format!(
                            "Table DDLs could not be created for {}/{}",
                            namespace, name
                        ),
                        delay: self.ctx.temporary_backoff(),
                    });
                }
            };
            match ddl::create_ddl(&table) {
                Ok(ddl) => ddls.push(ddl),
                Err(error) => {
                    self.k8s_notify("Deploying", "InvalidTable", &error.to_string(), "Warning")
                        .await;
                    return Err(Error::Retry {
                        reason: format!(
                            "Table DDLs could not be created for {}/{}",
                            namespace, name
                        ),
                        delay: self.ctx.temporary_backoff(),
                    });
                }
            }
        }

        let statementset =
            ddl::compose_statement_set(&namespace, &name, &ddls, &self.spec.sqlstatements);
        debug!(statementset = %statementset, "deploying statement set");

        match self.ctx.flink.submit_statement_set(&statementset).await {
            Ok(job_id) => {
                self.k8s_notify(
                    "Deploying",
                    "Deployed",
                    &format!("Submitted statement set as job {}", job_id),
                    "Normal",
                )
                .await;
                let _ = self
                    .patch_status(status.with_state(StatementSetState::Deploying, Some(job_id)))
                    .await?;
                Ok(self.requeue())
            }
            Err(error) => {
                self.k8s_notify(
                    "Deploying",
                    "DeploymentFailure",
                    &format!("Could not deploy statementset: {}", error),
                    "Warning",
                )
                .await;
                let _ = self
                    .patch_status(status.with_state(StatementSetState::DeploymentFailure, None))
                    .await?;
                Err(Error::Retry {
                    reason: format!("Could not deploy statement: {}", error),
                    delay: self.ctx.temporary_backoff(),
                })
            }
        }
    }

    /// Refresh the observed pipeline state from the job manager.
    async fn monitor(
        self,
        status: BeamSqlStatementSetStatus,
    ) -> Result<ReconcilerAction, Error> {
        let _ = self.refresh_state(&status).await?;
        Ok(self.requeue())
    }

    /// Ask the job manager for the pipeline state and write its normalized
    /// reflection to the status. Any failure to observe the job flips the
    /// state to `UNKNOWN` and raises a retryable error.
    async fn refresh_state(
        &self,
        status: &BeamSqlStatementSetStatus,
    ) -> Result<StatementSetState, Error> {
        let observed = match &status.job_id {
            None => None,
            Some(job_id) => match self.ctx.flink.get_job(job_id).await {
                Ok(JobQuery::Found(details)) => {
                    details.state.as_deref().map(StatementSetState::from_flink)
                }
                Ok(JobQuery::NotFound) => None,
                Err(error) => {
                    debug!(%error, "could not query job state");
                    None
                }
            },
        };

        let new_state = match observed {
            Some(state) => state,
            None => {
                if status.state != StatementSetState::Unknown {
                    let _ = self
                        .patch_status(
                            status.with_state(StatementSetState::Unknown, status.job_id.clone()),
                        )
                        .await?;
                }
                return Err(Error::Retry {
                    reason: format!(
                        "Could not monitor task {}",
                        status.job_id.as_deref().unwrap_or("<none>")
                    ),
                    delay: self.ctx.temporary_backoff(),
                });
            }
        };

        if new_state != status.state {
            let _ = self
                .patch_status(status.with_state(new_state, status.job_id.clone()))
                .await?;
        }
        Ok(new_state)
    }

    /// Deletion handler: cancel the job, wait for the `CANCELED`
    /// confirmation and only then release the finalizer. Retryable at every
    /// step and tolerant of resources that never deployed anything.
    #[tracing::instrument(fields(name = ?self.name(), status = ?self.status) skip(self))]
    async fn cleanup(self) -> Result<ReconcilerAction, Error> {
        let namespace = self.namespace().unwrap();
        let name = self.name();

        let status = match self.status.clone() {
            None => return self.finish_deletion().await,
            Some(status) => status,
        };

        match status.state {
            StatementSetState::Canceled => self.finish_deletion().await,
            StatementSetState::Canceling => {
                let state = self.refresh_state(&status).await?;
                if state == StatementSetState::Canceled {
                    self.finish_deletion().await
                } else {
                    Err(Error::Retry {
                        reason: format!(
                            "Canceling, waiting for final confirmation of cancelation for {}/{}",
                            namespace, name
                        ),
                        delay: Duration::from_secs(5),
                    })
                }
            }
            _ => {
                let job_id = match &status.job_id {
                    Some(job_id) => job_id.clone(),
                    None => {
                        // nothing was ever submitted, nothing to cancel
                        let _ = self
                            .patch_status(status.with_state(StatementSetState::Canceled, None))
                            .await?;
                        return self.finish_deletion().await;
                    }
                };
                match self.ctx.flink.cancel_job(&job_id).await {
                    Ok(()) => {
                        let _ = self
                            .patch_status(
                                status.with_state(StatementSetState::Canceling, Some(job_id)),
                            )
                            .await?;
                        Err(Error::Retry {
                            reason: format!(
                                "Waiting for confirmation of cancelation for {}/{}",
                                namespace, name
                            ),
                            delay: Duration::from_secs(5),
                        })
                    }
                    Err(error) => Err(Error::Retry {
                        reason: format!(
                            "Error trying to cancel {}/{} with message {}. Trying again later",
                            namespace, name, error
                        ),
                        delay: Duration::from_secs(10),
                    }),
                }
            }
        }
    }

    async fn finish_deletion(&self) -> Result<ReconcilerAction, Error> {
        let namespace = self.namespace().unwrap();
        let name = self.name();
        self.k8s_notify(
            "Deleting",
            "Canceled",
            &format!("{}/{} cancelled and ready for deletion", namespace, name),
            "Normal",
        )
        .await;
        info!("{}/{} cancelled and ready for deletion", namespace, name);
        let finalizers = self.metadata.finalizers.clone().unwrap_or_default();
        if finalizers.iter().any(|f| f == FINALIZER) {
            self.remove_finalizer().await?;
        }
        Ok(ReconcilerAction {
            requeue_after: None,
        })
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

/// ensure the CRD is installed, without overwriting an existing one.
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

    if existing.iter().count() == 0 {
        info!(
            "Creating CRD: {}",
            serde_json::to_string_pretty(&crd).unwrap()
        );

        let pp = PostParams::default();
        match crds.create(&pp, &crd).await {
            Ok(o) => {
                info!(crd = ?o.name(), "created");
                // let the CRD settle before watches start
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
fn error_policy(error: &Error, ctx: Context<OperatorContext>) -> ReconcilerAction {
    let duration = match error {
        Error::Retry { delay, .. } => *delay,
        _ => Duration::from_secs(ctx.into_inner().backoff),
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
#[tracing::instrument(fields(name = %sset.name(), status = ?sset.status) skip(sset, ctx))]
async fn reconcile(
    sset: BeamSqlStatementSet,
    ctx: Context<OperatorContext>,
) -> Result<ReconcilerAction, Error> {
    let ctx = ctx.into_inner();
    let sset = ResourceContext { inner: sset, ctx };

    if sset.metadata.deletion_timestamp.is_some() {
        return sset.cleanup().await;
    }
    sset.ensure_finalizer().await?;
    sset.tick().await
}

async fn statement_set_controller(args: ArgMatches<'_>) -> anyhow::Result<()> {
    let k8s = Client::try_default().await?;
    let namespace = args.value_of("namespace").unwrap().to_string();
    ensure_crd(
        k8s.clone(),
        "beamsqlstatementsets.oisp.org",
        BeamSqlStatementSet::crd(),
    )
    .await;
    ensure_crd(k8s.clone(), "beamsqltables.oisp.org", BeamSqlTable::crd()).await;

    let sset: Api<BeamSqlStatementSet> = Api::namespaced(k8s.clone(), &namespace);
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
    let temporary_failure_backoff: Duration = args
        .value_of("temporary-failure-backoff")
        .unwrap()
        .parse::<humantime::Duration>()
        .expect("temporary failure backoff value is invalid")
        .into();

    // the table index follows the cluster from a background watch
    let tables = TableIndex::default();
    let table_api: Api<BeamSqlTable> = Api::namespaced(k8s.clone(), &namespace);
    tokio::spawn(tables::run(table_api, tables.clone()));

    let context = Context::new(OperatorContext {
        k8s,
        flink: FlinkClient::new(flink_url, gateway_url),
        tables,
        interval: interval.as_secs(),
        backoff: backoff.as_secs(),
        temporary_failure_backoff: temporary_failure_backoff.as_secs(),
    });

    info!(
        "Starting BeamSqlStatementSet Operator in namespace {}",
        namespace
    );

    Controller::new(sset, lp)
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
                .default_value("10s")
                .help("specify timer based reconciliation loop"),
        )
        .arg(
            Arg::with_name("backoff")
                .short("b")
                .long("backoff")
                .env("TIMER_BACKOFF_INTERVAL")
                .default_value("10s")
                .help("retry delay after unclassified reconcile errors"),
        )
        .arg(
            Arg::with_name("temporary-failure-backoff")
                .short("t")
                .long("temporary-failure-backoff")
                .env("TIMER_BACKOFF_TEMPORARY_FAILURE_INTERVAL")
                .default_value("30s")
                .help("retry delay after temporary upstream failures"),
        )
        .get_matches();

    init_tracing();

    statement_set_controller(matches).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn status(state: StatementSetState, job_id: Option<&str>) -> BeamSqlStatementSetStatus {
        BeamSqlStatementSetStatus {
            state,
            job_id: job_id.map(str::to_string),
            created_on: Some("2021-01-01T00:00:00+00:00".to_string()),
            updated_on: None,
        }
    }

    /// The tick gate: which states deploy, which monitor, which do nothing.
    fn gate(state: StatementSetState) -> &'static str {
        match state {
            StatementSetState::Initialized | StatementSetState::DeploymentFailure => "deploy",
            StatementSetState::Canceled | StatementSetState::Canceling => "skip",
            _ => "monitor",
        }
    }

    #[test]
    fn initialized_and_failed_deployments_redeploy() {
        assert_eq!(gate(StatementSetState::Initialized), "deploy");
        assert_eq!(gate(StatementSetState::DeploymentFailure), "deploy");
    }

    #[test]
    fn canceled_states_are_left_alone() {
        assert_eq!(gate(StatementSetState::Canceled), "skip");
        assert_eq!(gate(StatementSetState::Canceling), "skip");
    }

    #[test]
    fn running_states_are_monitored() {
        assert_eq!(gate(StatementSetState::Deploying), "monitor");
        assert_eq!(gate(StatementSetState::Running), "monitor");
        assert_eq!(gate(StatementSetState::Failed), "monitor");
        assert_eq!(gate(StatementSetState::Unknown), "monitor");
    }

    #[test]
    fn with_state_keeps_the_creation_stamp() {
        let initial = status(StatementSetState::Running, Some("S"));
        let next = initial.with_state(StatementSetState::Canceling, Some("S".to_string()));
        assert_eq!(next.state, StatementSetState::Canceling);
        assert_eq!(next.created_on, initial.created_on);
        assert!(next.updated_on.is_some());
    }
}

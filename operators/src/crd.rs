//! Custom resource definitions for the Beam operators.
//!
//! Three kinds: `BeamService` (a packaged Flink job delivered as a jar),
//! `BeamSqlTable` (a declaratively described Kafka-backed SQL table) and
//! `BeamSqlStatementSet` (a set of INSERT statements deployed as one
//! pipeline through the SQL gateway).

use chrono::Utc;
use indexmap::IndexMap;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// RFC 3339 timestamp for the `createdOn`/`updatedOn` status fields.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

/// Where to fetch the job artifact from. `url` accepts `http(s)://` and
/// `ftp://`; the credentials are only used for FTP retrieval.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct Package {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// A program argument: either a literal string or a template record rendered
/// by the templater with the spec's tokens.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum ArgValue {
    Literal(String),
    Template(ArgTemplate),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ArgTemplate {
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encode: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "oisp.org",
    version = "v1",
    kind = "BeamService",
    plural = "beamservices",
    namespaced,
    status = "BeamServiceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct BeamServiceSpec {
    pub package: Package,
    pub entry_class: String,
    #[serde(default)]
    pub args: IndexMap<String, ArgValue>,
    /// Opaque tokens consumed by the program-argument templater.
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Changing this value to anything non-null triggers a full reset of the
    /// service without deleting the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset: Option<String>,
}

/// Observed state of a `BeamService`; only written by the operator.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BeamServiceStatus {
    /// The jar has been uploaded; implies `jar_id` is set.
    #[serde(default)]
    pub deployed: bool,
    /// Jar download/upload requested and not yet finished.
    #[serde(default)]
    pub deploying: bool,
    /// The job has been submitted; implies `job_id` is set.
    #[serde(default)]
    pub job_created: bool,
    /// Job submission requested and not yet finished.
    #[serde(default)]
    pub job_creating: bool,
    /// Local path of the downloaded artifact, owned by the operator for the
    /// lifetime of the uploaded jar.
    pub jar_path: Option<String>,
    /// Jar id handed out by the job manager on upload.
    pub jar_id: Option<String>,
    /// Flink job id after submission.
    pub job_id: Option<String>,
    /// Last observed pipeline state, or the synthetic `RESTARTING`.
    pub state: Option<String>,
    pub created_on: Option<String>,
    pub updated_on: Option<String>,
}

impl BeamServiceStatus {
    /// Status stamped at resource creation, every flag in its initial value.
    pub fn initial() -> Self {
        Self {
            created_on: Some(timestamp()),
            ..Self::default()
        }
    }

    /// Clear every lifecycle flag and id, keeping only the creation stamp.
    /// Used by the reset hook, retry exhaustion and the FAILED-job path.
    pub fn reset(&self) -> Self {
        Self {
            created_on: self.created_on.clone(),
            updated_on: Some(timestamp()),
            ..Self::default()
        }
    }
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "oisp.org",
    version = "v1alpha1",
    kind = "BeamSqlTable",
    plural = "beamsqltables",
    namespaced
)]
pub struct BeamSqlTableSpec {
    /// Only `kafka` is supported.
    pub connector: String,
    /// Payload format, e.g. `json`.
    #[serde(default)]
    pub format: String,
    /// Ordered column name to SQL definition mapping. The reserved key
    /// `watermark` holds a full WATERMARK clause body and is not escaped.
    #[serde(default)]
    pub fields: IndexMap<String, String>,
    /// Ordered kafka connector options. `topic` and
    /// `properties.bootstrap.servers` are mandatory; `properties` entries are
    /// flattened as `properties.<key>`.
    #[serde(default)]
    pub kafka: IndexMap<String, Value>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "oisp.org",
    version = "v1alpha1",
    kind = "BeamSqlStatementSet",
    plural = "beamsqlstatementsets",
    namespaced,
    status = "BeamSqlStatementSetStatus"
)]
pub struct BeamSqlStatementSetSpec {
    /// Tables to resolve in the resource's own namespace, in order.
    #[serde(default)]
    pub tables: Vec<String>,
    /// INSERT INTO statements, deployed as one statement set, in order.
    #[serde(default)]
    pub sqlstatements: Vec<String>,
}

/// Observed state of a `BeamSqlStatementSet`; only written by the operator.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct BeamSqlStatementSetStatus {
    pub state: StatementSetState,
    pub job_id: Option<String>,
    #[serde(rename = "createdOn")]
    pub created_on: Option<String>,
    #[serde(rename = "updatedOn")]
    pub updated_on: Option<String>,
}

impl BeamSqlStatementSetStatus {
    /// Status stamped at resource creation.
    pub fn initial() -> Self {
        Self {
            state: StatementSetState::Initialized,
            job_id: None,
            created_on: Some(timestamp()),
            updated_on: None,
        }
    }

    /// Same status with a new state and job id, freshly stamped.
    pub fn with_state(&self, state: StatementSetState, job_id: Option<String>) -> Self {
        Self {
            state,
            job_id,
            created_on: self.created_on.clone(),
            updated_on: Some(timestamp()),
        }
    }
}

/// Lifecycle of a statement set. `Running`, `Failed`, `Canceled` and
/// `Canceling` double as the normalized reflections of the pipeline state
/// reported by Flink. There is no way out of `Canceled` other than deleting
/// the resource.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementSetState {
    Initialized,
    Deploying,
    DeploymentFailure,
    Running,
    Failed,
    Canceled,
    Canceling,
    Unknown,
}

impl StatementSetState {
    /// Normalize the pipeline state reported by the job manager. Flink
    /// spells the in-progress cancellation `CANCELLING`; anything we cannot
    /// map is observed as `Unknown` and refreshed on the next tick.
    pub fn from_flink(state: &str) -> Self {
        match state {
            "RUNNING" => StatementSetState::Running,
            "FAILED" => StatementSetState::Failed,
            "CANCELED" => StatementSetState::Canceled,
            "CANCELLING" | "CANCELING" => StatementSetState::Canceling,
            _ => StatementSetState::Unknown,
        }
    }
}

impl fmt::Display for StatementSetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatementSetState::Initialized => "INITIALIZED",
            StatementSetState::Deploying => "DEPLOYING",
            StatementSetState::DeploymentFailure => "DEPLOYMENT_FAILURE",
            StatementSetState::Running => "RUNNING",
            StatementSetState::Failed => "FAILED",
            StatementSetState::Canceled => "CANCELED",
            StatementSetState::Canceling => "CANCELING",
            StatementSetState::Unknown => "UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn arg_values_deserialize_untagged() {
        let literal: ArgValue = serde_json::from_str(r#""plain""#).unwrap();
        assert_eq!(literal, ArgValue::Literal("plain".to_string()));

        let template: ArgValue =
            serde_json::from_str(r#"{"format":"{0}","encode":"base64"}"#).unwrap();
        assert_eq!(
            template,
            ArgValue::Template(ArgTemplate {
                format: "{0}".to_string(),
                encode: Some("base64".to_string()),
            })
        );
    }

    #[test]
    fn beamservice_status_uses_camel_case() {
        let status = BeamServiceStatus {
            job_created: true,
            jar_id: Some("jar".to_string()),
            ..BeamServiceStatus::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["jobCreated"], serde_json::json!(true));
        assert_eq!(value["jarId"], serde_json::json!("jar"));
        assert!(value.get("job_created").is_none());
    }

    #[test]
    fn reset_keeps_the_creation_stamp_only() {
        let status = BeamServiceStatus {
            deployed: true,
            job_created: true,
            jar_path: Some("/tmp/x.jar".to_string()),
            jar_id: Some("jar".to_string()),
            job_id: Some("job".to_string()),
            state: Some("RUNNING".to_string()),
            created_on: Some("2021-01-01T00:00:00+00:00".to_string()),
            ..BeamServiceStatus::default()
        };
        let reset = status.reset();
        assert!(!reset.deployed && !reset.deploying);
        assert!(!reset.job_created && !reset.job_creating);
        assert_eq!(reset.jar_path, None);
        assert_eq!(reset.jar_id, None);
        assert_eq!(reset.job_id, None);
        assert_eq!(reset.state, None);
        assert_eq!(reset.created_on.as_deref(), Some("2021-01-01T00:00:00+00:00"));
        assert!(reset.updated_on.is_some());
    }

    #[test]
    fn statement_set_states_serialize_screaming() {
        let json = serde_json::to_string(&StatementSetState::DeploymentFailure).unwrap();
        assert_eq!(json, r#""DEPLOYMENT_FAILURE""#);
        let parsed: StatementSetState = serde_json::from_str(r#""CANCELING""#).unwrap();
        assert_eq!(parsed, StatementSetState::Canceling);
    }

    #[test]
    fn flink_states_normalize() {
        assert_eq!(
            StatementSetState::from_flink("RUNNING"),
            StatementSetState::Running
        );
        assert_eq!(
            StatementSetState::from_flink("CANCELLING"),
            StatementSetState::Canceling
        );
        assert_eq!(
            StatementSetState::from_flink("INITIALIZING"),
            StatementSetState::Unknown
        );
    }
}

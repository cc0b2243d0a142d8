//! Thin client for the Flink job manager REST API and the Flink SQL gateway.
//!
//! Every operation maps to a single request and returns a typed result; the
//! client never retries internally. Scheduling retries is the caller's
//! decision, driven by its own state machine.

use serde::Deserialize;
use snafu::Snafu;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Pipeline state reported by Flink for a job that has failed.
pub const STATE_FAILED: &str = "FAILED";

/// Errors generated while talking to the Flink cluster.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("HTTP request to '{}' failed: {}", url, source))]
    /// The request never produced a response (connection refused, reset, ...)
    Request { url: String, source: reqwest::Error },
    #[snafu(display("'{}' returned {}: {}", operation, status, body))]
    /// The server answered with a non-success status code
    Response {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("'{}' response is missing field '{}'", operation, field))]
    /// The server answered 200 but the payload lacks a required field
    MissingField {
        operation: &'static str,
        field: &'static str,
    },
    #[snafu(display("failed to read jar '{}': {}", path.display(), source))]
    /// The local jar file could not be read for upload
    ReadJar {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Error {
    /// Status code of the server response, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Response { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Outcome of a job lookup. A 404 is data for the caller, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum JobQuery {
    /// The job exists; the details carry its pipeline state.
    Found(JobDetails),
    /// The job manager does not know the job (HTTP 404).
    NotFound,
}

/// Subset of `GET /jobs/{id}` we care about.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct JobDetails {
    /// Pipeline state, e.g. `RUNNING`, `FAILED`, `CANCELED`.
    pub state: Option<String>,
}

impl JobDetails {
    /// True when Flink reports the pipeline as failed.
    pub fn failed(&self) -> bool {
        self.state.as_deref() == Some(STATE_FAILED)
    }
}

#[derive(Deserialize, Debug)]
struct UploadResponse {
    filename: String,
}

#[derive(Deserialize, Debug)]
struct RunResponse {
    jobid: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Overview {
    #[serde(rename = "slots-available")]
    slots_available: i64,
}

#[derive(Deserialize, Debug)]
struct StatementResponse {
    jobid: Option<String>,
}

/// Client for one Flink cluster: the job manager REST endpoint plus the SQL
/// gateway in front of it. Stateless; cloning shares the connection pool.
#[derive(Debug, Clone)]
pub struct FlinkClient {
    http: reqwest::Client,
    job_manager: String,
    sql_gateway: String,
}

impl FlinkClient {
    /// New client from the two base URLs (no trailing slashes required).
    pub fn new(job_manager: impl Into<String>, sql_gateway: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            job_manager: trim_base(job_manager.into()),
            sql_gateway: trim_base(sql_gateway.into()),
        }
    }

    /// Upload a local jar via `POST /jars/upload` and return the jar id, the
    /// last path segment of the `filename` the job manager answers with.
    pub async fn upload_jar(&self, path: &Path) -> Result<String, Error> {
        let url = format!("{}/jars/upload", self.job_manager);
        let bytes = tokio::fs::read(path).await.map_err(|source| Error::ReadJar {
            path: path.to_path_buf(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job.jar".to_string());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("jarfile", part);

        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|source| Error::Request { url, source })?;
        let body = Self::success_body(response, "upload jar").await?;
        let upload: UploadResponse =
            serde_json::from_str(&body).map_err(|_| Error::MissingField {
                operation: "upload jar",
                field: "filename",
            })?;
        let jar_id = upload
            .filename
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        debug!(%jar_id, "jar uploaded");
        Ok(jar_id)
    }

    /// Start a job from an uploaded jar via `POST /jars/{id}/run`.
    pub async fn run_job(
        &self,
        jar_id: &str,
        entry_class: &str,
        program_args: &str,
    ) -> Result<String, Error> {
        let url = format!("{}/jars/{}/run", self.job_manager, jar_id);
        let request = serde_json::json!({
            "entryClass": entry_class,
            "programArgs": program_args,
        });
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|source| Error::Request { url, source })?;
        let body = Self::success_body(response, "run job").await?;
        let run: RunResponse = serde_json::from_str(&body).unwrap_or(RunResponse { jobid: None });
        match run.jobid {
            Some(job_id) => {
                debug!(%job_id, "job started");
                Ok(job_id)
            }
            None => Err(Error::MissingField {
                operation: "run job",
                field: "jobid",
            }),
        }
    }

    /// Query `GET /jobs/{id}`. 404 maps to `JobQuery::NotFound` so the caller
    /// can tell an absent job from an unreachable job manager.
    pub async fn get_job(&self, job_id: &str) -> Result<JobQuery, Error> {
        let url = format!("{}/jobs/{}", self.job_manager, job_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| Error::Request { url, source })?;
        if response.status().as_u16() == 404 {
            return Ok(JobQuery::NotFound);
        }
        let body = Self::success_body(response, "get job").await?;
        let details: JobDetails =
            serde_json::from_str(&body).unwrap_or(JobDetails { state: None });
        Ok(JobQuery::Found(details))
    }

    /// Cancel a job via `PATCH /jobs/{id}?mode=cancel`. A 404 counts as
    /// success so repeated cancels after the first one are no-ops.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), Error> {
        let url = format!("{}/jobs/{}", self.job_manager, job_id);
        let response = self
            .http
            .patch(&url)
            .query(&[("mode", "cancel")])
            .send()
            .await
            .map_err(|source| Error::Request { url, source })?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            return Ok(());
        }
        Err(Error::Response {
            operation: "cancel job",
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }

    /// Task slots currently available, from `GET /overview`. Admission check
    /// before job submission.
    pub async fn free_slots(&self) -> Result<i64, Error> {
        let url = format!("{}/overview", self.job_manager);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| Error::Request { url, source })?;
        let body = Self::success_body(response, "overview").await?;
        let overview: Overview =
            serde_json::from_str(&body).map_err(|_| Error::MissingField {
                operation: "overview",
                field: "slots-available",
            })?;
        Ok(overview.slots_available)
    }

    /// Submit a full SQL statement set to the gateway. The gateway keeps a
    /// single implicit session named `session`.
    pub async fn submit_statement_set(&self, statement: &str) -> Result<String, Error> {
        let url = format!("{}/v1/sessions/session/statements", self.sql_gateway);
        debug!(%url, "submitting statement set");
        let request = serde_json::json!({ "statement": statement });
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|source| Error::Request { url, source })?;
        let body = Self::success_body(response, "submit statement set").await?;
        let parsed: StatementResponse =
            serde_json::from_str(&body).unwrap_or(StatementResponse { jobid: None });
        match parsed.jobid {
            Some(job_id) => Ok(job_id),
            None => Err(Error::MissingField {
                operation: "submit statement set",
                field: "jobid",
            }),
        }
    }

    /// Read the body of a 2xx response; anything else becomes a `Response`
    /// error carrying the status code and body text.
    async fn success_body(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<String, Error> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Response {
                operation,
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

fn trim_base(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

#[cfg(test)]
mod test {
    use super::*;

    fn client(server: &mockito::ServerGuard) -> FlinkClient {
        FlinkClient::new(server.url(), server.url())
    }

    #[tokio::test]
    async fn upload_jar_returns_last_filename_segment() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/jars/upload")
            .with_status(200)
            .with_body(r#"{"filename":"/tmp/flink-web-upload/d9a95b_job.jar","status":"success"}"#)
            .create_async()
            .await;

        let path = std::env::temp_dir().join(format!("{}.jar", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"not really a jar").unwrap();

        let jar_id = client(&server).upload_jar(&path).await.unwrap();
        assert_eq!(jar_id, "d9a95b_job.jar");
        mock.assert_async().await;
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn upload_jar_non_200_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/jars/upload")
            .with_status(500)
            .with_body("internal error")
            .create_async()
            .await;

        let path = std::env::temp_dir().join(format!("{}.jar", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"payload").unwrap();

        let error = client(&server).upload_jar(&path).await.unwrap_err();
        assert_eq!(error.status(), Some(500));
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn run_job_parses_jobid() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/jars/d9a95b_job.jar/run")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "entryClass": "org.oisp.Pipeline",
                "programArgs": "--a=1 ",
            })))
            .with_status(200)
            .with_body(r#"{"jobid":"c4f1a3"}"#)
            .create_async()
            .await;

        let job_id = client(&server)
            .run_job("d9a95b_job.jar", "org.oisp.Pipeline", "--a=1 ")
            .await
            .unwrap();
        assert_eq!(job_id, "c4f1a3");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn run_job_without_jobid_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/jars/x/run")
            .with_status(200)
            .with_body(r#"{"errors":["no main class"]}"#)
            .create_async()
            .await;

        let error = client(&server).run_job("x", "C", "").await.unwrap_err();
        assert!(matches!(error, Error::MissingField { field: "jobid", .. }));
    }

    #[tokio::test]
    async fn get_job_distinguishes_404_from_200() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/jobs/gone")
            .with_status(404)
            .with_body(r#"{"errors":["Job gone not found"]}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/jobs/running")
            .with_status(200)
            .with_body(r#"{"jid":"running","state":"RUNNING"}"#)
            .create_async()
            .await;

        let client = client(&server);
        assert_eq!(client.get_job("gone").await.unwrap(), JobQuery::NotFound);
        match client.get_job("running").await.unwrap() {
            JobQuery::Found(details) => {
                assert_eq!(details.state.as_deref(), Some("RUNNING"));
                assert!(!details.failed());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn get_job_5xx_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/jobs/j")
            .with_status(503)
            .create_async()
            .await;

        let error = client(&server).get_job("j").await.unwrap_err();
        assert_eq!(error.status(), Some(503));
    }

    #[tokio::test]
    async fn cancel_job_tolerates_absent_jobs() {
        let mut server = mockito::Server::new_async().await;
        let cancel = server
            .mock("PATCH", "/jobs/j")
            .match_query(mockito::Matcher::UrlEncoded(
                "mode".into(),
                "cancel".into(),
            ))
            .with_status(202)
            .create_async()
            .await;
        server
            .mock("PATCH", "/jobs/gone")
            .match_query(mockito::Matcher::UrlEncoded(
                "mode".into(),
                "cancel".into(),
            ))
            .with_status(404)
            .create_async()
            .await;

        let client = client(&server);
        client.cancel_job("j").await.unwrap();
        client.cancel_job("gone").await.unwrap();
        cancel.assert_async().await;
    }

    #[tokio::test]
    async fn free_slots_reads_overview() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/overview")
            .with_status(200)
            .with_body(r#"{"taskmanagers":1,"slots-total":4,"slots-available":3}"#)
            .create_async()
            .await;

        assert_eq!(client(&server).free_slots().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn submit_statement_set_carries_status_on_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/sessions/session/statements")
            .with_status(500)
            .with_body("gateway exploded")
            .create_async()
            .await;

        let error = client(&server)
            .submit_statement_set("BEGIN STATEMENT SET;\nEND;")
            .await
            .unwrap_err();
        assert_eq!(error.status(), Some(500));
    }

    #[tokio::test]
    async fn submit_statement_set_returns_jobid() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/sessions/session/statements")
            .match_body(mockito::Matcher::Json(serde_json::json!({
                "statement": "SET pipeline.name = 'ns/name';\nBEGIN STATEMENT SET;\nEND;",
            })))
            .with_status(200)
            .with_body(r#"{"jobid":"7d3e"}"#)
            .create_async()
            .await;

        let job_id = client(&server)
            .submit_statement_set("SET pipeline.name = 'ns/name';\nBEGIN STATEMENT SET;\nEND;")
            .await
            .unwrap();
        assert_eq!(job_id, "7d3e");
        mock.assert_async().await;
    }
}

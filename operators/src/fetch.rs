//! Download of the job artifact named by `spec.package`. HTTP(S) downloads
//! go through the shared reqwest client; FTP retrieval runs the blocking
//! suppaftp client on the blocking pool. Either way the artifact lands in
//! the temp directory under a random name with a `.jar` suffix.

use crate::crd::Package;
use snafu::Snafu;
use std::path::PathBuf;
use suppaftp::{types::FileType, FtpStream};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Snafu)]
pub enum FetchError {
    #[snafu(display("invalid url '{}' (must start with http or ftp)", url))]
    /// Permanent: retrying cannot help until the spec is edited.
    UnsupportedScheme { url: String },
    #[snafu(display("invalid ftp url '{}'", url))]
    InvalidFtpUrl { url: String },
    #[snafu(display("downloading '{}' failed: {}", url, source))]
    Http { url: String, source: reqwest::Error },
    #[snafu(display("ftp retrieval of '{}' failed: {}", url, source))]
    Ftp {
        url: String,
        source: suppaftp::FtpError,
    },
    #[snafu(display("ftp retrieval task died: {}", source))]
    FtpTask { source: tokio::task::JoinError },
    #[snafu(display("writing jar to '{}' failed: {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl FetchError {
    /// True when the url itself is unusable and retrying is pointless.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            FetchError::UnsupportedScheme { .. } | FetchError::InvalidFtpUrl { .. }
        )
    }
}

/// Fetch the artifact and return the local path it was saved under.
pub async fn fetch_jar(http: &reqwest::Client, package: &Package) -> Result<PathBuf, FetchError> {
    let url = package.url.clone();
    if url.starts_with("http") {
        fetch_via_http(http, &url).await
    } else if url.starts_with("ftp") {
        fetch_via_ftp(package).await
    } else {
        Err(FetchError::UnsupportedScheme { url })
    }
}

fn jar_path() -> PathBuf {
    std::env::temp_dir().join(format!("{}.jar", Uuid::new_v4()))
}

async fn fetch_via_http(http: &reqwest::Client, url: &str) -> Result<PathBuf, FetchError> {
    let response = http
        .get(url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|source| FetchError::Http {
            url: url.to_string(),
            source,
        })?;
    let bytes = response.bytes().await.map_err(|source| FetchError::Http {
        url: url.to_string(),
        source,
    })?;
    let path = jar_path();
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|source| FetchError::Io {
            path: path.clone(),
            source,
        })?;
    debug!(url, path = %path.display(), bytes = bytes.len(), "jar downloaded");
    Ok(path)
}

async fn fetch_via_ftp(package: &Package) -> Result<PathBuf, FetchError> {
    let url = package.url.clone();
    let (addr, remote_path) = parse_ftp_url(&url)?;
    let username = package.username.clone().unwrap_or_else(|| "anonymous".to_string());
    let password = package.password.clone().unwrap_or_default();
    let path = jar_path();

    let target = path.clone();
    let task_url = url.clone();
    tokio::task::spawn_blocking(move || {
        let retrieve = || -> Result<Vec<u8>, suppaftp::FtpError> {
            let mut ftp = FtpStream::connect(addr.as_str())?;
            ftp.login(&username, &password)?;
            ftp.transfer_type(FileType::Binary)?;
            let buffer = ftp.retr_as_buffer(&remote_path)?;
            let _ = ftp.quit();
            Ok(buffer.into_inner())
        };
        let bytes = retrieve().map_err(|source| FetchError::Ftp {
            url: task_url.clone(),
            source,
        })?;
        std::fs::write(&target, bytes).map_err(|source| FetchError::Io {
            path: target.clone(),
            source,
        })?;
        Ok(target)
    })
    .await
    .map_err(|source| FetchError::FtpTask { source })?
}

/// Split `ftp://host[:port]/path` into a dialable address (default port 21)
/// and the remote path handed to RETR.
fn parse_ftp_url(url: &str) -> Result<(String, String), FetchError> {
    let rest = url
        .strip_prefix("ftp://")
        .ok_or_else(|| FetchError::InvalidFtpUrl {
            url: url.to_string(),
        })?;
    let mut parts = rest.splitn(2, '/');
    let host = parts.next().unwrap_or_default();
    let remote_path = parts.next().unwrap_or_default();
    if host.is_empty() || remote_path.is_empty() {
        return Err(FetchError::InvalidFtpUrl {
            url: url.to_string(),
        });
    }
    let addr = if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:21", host)
    };
    Ok((addr, remote_path.to_string()))
}

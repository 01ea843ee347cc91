//! Submission of artifacts to the dynamic-analysis engine.

pub mod ack;

use std::path::Path;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};

use crate::config::EngineConfig;

pub use ack::Acknowledgment;

/// Path of the file-submission endpoint below the engine base URL.
const CREATE_FILE_PATH: &str = "tasks/create/file/";

/// Errors from a submission attempt. All of them are transient from the
/// pipeline's point of view.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("engine did not answer within the timeout")]
    Timeout,

    #[error("engine returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("engine rejected submission: {0}")]
    Rejected(String),

    #[error("cannot read artifact: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for SubmitError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SubmitError::Timeout
        } else {
            SubmitError::Transport(e.to_string())
        }
    }
}

/// Anything that can hand an artifact to an analysis engine.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, path: &Path, display_name: &str)
    -> Result<Acknowledgment, SubmitError>;
}

/// HTTP client for the engine's task-creation API.
pub struct AnalysisClient {
    http: reqwest::Client,
    endpoint: String,
    token: Option<SecretString>,
    fields: Vec<(&'static str, String)>,
}

impl AnalysisClient {
    pub fn new(config: &EngineConfig) -> Result<Self, SubmitError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        let fields = [
            ("tags", &config.tags),
            ("priority", &config.priority),
            ("machine", &config.machine),
            ("options", &config.options),
        ]
        .into_iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .map(|(k, v)| (k, v.trim().to_string()))
        .collect();

        Ok(Self {
            http,
            endpoint: endpoint(&config.url),
            token: config
                .api_token
                .as_ref()
                .map(|t| SecretString::from(t.expose_secret().to_string())),
            fields,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn form(&self, path: &Path, display_name: &str) -> Result<Form, SubmitError> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();

        let part = Part::stream_with_length(reqwest::Body::from(file), len)
            .file_name(display_name.to_string())
            .mime_str("application/octet-stream")?;

        let form = self
            .fields
            .iter()
            .fold(Form::new().part("file", part), |form, (k, v)| {
                form.text(*k, v.clone())
            });
        Ok(form)
    }
}

#[async_trait]
impl Submitter for AnalysisClient {
    async fn submit(
        &self,
        path: &Path,
        display_name: &str,
    ) -> Result<Acknowledgment, SubmitError> {
        let form = self.form(path, display_name).await?;

        let mut request = self.http.post(&self.endpoint).multipart(form);
        if let Some(token) = &self.token {
            request = request.header(
                reqwest::header::AUTHORIZATION,
                format!("Token {}", token.expose_secret()),
            );
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(SubmitError::Status {
                status: status.as_u16(),
                body,
            });
        }

        ack::parse(&body).map_err(|ack::Rejection(detail)| SubmitError::Rejected(detail))
    }
}

/// `{base}/tasks/create/file/`, tolerating a trailing slash on the base.
fn endpoint(base: &str) -> String {
    format!("{}/{CREATE_FILE_PATH}", base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keeps_trailing_slash() {
        assert_eq!(
            endpoint("http://cape:8000/apiv2"),
            "http://cape:8000/apiv2/tasks/create/file/"
        );
        assert_eq!(
            endpoint("http://cape:8000/apiv2/"),
            "http://cape:8000/apiv2/tasks/create/file/"
        );
    }

    #[test]
    fn empty_fields_are_dropped() {
        let config = EngineConfig {
            tags: "win10".into(),
            priority: "  ".into(),
            ..EngineConfig::default()
        };
        let client = AnalysisClient::new(&config).unwrap();
        assert_eq!(client.fields, vec![("tags", "win10".to_string())]);
    }
}

//! GitHub as the CI host: App authentication, workflow run details and job
//! logs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use autoheal_core::{create_http_client, RecordingLogger, ServiceType};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest_middleware::ClientWithMiddleware;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info};

const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("autoheal/", env!("CARGO_PKG_VERSION"));

/// Job logs are trimmed to their last this-many bytes; the failure is almost
/// always at the end.
pub const MAX_LOG_BYTES: usize = 20_000;

/// Installation tokens are refreshed when they have less than this left.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Conclusions that mark a job or step as failed.
const FAILED_CONCLUSIONS: &[&str] = &["failure", "timed_out"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StepInfo {
    pub name: String,
    pub conclusion: Option<String>,
    pub number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FailedJob {
    pub id: u64,
    pub name: String,
    pub conclusion: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepInfo>,
}

/// A workflow run reduced to what went wrong: only failed jobs, and within
/// them only failed steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunDetails {
    pub conclusion: Option<String>,
    pub failed_jobs: Vec<FailedJob>,
}

/// The CI host the orchestrator talks to.
#[async_trait]
pub trait CiHost: Send + Sync {
    async fn resolve_installation(&self, repo_owner: &str, repo_name: &str) -> Result<u64>;

    async fn get_failed_run_details(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        run_id: u64,
    ) -> Result<RunDetails>;

    /// Plain-text log of one job, trimmed to its tail.
    async fn download_job_logs(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        job_id: u64,
    ) -> Result<String>;
}

#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    app_id: u64,
    private_key: String,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct InstallationResponse {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunResponse {
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobsResponse {
    jobs: Vec<FailedJob>,
}

impl GitHubClient {
    pub fn new(
        app_id: u64,
        private_key: String,
        recording_logger: Option<RecordingLogger>,
    ) -> Result<Self> {
        let client = create_http_client(USER_AGENT, recording_logger, ServiceType::GitHub)
            .context("Failed to create GitHub HTTP client")?;

        Ok(Self {
            client,
            app_id,
            private_key,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = GitHubAppClaims {
            iss: self.app_id,
            iat: now - 60,  // Issued 60 seconds ago to account for clock skew
            exp: now + 600, // Expires in 10 minutes
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("Failed to parse private key")?;

        encode(&header, &claims, &encoding_key).context("Failed to encode JWT")
    }

    async fn get_installation_token(&self, installation_id: u64) -> Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                if token_still_valid(*expires_at, SystemTime::now()) {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            GITHUB_API_URL, installation_id
        );

        info!("Requesting new installation access token");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .context("Failed to send installation token request")?;

        let token_response: InstallationTokenResponse =
            read_json(response, "installation token").await?;

        let expires_at = chrono::DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse token expiration")?
            .with_timezone(&Utc);
        let expires_at_system =
            UNIX_EPOCH + Duration::from_secs(u64::try_from(expires_at.timestamp()).unwrap_or(0));

        {
            let mut cache = self.token_cache.write().await;
            cache.insert(
                installation_id,
                (token_response.token.clone(), expires_at_system),
            );
        }

        info!("Successfully obtained installation access token");
        Ok(token_response.token)
    }

    async fn get_json<T: DeserializeOwned>(&self, token: &str, url: &str, what: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;

        read_json(response, what).await
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T> {
    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .context("Failed to read error response body")?;
        error!("GitHub API error ({}): {} - {}", what, status, error_text);
        return Err(anyhow!("GitHub API error ({}): {} - {}", what, status, error_text));
    }

    response
        .json()
        .await
        .with_context(|| format!("Failed to parse {} response", what))
}

fn token_still_valid(expires_at: SystemTime, now: SystemTime) -> bool {
    expires_at
        .duration_since(now)
        .map(|remaining| remaining > TOKEN_REFRESH_MARGIN)
        .unwrap_or(false)
}

fn is_failed(conclusion: Option<&str>) -> bool {
    conclusion.is_some_and(|c| FAILED_CONCLUSIONS.contains(&c))
}

/// Keep failed jobs, and within each only its failed steps.
pub fn failed_jobs_only(jobs: Vec<FailedJob>) -> Vec<FailedJob> {
    jobs.into_iter()
        .filter(|job| is_failed(job.conclusion.as_deref()))
        .map(|mut job| {
            job.steps
                .retain(|step| is_failed(step.conclusion.as_deref()));
            job
        })
        .collect()
}

/// The last `max_bytes` of `log`, cut on a character boundary.
pub fn tail_trim(log: &str, max_bytes: usize) -> &str {
    if log.len() <= max_bytes {
        return log;
    }
    let mut start = log.len() - max_bytes;
    while !log.is_char_boundary(start) {
        start += 1;
    }
    &log[start..]
}

#[async_trait]
impl CiHost for GitHubClient {
    async fn resolve_installation(&self, repo_owner: &str, repo_name: &str) -> Result<u64> {
        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/repos/{}/{}/installation",
            GITHUB_API_URL, repo_owner, repo_name
        );
        let installation: InstallationResponse =
            self.get_json(&jwt, &url, "repository installation").await?;
        info!(
            "Resolved installation {} for {}/{}",
            installation.id, repo_owner, repo_name
        );
        Ok(installation.id)
    }

    async fn get_failed_run_details(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        run_id: u64,
    ) -> Result<RunDetails> {
        let token = self.get_installation_token(installation_id).await?;

        let run_url = format!(
            "{}/repos/{}/{}/actions/runs/{}",
            GITHUB_API_URL, repo_owner, repo_name, run_id
        );
        let run: WorkflowRunResponse = self.get_json(&token, &run_url, "workflow run").await?;

        let jobs_url = format!("{}/jobs?filter=latest&per_page=100", run_url);
        let jobs: JobsResponse = self.get_json(&token, &jobs_url, "workflow jobs").await?;

        let failed_jobs = failed_jobs_only(jobs.jobs);
        info!(
            "Run {} in {}/{} has {} failed job(s)",
            run_id,
            repo_owner,
            repo_name,
            failed_jobs.len()
        );

        Ok(RunDetails {
            conclusion: run.conclusion,
            failed_jobs,
        })
    }

    async fn download_job_logs(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        job_id: u64,
    ) -> Result<String> {
        let token = self.get_installation_token(installation_id).await?;
        let url = format!(
            "{}/repos/{}/{}/actions/jobs/{}/logs",
            GITHUB_API_URL, repo_owner, repo_name, job_id
        );

        // GitHub answers with a redirect to short-lived blob storage, which
        // reqwest follows without forwarding the Authorization header.
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .context("Failed to send job logs request")?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(anyhow!("Failed to download logs for job {}: {}", job_id, status));
        }

        let text = response
            .text()
            .await
            .context("Failed to read job logs")?;
        Ok(tail_trim(&text, MAX_LOG_BYTES).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOBS_FIXTURE: &str = r#"{
        "total_count": 3,
        "jobs": [
            {
                "id": 101,
                "name": "build",
                "status": "completed",
                "conclusion": "success",
                "steps": [{"name": "Checkout", "status": "completed", "conclusion": "success", "number": 1}]
            },
            {
                "id": 102,
                "name": "test",
                "status": "completed",
                "conclusion": "failure",
                "steps": [
                    {"name": "Checkout", "status": "completed", "conclusion": "success", "number": 1},
                    {"name": "cargo test", "status": "completed", "conclusion": "failure", "number": 2},
                    {"name": "Upload", "status": "completed", "conclusion": "skipped", "number": 3}
                ]
            },
            {
                "id": 103,
                "name": "lint",
                "status": "completed",
                "conclusion": "timed_out",
                "steps": []
            }
        ]
    }"#;

    #[test]
    fn test_failed_jobs_only_filters_jobs_and_steps() {
        let response: JobsResponse = serde_json::from_str(JOBS_FIXTURE).unwrap();
        let failed = failed_jobs_only(response.jobs);

        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].id, 102);
        assert_eq!(
            failed[0].steps,
            vec![StepInfo {
                name: "cargo test".to_string(),
                conclusion: Some("failure".to_string()),
                number: 2,
            }]
        );
        assert_eq!(failed[1].name, "lint");
        assert!(failed[1].steps.is_empty());
    }

    #[test]
    fn test_job_without_steps_field_parses() {
        let job: FailedJob =
            serde_json::from_str(r#"{"id": 1, "name": "queued", "conclusion": null}"#).unwrap();
        assert!(job.steps.is_empty());
        assert!(job.conclusion.is_none());
    }

    #[test]
    fn test_tail_trim_keeps_end() {
        assert_eq!(tail_trim("short", 10), "short");
        assert_eq!(tail_trim("0123456789", 4), "6789");
    }

    #[test]
    fn test_tail_trim_respects_char_boundaries() {
        // 'é' is two bytes; cutting inside it must move forward.
        let log = "aé bc";
        let trimmed = tail_trim(log, 4);
        assert_eq!(trimmed, " bc");
    }

    #[test]
    fn test_token_validity_margin() {
        let now = SystemTime::now();
        assert!(token_still_valid(now + Duration::from_secs(3600), now));
        assert!(!token_still_valid(now + Duration::from_secs(60), now));
        assert!(!token_still_valid(now - Duration::from_secs(1), now));
    }
}

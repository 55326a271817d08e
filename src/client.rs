//! HTTP client for a running bridge. The CLI's job commands go through it so
//! they see the server's job tracker instead of an empty one of their own.

use reqwest::StatusCode;

use crate::api::{ErrorResponse, JobResponse, StatusResponse, SubmitResponse};
use crate::error::{GridError, Result};
use crate::job::{FinishedRecord, JobHandle, LifecycleState};
use crate::submit::SubmitRequest;

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    /// `addr` is the server's base URL, e.g. `http://127.0.0.1:8080`.
    pub fn new(addr: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: addr.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base, path)
    }

    /// Submit a job. A rejected or failed submission comes back as the
    /// server's `ERROR:` string.
    pub async fn submit(&self, request: &SubmitRequest) -> Result<String> {
        let response: SubmitResponse = self
            .http
            .post(self.url("/jobs"))
            .json(request)
            .send()
            .await?
            .json()
            .await?;

        match (response.success, response.job_id) {
            (true, Some(job_id)) => Ok(job_id),
            _ => Err(GridError::Api(
                response
                    .error
                    .unwrap_or_else(|| "ERROR:submission failed".to_string()),
            )),
        }
    }

    pub async fn status(&self, handle: &JobHandle) -> Result<LifecycleState> {
        let response = self
            .http
            .get(self.url(&format!("/jobs/{}", handle)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let status: StatusResponse = response.json().await?;
        Ok(status.state)
    }

    /// `None` when the server has no finished record for the job.
    pub async fn finished(&self, handle: &JobHandle) -> Result<Option<FinishedRecord>> {
        let response = self
            .http
            .get(self.url(&format!("/jobs/{}/finished", handle)))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            _ => Err(api_error(response).await),
        }
    }

    pub async fn kill(&self, job_id: &str, user: Option<&str>, force: bool) -> Result<()> {
        let mut query = vec![("force", force.to_string())];
        if let Some(user) = user {
            query.push(("user", user.to_string()));
        }
        let response = self
            .http
            .delete(self.url(&format!("/jobs/{}", job_id)))
            .query(&query)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(())
    }

    /// Tracked jobs, filtered by `filter` or by the server's configured filter.
    pub async fn list(&self, filter: Option<&str>) -> Result<Vec<JobResponse>> {
        let mut request = self.http.get(self.url("/jobs"));
        if let Some(filter) = filter {
            request = request.query(&[("filter", filter)]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.json().await?)
    }
}

async fn api_error(response: reqwest::Response) -> GridError {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) => GridError::Api(body.error),
        Err(_) => GridError::Api(format!("server returned {}", status)),
    }
}

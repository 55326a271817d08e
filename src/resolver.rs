use crate::accounting::{ArcoBackend, FinishedStore};
use crate::config::{BridgeConfig, RetrievalMethod};
use crate::error::{GridError, Result};
use crate::job::{FinishedRecord, JobHandle};

/// Answers "when and how did this job finish?" from whichever source is
/// configured.
#[derive(Clone)]
pub struct FinishedJobResolver {
    method: RetrievalMethod,
    use_array_jobs: bool,
    local: FinishedStore,
    external: Option<ArcoBackend>,
}

impl FinishedJobResolver {
    pub fn new(local: FinishedStore, use_array_jobs: bool) -> Self {
        Self {
            method: RetrievalMethod::LocalLog,
            use_array_jobs,
            local,
            external: None,
        }
    }

    /// Build the resolver for a configuration, connecting to the external
    /// backend when it is selected.
    pub fn from_config(config: &BridgeConfig, local: FinishedStore) -> Result<Self> {
        let mut resolver = Self::new(local, config.use_array_jobs);
        if config.retrieval_method == RetrievalMethod::ExternalAccounting {
            resolver = resolver.with_external(ArcoBackend::open(
                &config.accounting,
                config.use_array_jobs,
            )?);
        }
        Ok(resolver)
    }

    pub fn with_external(mut self, backend: ArcoBackend) -> Self {
        self.method = RetrievalMethod::ExternalAccounting;
        self.external = Some(backend);
        self
    }

    pub fn method(&self) -> RetrievalMethod {
        self.method
    }

    /// Switch the retrieval method by name; unknown names are rejected and leave
    /// the current method in place.
    pub fn set_method(&mut self, method: &str) -> Result<()> {
        let method: RetrievalMethod = method.parse()?;
        if method == RetrievalMethod::ExternalAccounting && self.external.is_none() {
            return Err(GridError::InvalidArgument(
                "external accounting backend is not configured".to_string(),
            ));
        }
        self.method = method;
        Ok(())
    }

    pub async fn resolve(&self, handle: &JobHandle) -> Result<Option<FinishedRecord>> {
        match self.method {
            RetrievalMethod::LocalLog => self.resolve_local(handle).await,
            RetrievalMethod::ExternalAccounting => match &self.external {
                Some(backend) => backend.find(handle).await,
                None => Err(GridError::UnsupportedMethod("external".to_string())),
            },
        }
    }

    async fn resolve_local(&self, handle: &JobHandle) -> Result<Option<FinishedRecord>> {
        if let Some(record) = self.local.get(handle).await? {
            return Ok(Some(record));
        }

        // Without array-job semantics a task id is only an alias for its job.
        if !self.use_array_jobs && handle.task().is_some() {
            tracing::debug!(job_id = %handle, "Falling back to job-level accounting record");
            return self.local.get(&handle.job_only()).await;
        }

        Ok(None)
    }

    pub fn close(&self) {
        if let Some(backend) = &self.external {
            backend.close();
        }
    }
}

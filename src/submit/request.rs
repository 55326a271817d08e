use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::SubmitConfig;
use crate::error::{GridError, Result};

/// Output line prefixes announcing the assigned identifier.
pub const SINGLE_JOB_PREFIX: &str = "Your job ";
pub const ARRAY_JOB_PREFIX: &str = "Your job-array ";

/// Submission request as sent by the orchestrator. Every field is optional on
/// the wire; [`SubmitRequest::validate`] turns it into a [`Submission`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub executable: Option<String>,
    pub args: Option<Vec<Option<String>>>,
    pub user: Option<String>,
    #[serde(default)]
    pub escalate: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub name: Option<String>,
    /// Native resource specification, e.g. `-l h_vmem=4G -q all.q`.
    #[serde(default)]
    pub resources: String,
    /// Array specification (e.g. `-t 1-100`); its presence makes this an
    /// array submission.
    pub array: Option<String>,
    /// Orchestrator-side variables used by the job filter.
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionKind {
    Single,
    Array { spec: String },
}

/// A validated submission. Only this type can be executed.
#[derive(Debug, Clone)]
pub struct Submission {
    pub executable: String,
    pub args: Vec<String>,
    pub user: String,
    pub escalate: bool,
    pub env: BTreeMap<String, String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub name: Option<String>,
    pub resources: String,
    pub kind: SubmissionKind,
    pub variables: HashMap<String, String>,
}

impl SubmitRequest {
    pub fn validate(self) -> Result<Submission> {
        let user = required(self.user, "username")?;
        let executable = required(self.executable, "executable location")?;
        let args = match self.args {
            Some(args) if args.iter().all(Option::is_some) => args.into_iter().flatten().collect(),
            _ => {
                return Err(GridError::InvalidRequest(
                    "failed to get command line arguments".to_string(),
                ))
            }
        };

        let kind = match self.array.as_deref().map(str::trim) {
            Some(spec) if !spec.is_empty() => SubmissionKind::Array {
                spec: spec.to_string(),
            },
            _ => SubmissionKind::Single,
        };

        Ok(Submission {
            executable,
            args,
            user,
            escalate: self.escalate,
            env: self.env,
            stdout_path: self.stdout_path.filter(|p| !p.trim().is_empty()),
            stderr_path: self.stderr_path.filter(|p| !p.trim().is_empty()),
            name: self.name.filter(|n| !n.trim().is_empty()),
            resources: self.resources,
            kind,
            variables: self.variables,
        })
    }
}

fn required(value: Option<String>, what: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(GridError::InvalidRequest(format!("failed to get {}", what))),
    }
}

impl Submission {
    pub fn is_array(&self) -> bool {
        matches!(self.kind, SubmissionKind::Array { .. })
    }

    pub fn success_prefix(&self) -> &'static str {
        if self.is_array() {
            ARRAY_JOB_PREFIX
        } else {
            SINGLE_JOB_PREFIX
        }
    }

    /// Full argv of the submit command, program first.
    pub fn argv(&self, config: &SubmitConfig) -> Vec<String> {
        let mut argv = Vec::new();

        if self.escalate {
            argv.push(config.sudo_program.clone());
            argv.push("-E".to_string());
            argv.push("-u".to_string());
            argv.push(self.user.clone());
        }
        argv.push(config.qsub_program.clone());

        match &self.kind {
            SubmissionKind::Single => {
                argv.extend(self.resources.split_whitespace().map(String::from));
                if let Some(name) = &self.name {
                    argv.push("-N".to_string());
                    argv.push(name.clone());
                }
                if let Some(out) = &self.stdout_path {
                    argv.push("-o".to_string());
                    argv.push(out.clone());
                }
                if let Some(err) = &self.stderr_path {
                    argv.push("-e".to_string());
                    argv.push(err.clone());
                }
                if !self.env.is_empty() {
                    let vars: Vec<String> = self
                        .env
                        .iter()
                        .map(|(k, v)| format!("{}={}", k, v))
                        .collect();
                    argv.push("-v".to_string());
                    argv.push(vars.join(","));
                }
            }
            SubmissionKind::Array { spec } => {
                argv.extend(spec.split_whitespace().map(String::from));
            }
        }

        argv.push(self.executable.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

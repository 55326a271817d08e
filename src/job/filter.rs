use std::collections::HashMap;

/// Variable name that switches the filter to job-name prefix matching.
pub const NAME_PREFIX_KEY: &str = "GridJobNamePrefix";

/// Selects which cluster jobs belong to this orchestrator.
///
/// Parsed from a comma-separated list of `name[=value]` entries. When the list
/// contains `GridJobNamePrefix=<prefix>` only jobs whose name starts with the
/// prefix match; otherwise a job must carry every listed resource variable
/// with an equal value (case-insensitive, `true` when no value is given).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum JobFilter {
    #[default]
    All,
    NamePrefix(String),
    Resources(HashMap<String, String>),
}

impl JobFilter {
    pub fn parse(spec: &str) -> Self {
        let mut vars: HashMap<String, String> = HashMap::new();

        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = entry.split('=').map(str::trim).collect();
            match parts.as_slice() {
                [name] if !name.is_empty() => {
                    vars.insert(name.to_string(), "true".to_string());
                }
                [name, value] if !name.is_empty() => {
                    let value = if value.is_empty() { "true" } else { value };
                    vars.insert(name.to_string(), value.to_string());
                }
                _ => {
                    tracing::warn!(entry, "Ignoring malformed job filter entry");
                }
            }
        }

        if vars.is_empty() {
            return JobFilter::All;
        }

        match vars.remove(NAME_PREFIX_KEY) {
            Some(prefix) => JobFilter::NamePrefix(prefix),
            None => JobFilter::Resources(vars),
        }
    }

    pub fn matches(&self, name: Option<&str>, resources: &HashMap<String, String>) -> bool {
        match self {
            JobFilter::All => true,
            JobFilter::NamePrefix(prefix) => name.is_some_and(|n| n.starts_with(prefix.as_str())),
            JobFilter::Resources(required) => required.iter().all(|(key, expected)| {
                resources
                    .get(key)
                    .is_some_and(|actual| actual.eq_ignore_ascii_case(expected))
            }),
        }
    }
}

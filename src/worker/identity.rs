use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

const MAX_NAME_LEN: usize = 48;

/// Namespace for everything one worker run writes to storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunIdentity(String);

impl RunIdentity {
    /// Derives a fresh identity from a test name, e.g.
    /// `indexes_transfers_18Oct26T14h03m07s123456_0`.
    ///
    /// The sequence suffix keeps two identities distinct even when they are
    /// generated within the same clock tick.
    pub fn generate(test_name: &str) -> Self {
        let timestamp = Utc::now().format("%d%b%yT%Hh%Mm%Ss%6f");
        let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self(format!(
            "{}_{timestamp}_{sequence}",
            sanitize_name(test_name)
        ))
    }

    /// Wraps an existing identifier verbatim.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunIdentity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl AsRef<str> for RunIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Keeps identifiers safe for logs, process arguments and SQL values.
fn sanitize_name(name: &str) -> String {
    // `module::path::test_name` becomes `test_name`.
    let short = name.rsplit("::").next().unwrap_or(name);
    let mut sanitized: String = short
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .take(MAX_NAME_LEN)
        .collect();

    if sanitized.is_empty() {
        sanitized.push_str("run");
    }
    sanitized
}

//! Shared helpers for the flowsync workspace: the local step state cache, path handling, and
//! redaction of credentials before they reach logs.

use once_cell::sync::Lazy;
use regex::Regex;

pub mod path_processing;
pub mod step_state;

pub use path_processing::expand_tilde;
pub use step_state::{
    InMemoryStepStateStore, JsonStepStateStore, STEP_STATE_PATH_ENV, StepStateStore, StepStateStoreError, default_step_state_path,
};

static REDACT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(authorization:\s*bearer\s+)([\w\-\.=:/+]+)",
        r"(?i)(bearer\s+)([\w\-\.=:/+]+)",
        r"(?i)([A-Z0-9_]*?(?:KEY|TOKEN|SECRET|PASSWORD)=)([^\s&]+)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Redacts values that look like credentials in a string.
pub fn redact_sensitive(input: &str) -> String {
    let mut redacted = input.to_string();
    for pattern in REDACT_PATTERNS.iter() {
        redacted = pattern
            .replace_all(&redacted, |captures: &regex::Captures| {
                let prefix = captures.get(1).map(|m| m.as_str()).unwrap_or("");
                format!("{prefix}<redacted>")
            })
            .to_string();
    }
    redacted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_bearer_tokens_and_assignments() {
        assert_eq!(redact_sensitive("Authorization: Bearer abc.def"), "Authorization: Bearer <redacted>");
        assert_eq!(
            redact_sensitive("FLOWSYNC_API_TOKEN=s3cr3t other"),
            "FLOWSYNC_API_TOKEN=<redacted> other"
        );
        assert_eq!(redact_sensitive("plain message"), "plain message");
    }
}

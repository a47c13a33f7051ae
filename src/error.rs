//! Error types for attestation verification.

use thiserror::Error;

/// Errors produced while decoding a raw quote blob.
///
/// Decoding is all-or-nothing: none of these carry a partial quote.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A field slice would run past the end of the buffer.
    #[error("quote truncated: need {need} bytes at offset {offset}, buffer is {len}")]
    Truncated {
        offset: usize,
        need: usize,
        len: usize,
    },

    /// The header declares a quote format version this engine does not parse.
    #[error("unsupported quote version {0}")]
    UnsupportedVersion(u16),

    /// The header declares a non-TDX TEE type.
    #[error("unsupported TEE type {0:#x}")]
    UnsupportedTeeType(u32),

    /// The header declares an attestation key type other than ECDSA-P256.
    #[error("unsupported attestation key type {0}")]
    UnsupportedAttestationKey(u16),

    /// The buffer is longer than the declared total length.
    #[error("trailing data after quote: expected {expected} bytes, got {actual}")]
    TrailingData { expected: usize, actual: usize },
}

/// A single field-level discrepancy between an expected and an observed value.
///
/// Comparison never short-circuits; the verifier collects every mismatch so a
/// failed verdict names each field that disagreed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldMismatch {
    /// Name of the field that disagreed, e.g. `rtmr1` or `mrtd`.
    pub field: String,
    /// Expected value, hex-encoded for digests.
    pub expected: String,
    /// Observed value, hex-encoded for digests.
    pub actual: String,
}

impl FieldMismatch {
    pub fn new(
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

impl std::fmt::Display for FieldMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} mismatch: expected {}, got {}",
            self.field, self.expected, self.actual
        )
    }
}

/// Errors that can occur during verification.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// Quote decoding failed. Terminal.
    #[error("quote decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// Event log could not be parsed or replayed. Terminal.
    #[error("failed to parse event log: {0}")]
    EventLogParse(String),

    /// One or more measured fields disagreed with their expected values.
    /// Terminal; carries every field-level diff.
    #[error("measurement mismatch: {}", format_mismatches(.0))]
    MeasurementMismatch(Vec<FieldMismatch>),

    /// The registry contract explicitly reports the app as unregistered.
    /// Terminal, never retried.
    #[error("app {app_id} is not registered")]
    NotRegistered { app_id: String },

    /// An identity returned by the registry disagrees with what the quote or
    /// event log claims. Terminal; signals tampering or misconfiguration and
    /// is surfaced distinctly from transient failures.
    #[error("registry identity mismatch: {field} expected {expected}, got {actual}")]
    AddressMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    /// RPC or network failure talking to the registry. Transient, retryable.
    #[error("registry unreachable: {0}")]
    Unreachable(String),

    /// Reference image download or extraction failed. Transient, retryable.
    #[error("image fetch failed: {0}")]
    FetchFailed(String),

    /// The image folder name does not match any recognized shape.
    /// Terminal, caller error.
    #[error("malformed image name: {0}")]
    MalformedImageName(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Other errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_mismatches(mismatches: &[FieldMismatch]) -> String {
    mismatches
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl VerificationError {
    /// Whether the orchestrator's retry policy may re-attempt after this
    /// error. Everything else is terminal and reported immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VerificationError::Unreachable(_) | VerificationError::FetchFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_split() {
        assert!(VerificationError::Unreachable("rpc down".into()).is_transient());
        assert!(VerificationError::FetchFailed("404".into()).is_transient());
        assert!(!VerificationError::NotRegistered {
            app_id: "0xabc".into()
        }
        .is_transient());
        assert!(!VerificationError::Decode(DecodeError::UnsupportedVersion(5)).is_transient());
        assert!(!VerificationError::MalformedImageName("x".into()).is_transient());
    }

    #[test]
    fn test_measurement_mismatch_lists_every_field() {
        let err = VerificationError::MeasurementMismatch(vec![
            FieldMismatch::new("rtmr0", "aa", "bb"),
            FieldMismatch::new("mrtd", "cc", "dd"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("rtmr0"));
        assert!(msg.contains("mrtd"));
    }
}

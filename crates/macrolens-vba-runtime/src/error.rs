use thiserror::Error;

/// Errors surfaced by the public API.
///
/// Soft failures inside emulation (unresolved names, unknown members, bad
/// macro-level calls) never appear here; they degrade to the unresolved
/// sentinel value so a run always produces a partial result.
#[derive(Debug, Error)]
pub enum EmuError {
    #[error("VBA parse error: {0}")]
    Parse(String),
    #[error("VBA runtime error: {0}")]
    Runtime(String),
    #[error("VBA execution exceeded the statement limit")]
    StepLimit,
    #[error("VBA call depth exceeded the recursion limit")]
    RecursionLimit,
}

use thiserror::Error;

/// `ChronicleError` covers only the two failure kinds with a natural
/// `Result` shape. The other two kinds are deliberately not variants here:
/// a listener panic is never caught (it propagates to the mutator, matching
/// the contract that listener exceptions are the caller's to handle), and an
/// invariant violation during undo/redo (an unreachable parent, a record
/// whose container kind no longer matches) is logged via `tracing::warn!`
/// and treated as a no-op rather than surfaced as an `Err`.
///
/// Failures surfaced by the public facade. Most internal recovery (a missing
/// parent during undo, a stale proxy cache entry) never reaches here; see the
/// module docs for which operations can fail and why.
#[derive(Debug, Error)]
pub enum ChronicleError {
    /// A precondition the caller was responsible for wasn't met, e.g.
    /// `merge` on a root with no pristine snapshot.
    #[error("precondition failed: {0}")]
    PreconditionFailure(String),

    /// An action passed to `batch`/`transaction` returned an error; the
    /// enclosing frame has already been rolled back by the time this is
    /// returned.
    #[error("action failed, batch rolled back: {0}")]
    UserCallbackFailure(#[source] Box<dyn std::error::Error + Send + Sync>),
}

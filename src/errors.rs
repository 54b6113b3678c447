use failure::Fail;

pub type Result<T> = std::result::Result<T, failure::Error>;

/// Every failure class the node distinguishes. Validation variants carry the
/// violated invariant so a rejected block or transaction can be diagnosed
/// from the log line alone.
#[derive(Debug, Fail)]
pub enum NodeError {
    #[fail(display = "invalid block {}: {}", hash, reason)]
    InvalidBlock { hash: String, reason: String },

    #[fail(display = "invalid transaction {}: {}", id, reason)]
    InvalidTransaction { id: String, reason: String },

    #[fail(
        display = "insufficient funds: available {}, required {}",
        available, required
    )]
    InsufficientFunds { available: i32, required: i32 },

    #[fail(display = "storage failure: {}", _0)]
    StorageFailure(String),

    #[fail(display = "protocol error from peer {}: {}", peer, reason)]
    ProtocolError { peer: String, reason: String },

    #[fail(
        display = "fork conflict: block {} at height {} extends {} instead of the current tip",
        hash, height, parent
    )]
    ForkConflict {
        hash: String,
        height: i32,
        parent: String,
    },
}

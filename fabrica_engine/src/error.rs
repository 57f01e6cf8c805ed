// Error type for the fabrication engine.
//
// Fabrication distinguishes two kinds of failure:
// - Recoverable: a content gap or a locally invalid choice (no instrument
//   covers a voice's tracks, no audio matches a note, a bag with nothing in
//   it). Craft stages catch these, record a segment message, skip the
//   affected voice or pick, and carry on.
// - Fatal: a broken structural invariant (no chain, no segment, a Continue
//   segment whose predecessor has no main choice, an illegal state
//   transition). These abort fabrication of the whole chain; `ChainWork`
//   marks the segment and chain failed and hands the error to the caller.
//
// `FabricationError::is_fatal` is the single place that classification
// lives. Stage code propagates with `?` and lets the driver decide.

use crate::entities::SegmentState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FabricationError>;

#[derive(Error, Debug)]
pub enum FabricationError {
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("no chain found")]
    NoChain,

    #[error("segment {0} not found")]
    NoSegment(u32),

    #[error("transition to {to:?} not in allowed ({allowed})")]
    Transition { to: SegmentState, allowed: String },

    #[error("cannot modify chainId of a Segment")]
    ChainIdChange,

    #[error("content: {0}")]
    Content(String),

    #[error("cannot pick from an empty bag")]
    EmptyBag,

    #[error("invalid entity: {0}")]
    Validation(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl FabricationError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        FabricationError::Fatal(msg.into())
    }

    pub fn content(msg: impl Into<String>) -> Self {
        FabricationError::Content(msg.into())
    }

    /// Whether this error must abort the chain rather than one stage.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FabricationError::Fatal(_)
                | FabricationError::NoChain
                | FabricationError::NoSegment(_)
                | FabricationError::Transition { .. }
                | FabricationError::ChainIdChange
        )
    }
}

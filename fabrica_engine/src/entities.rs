// Segment-side records: what fabrication writes.
//
// A `Chain` is one fabrication run. Its `Segment`s are consecutive time
// slices, each owning the records that describe what plays in it:
// - `SegmentChoice`: a selected program and/or instrument (with the voice it
//   fills) plus the delta window in which it is audible.
// - `SegmentChoiceArrangement`: picks of one choice grouped per source pattern.
// - `SegmentChoiceArrangementPick`: one scheduled audio event. This is the
//   record a mixer consumes.
// - `SegmentChord` / `SegmentChordVoicing`: harmonic context by beat position.
// - `SegmentMeme`, `SegmentMessage`, `SegmentMeta`: tags, diagnostics and
//   persisted scratch values (sticky buns live in metas).
//
// Record ids other than `SegmentId` are allocated by the `SegmentStore`, so
// entities are built with a placeholder id and receive a real one on `put`.
//
// Timing fields are integer microseconds. Beat positions (`delta`, chord
// positions) stay in beats. `DELTA_UNLIMITED` marks an unbounded delta edge.

use crate::content::{InstrumentMode, InstrumentType, ProgramType};
use crate::error::{FabricationError, Result};
use crate::ids::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for an unbounded `delta_in`/`delta_out`.
pub const DELTA_UNLIMITED: i32 = -1;

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainState {
    Draft,
    Ready,
    Fabricate,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub id: ChainId,
    pub name: String,
    /// Template whose bindings mark content as directly bound.
    pub template_id: Option<TemplateId>,
    /// Template configuration JSON, snapshotted at chain creation.
    pub template_config: String,
    pub ship_key: String,
    pub state: ChainState,
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

/// Lineage of a segment relative to its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentType {
    /// Not yet classified.
    Pending,
    /// First segment of the chain.
    Initial,
    /// Same main program, next sequence binding.
    Continue,
    /// Same macro program, new main program.
    NextMain,
    /// New macro program.
    NextMacro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SegmentState {
    Planned,
    Crafting,
    Crafted,
    Failed,
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub chain_id: ChainId,
    pub segment_type: SegmentType,
    pub state: SegmentState,
    /// Position along the intensity arc, in beats.
    pub delta: i32,
    /// Length in beats.
    pub total: u32,
    /// Beats per minute.
    pub tempo: f64,
    pub key: String,
    pub intensity: f64,
    pub begin_at_chain_micros: i64,
    /// Absent until Macro/Main resolves the length.
    pub duration_micros: Option<i64>,
    pub storage_key: String,
    pub created_at_micros: u64,
    pub updated_at_micros: u64,
}

impl Segment {
    pub fn end_at_chain_micros(&self) -> Option<i64> {
        self.duration_micros.map(|d| self.begin_at_chain_micros + d)
    }

    /// Overlaps `[from, to)`. An unresolved duration is open-ended.
    pub fn is_spanning(&self, from_chain_micros: i64, to_chain_micros: i64) -> bool {
        self.begin_at_chain_micros < to_chain_micros
            && self
                .end_at_chain_micros()
                .is_none_or(|end| end > from_chain_micros)
    }

    /// `chain_micros` falls inside `[begin, end)`.
    pub fn contains_chain_micros(&self, chain_micros: i64) -> bool {
        self.begin_at_chain_micros <= chain_micros
            && self
                .end_at_chain_micros()
                .is_none_or(|end| chain_micros < end)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tempo.is_finite() || self.tempo < 0.0 {
            return Err(FabricationError::Validation(format!(
                "segment {} has tempo {}",
                self.id, self.tempo
            )));
        }
        if self.duration_micros.is_some_and(|d| d < 0) {
            return Err(FabricationError::Validation(format!(
                "segment {} has negative duration",
                self.id
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Choices, arrangements, picks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChoice {
    pub id: ChoiceId,
    pub segment_id: SegmentId,
    pub program_id: Option<ProgramId>,
    pub program_type: Option<ProgramType>,
    pub program_sequence_id: Option<ProgramSequenceId>,
    pub program_sequence_binding_id: Option<ProgramSequenceBindingId>,
    pub program_voice_id: Option<ProgramVoiceId>,
    pub instrument_id: Option<InstrumentId>,
    pub instrument_type: Option<InstrumentType>,
    pub instrument_mode: Option<InstrumentMode>,
    pub delta_in: i32,
    pub delta_out: i32,
    pub mute: bool,
}

impl SegmentChoice {
    /// A blank choice for `segment_id`, active for the whole segment.
    pub fn new(segment_id: SegmentId) -> Self {
        SegmentChoice {
            id: ChoiceId(0),
            segment_id,
            program_id: None,
            program_type: None,
            program_sequence_id: None,
            program_sequence_binding_id: None,
            program_voice_id: None,
            instrument_id: None,
            instrument_type: None,
            instrument_mode: None,
            delta_in: DELTA_UNLIMITED,
            delta_out: DELTA_UNLIMITED,
            mute: false,
        }
    }

    pub fn check_deltas(&self) -> Result<()> {
        if self.delta_in != DELTA_UNLIMITED
            && self.delta_out != DELTA_UNLIMITED
            && self.delta_in > self.delta_out
        {
            return Err(FabricationError::Validation(format!(
                "choice delta in {} is after delta out {}",
                self.delta_in, self.delta_out
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChoiceArrangement {
    pub id: ArrangementId,
    pub segment_id: SegmentId,
    pub segment_choice_id: ChoiceId,
    pub program_sequence_pattern_id: Option<ProgramSequencePatternId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChoiceArrangementPick {
    pub id: PickId,
    pub segment_id: SegmentId,
    pub segment_choice_arrangement_id: ArrangementId,
    pub program_sequence_pattern_event_id: Option<ProgramSequencePatternEventId>,
    pub instrument_audio_id: InstrumentAudioId,
    pub segment_chord_voicing_id: Option<VoicingId>,
    pub start_at_segment_micros: i64,
    /// Absent until the one-shot cutoff pass resolves it.
    pub length_micros: Option<i64>,
    pub amplitude: f64,
    /// Note (or chord, for chord parts) of a tonal pick, otherwise "X".
    pub tones: String,
    pub event: String,
}

// ---------------------------------------------------------------------------
// Harmony
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChord {
    pub id: SegmentChordId,
    pub segment_id: SegmentId,
    pub name: String,
    /// Beats from the start of the segment.
    pub position: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChordVoicing {
    pub id: VoicingId,
    pub segment_id: SegmentId,
    pub segment_chord_id: SegmentChordId,
    pub instrument_type: InstrumentType,
    /// Comma-separated note names.
    pub notes: String,
}

// ---------------------------------------------------------------------------
// Memes, messages, metas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeme {
    pub id: MemeId,
    pub segment_id: SegmentId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentMessageType {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMessage {
    pub id: MessageId,
    pub segment_id: SegmentId,
    pub message_type: SegmentMessageType,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub id: MetaId,
    pub segment_id: SegmentId,
    pub key: String,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(begin: i64, duration: Option<i64>) -> Segment {
        Segment {
            id: SegmentId(0),
            chain_id: ChainId(1),
            segment_type: SegmentType::Pending,
            state: SegmentState::Planned,
            delta: 0,
            total: 0,
            tempo: 120.0,
            key: String::new(),
            intensity: 0.5,
            begin_at_chain_micros: begin,
            duration_micros: duration,
            storage_key: String::new(),
            created_at_micros: 0,
            updated_at_micros: 0,
        }
    }

    #[test]
    fn spanning_is_half_open() {
        let s = segment(1_000, Some(1_000));
        assert!(s.is_spanning(0, 1_001));
        assert!(!s.is_spanning(0, 1_000));
        assert!(s.is_spanning(1_999, 5_000));
        assert!(!s.is_spanning(2_000, 5_000));
        assert!(s.contains_chain_micros(1_000));
        assert!(!s.contains_chain_micros(2_000));
    }

    #[test]
    fn unresolved_duration_is_open_ended() {
        let s = segment(1_000, None);
        assert!(s.is_spanning(50_000, 60_000));
        assert!(s.contains_chain_micros(1_000_000));
        assert_eq!(s.end_at_chain_micros(), None);
    }

    #[test]
    fn choice_delta_window_validation() {
        let mut c = SegmentChoice::new(SegmentId(0));
        assert!(c.check_deltas().is_ok());
        c.delta_in = 64;
        assert!(c.check_deltas().is_ok());
        c.delta_out = 32;
        assert!(c.check_deltas().is_err());
        c.delta_in = DELTA_UNLIMITED;
        assert!(c.check_deltas().is_ok());
    }

    #[test]
    fn negative_duration_is_invalid() {
        assert!(segment(0, Some(-1)).validate().is_err());
        assert!(segment(0, Some(0)).validate().is_ok());
    }
}

// Source-content entity definitions.
//
// Programs are authored compositions: a program owns sequences (each with a
// length in beats, a key and an intensity), sequence bindings that order
// those sequences by offset, chords with per-instrument-type voicings, voices
// with tracks, and patterns of events per (sequence, voice). Instruments own
// audios (samples) tagged with an event name, tones and intensity. Templates
// bind libraries, programs or instruments to a chain.
//
// These records are read-only during fabrication. Cross references are plain
// ids resolved through `ContentStore`.

use crate::config::{InstrumentConfig, ProgramConfig};
use crate::ids::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether content is released for automatic selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum ContentState {
    Draft,
    #[default]
    Published,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProgramType {
    Macro,
    Main,
    Beat,
    Detail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstrumentType {
    Background,
    Bass,
    Drum,
    Hook,
    Pad,
    Percussion,
    Stab,
    Sticky,
    Stripe,
    Transition,
}

impl InstrumentType {
    pub const ALL: [InstrumentType; 10] = [
        InstrumentType::Background,
        InstrumentType::Bass,
        InstrumentType::Drum,
        InstrumentType::Hook,
        InstrumentType::Pad,
        InstrumentType::Percussion,
        InstrumentType::Stab,
        InstrumentType::Sticky,
        InstrumentType::Stripe,
        InstrumentType::Transition,
    ];
}

impl fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstrumentMode {
    /// Audios are triggered per pattern event.
    Event,
    /// One audio per chord section.
    Chord,
    /// Audios are tiled at their loop length.
    Loop,
}

impl fmt::Display for InstrumentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TemplateBindingType {
    Library,
    Program,
    Instrument,
}

// ---------------------------------------------------------------------------
// Libraries and templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Library {
    pub id: LibraryId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    #[serde(default)]
    pub ship_key: String,
    /// Template configuration as JSON; empty means all defaults.
    #[serde(default)]
    pub config: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateBinding {
    pub id: TemplateBindingId,
    pub template_id: TemplateId,
    pub content_type: TemplateBindingType,
    pub target_id: ContentUuid,
}

// ---------------------------------------------------------------------------
// Programs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub id: ProgramId,
    pub library_id: LibraryId,
    pub name: String,
    pub program_type: ProgramType,
    #[serde(default)]
    pub state: ContentState,
    #[serde(default)]
    pub key: String,
    /// Beats per minute.
    pub tempo: f64,
    #[serde(default)]
    pub config: ProgramConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramMeme {
    pub id: ProgramMemeId,
    pub program_id: ProgramId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSequence {
    pub id: ProgramSequenceId,
    pub program_id: ProgramId,
    pub name: String,
    #[serde(default)]
    pub key: String,
    /// Length in beats.
    pub total: u32,
    #[serde(default)]
    pub intensity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSequenceBinding {
    pub id: ProgramSequenceBindingId,
    pub program_id: ProgramId,
    pub program_sequence_id: ProgramSequenceId,
    pub offset: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSequenceBindingMeme {
    pub id: ProgramSequenceBindingMemeId,
    pub program_id: ProgramId,
    pub program_sequence_binding_id: ProgramSequenceBindingId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSequenceChord {
    pub id: ProgramSequenceChordId,
    pub program_id: ProgramId,
    pub program_sequence_id: ProgramSequenceId,
    pub name: String,
    /// Beats from the start of the sequence.
    pub position: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSequenceChordVoicing {
    pub id: ProgramSequenceChordVoicingId,
    pub program_id: ProgramId,
    pub program_sequence_chord_id: ProgramSequenceChordId,
    pub instrument_type: InstrumentType,
    /// Comma-separated note names.
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramVoice {
    pub id: ProgramVoiceId,
    pub program_id: ProgramId,
    pub instrument_type: InstrumentType,
    pub name: String,
    #[serde(default)]
    pub order: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramVoiceTrack {
    pub id: ProgramVoiceTrackId,
    pub program_id: ProgramId,
    pub program_voice_id: ProgramVoiceId,
    pub name: String,
    #[serde(default)]
    pub order: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSequencePattern {
    pub id: ProgramSequencePatternId,
    pub program_id: ProgramId,
    pub program_sequence_id: ProgramSequenceId,
    pub program_voice_id: ProgramVoiceId,
    pub name: String,
    /// Length in beats.
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSequencePatternEvent {
    pub id: ProgramSequencePatternEventId,
    pub program_id: ProgramId,
    pub program_sequence_pattern_id: ProgramSequencePatternId,
    pub program_voice_track_id: ProgramVoiceTrackId,
    /// Beats from the start of the pattern.
    pub position: f64,
    /// Beats.
    pub duration: f64,
    /// 0..1
    pub velocity: f64,
    /// Comma-separated note names; "X" for atonal.
    pub tones: String,
}

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub library_id: LibraryId,
    pub name: String,
    pub instrument_type: InstrumentType,
    pub mode: InstrumentMode,
    #[serde(default)]
    pub state: ContentState,
    #[serde(default = "unit_volume")]
    pub volume: f64,
    #[serde(default)]
    pub config: InstrumentConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentMeme {
    pub id: InstrumentMemeId,
    pub instrument_id: InstrumentId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentAudio {
    pub id: InstrumentAudioId,
    pub instrument_id: InstrumentId,
    pub name: String,
    /// Event (track) name this sample answers to, e.g. "KICK".
    #[serde(default)]
    pub event: String,
    /// Note or chord name, empty for unpitched samples.
    #[serde(default)]
    pub tones: String,
    #[serde(default = "half")]
    pub intensity: f64,
    #[serde(default)]
    pub length_seconds: f64,
    /// Loop length in beats for Loop-mode instruments.
    #[serde(default)]
    pub loop_beats: f64,
    #[serde(default = "unit_volume")]
    pub volume: f64,
}

impl InstrumentAudio {
    pub fn length_micros(&self) -> i64 {
        (self.length_seconds * 1_000_000.0) as i64
    }
}

fn unit_volume() -> f64 {
    1.0
}

fn half() -> f64 {
    0.5
}

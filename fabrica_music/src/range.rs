// Note ranges and octave fitting.
//
// A `NoteRange` is the span between the lowest and highest pitched note seen
// so far; atonal notes never widen it. Ranges drive two decisions in the
// engine: how far to transpose a program's written notes so they sit inside
// the segment's voicings (octave fitting), and which octave of a voicing
// note keeps a line moving as little as possible (voice leading, see
// `picker.rs`).

use crate::note::Note;
use crate::pitch::Accidental;
use serde::{Deserialize, Serialize};

/// Search window for octave fitting, in octaves either side of zero.
const OCTAVE_SEARCH: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NoteRange {
    pub low: Option<Note>,
    pub high: Option<Note>,
}

impl NoteRange {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of_notes<'a>(notes: impl IntoIterator<Item = &'a Note>) -> Self {
        let mut range = Self::empty();
        range.expand(notes);
        range
    }

    /// Range of every parseable note among `texts`; unparseable text is
    /// ignored.
    pub fn of_strings<S: AsRef<str>>(texts: impl IntoIterator<Item = S>) -> Self {
        let notes: Vec<Note> = texts
            .into_iter()
            .filter_map(|t| Note::parse(t.as_ref()))
            .collect();
        Self::of_notes(&notes)
    }

    pub fn is_empty(&self) -> bool {
        self.low.is_none() || self.high.is_none()
    }

    pub fn expand_note(&mut self, note: &Note) {
        if note.is_atonal() {
            return;
        }
        if self.low.is_none_or(|low| *note < low) {
            self.low = Some(*note);
        }
        if self.high.is_none_or(|high| *note > high) {
            self.high = Some(*note);
        }
    }

    pub fn expand<'a>(&mut self, notes: impl IntoIterator<Item = &'a Note>) {
        for note in notes {
            self.expand_note(note);
        }
    }

    pub fn expand_range(&mut self, other: &NoteRange) {
        if let Some(low) = other.low {
            self.expand_note(&low);
        }
        if let Some(high) = other.high {
            self.expand_note(&high);
        }
    }

    pub fn shifted(&self, semitones: i32) -> Self {
        NoteRange {
            low: self.low.map(|n| n.shift(semitones)),
            high: self.high.map(|n| n.shift(semitones)),
        }
    }

    pub fn contains(&self, note: &Note) -> bool {
        match (self.low, self.high) {
            (Some(low), Some(high)) => *note >= low && *note <= high && !note.is_atonal(),
            _ => false,
        }
    }

    /// Middle of the range, rounded down to a whole semitone.
    pub fn median(&self) -> Option<Note> {
        let (low, high) = (self.low?, self.high?);
        Some(low.shift(low.delta(&high) / 2))
    }

    /// Semitones that would move `target`'s median onto this range's median.
    /// Zero when either range is empty.
    pub fn delta_semitones(&self, target: &NoteRange) -> i32 {
        match (self.median(), target.median()) {
            (Some(own), Some(other)) => other.delta(&own),
            _ => 0,
        }
    }

    /// Octave shift for `source` whose median lands closest to `target`'s
    /// median. Zero when either range is empty.
    pub fn median_optimal_shift_octaves(source: &NoteRange, target: &NoteRange) -> i32 {
        let (Some(src), Some(tgt)) = (source.median(), target.median()) else {
            return 0;
        };
        let mut best = 0;
        let mut best_distance = i32::MAX;
        for octaves in -OCTAVE_SEARCH..=OCTAVE_SEARCH {
            let distance = tgt.delta(&src.shift_octave(octaves)).abs();
            if distance < best_distance {
                best_distance = distance;
                best = octaves;
            }
        }
        best
    }

    /// Smallest octave shift that places `source`'s low note at or above
    /// `target`'s low note. `None` when `target` has no low note; an empty
    /// `source` fits with no shift.
    pub fn lowest_optimal_shift_octaves(source: &NoteRange, target: &NoteRange) -> Option<i32> {
        let target_low = target.low?;
        let Some(source_low) = source.low else {
            return Some(0);
        };
        let mut best = 0;
        let mut best_distance = i32::MAX;
        for octaves in (-OCTAVE_SEARCH..=OCTAVE_SEARCH).rev() {
            let d = target_low.delta(&source_low.shift_octave(octaves));
            if d >= 0 && d < best_distance {
                best_distance = d;
                best = octaves;
            }
        }
        Some(best)
    }

    /// Compact text form such as `"C3-G4"`, used in memo keys.
    pub fn name(&self, accidental: Accidental) -> String {
        match (self.low, self.high) {
            (Some(low), Some(high)) => {
                format!("{}-{}", low.name(accidental), high.name(accidental))
            }
            _ => "empty".to_string(),
        }
    }
}

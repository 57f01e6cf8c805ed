// Notes: a pitch class at an octave, or the atonal X note.
//
// Pattern events and chord voicings store notes as text ("C4", "Bb2", "X").
// `Note::of` never fails; anything without a recognizable letter name parses
// as atonal, which downstream code treats as "pitch to be decided" (sticky
// buns, random voicing picks) or "pitch irrelevant" (drum hits).

use crate::pitch::{Accidental, PitchClass};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Octave assumed when a note name carries none.
pub const DEFAULT_OCTAVE: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Note {
    pub pitch_class: PitchClass,
    pub octave: i32,
}

impl Note {
    pub fn atonal() -> Self {
        Note {
            pitch_class: PitchClass::None,
            octave: 0,
        }
    }

    /// Parse `"C#4"`-style text. Returns `None` unless a pitch class is found.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (pitch_class, consumed) = PitchClass::parse_prefix(text);
        if pitch_class == PitchClass::None {
            return None;
        }
        let rest = text[consumed..].trim();
        let octave = if rest.is_empty() {
            DEFAULT_OCTAVE
        } else {
            rest.parse().ok()?
        };
        Some(Note {
            pitch_class,
            octave,
        })
    }

    /// Parse, falling back to the atonal note.
    pub fn of(text: &str) -> Self {
        Self::parse(text).unwrap_or_else(Self::atonal)
    }

    pub fn is_valid(text: &str) -> bool {
        Self::parse(text).is_some()
    }

    pub fn is_atonal(&self) -> bool {
        self.pitch_class == PitchClass::None
    }

    /// Absolute semitone number (C0 = 0); `None` for the atonal note.
    pub fn index(&self) -> Option<i32> {
        self.pitch_class.semitone().map(|pc| self.octave * 12 + pc)
    }

    fn from_index(index: i32) -> Self {
        Note {
            pitch_class: PitchClass::from_semitone(index),
            octave: index.div_euclid(12),
        }
    }

    /// Transpose by `semitones`. The atonal note is unchanged.
    pub fn shift(&self, semitones: i32) -> Self {
        match self.index() {
            Some(i) => Self::from_index(i + semitones),
            None => *self,
        }
    }

    pub fn shift_octave(&self, octaves: i32) -> Self {
        self.shift(octaves * 12)
    }

    /// Semitones from `self` to `target` (positive when `target` is higher).
    /// Zero when either note is atonal.
    pub fn delta(&self, target: &Note) -> i32 {
        match (self.index(), target.index()) {
            (Some(a), Some(b)) => b - a,
            _ => 0,
        }
    }

    /// Same pitch class and octave; two atonal notes are the same.
    pub fn same_as(&self, other: &Note) -> bool {
        self == other
    }

    pub fn name(&self, accidental: Accidental) -> String {
        if self.is_atonal() {
            return "X".to_string();
        }
        format!("{}{}", self.pitch_class.name(accidental), self.octave)
    }
}

impl PartialOrd for Note {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Atonal notes sort after every pitched note.
impl Ord for Note {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.index(), other.index()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

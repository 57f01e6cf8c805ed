// Pitch classes and accidental spelling.
//
// A pitch class is one of the twelve semitone positions within an octave, or
// `None` for "no pitch" (the atonal X note, a "no chord" symbol). Parsing
// accepts an upper-case letter followed by any run of sharps (`#`, `♯`) or
// flats (`b`, `♭`); the number of characters consumed is returned so callers
// can continue parsing an octave number or a chord description.

use serde::{Deserialize, Serialize};

/// Preferred spelling when rendering a pitch class back to text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Accidental {
    /// No preference; rendered with sharps.
    #[default]
    None,
    Sharp,
    Flat,
}

impl Accidental {
    /// The spelling preference implied by a note or chord name: whatever
    /// accidental directly follows the root letter.
    pub fn of(name: &str) -> Self {
        match name.trim().chars().nth(1) {
            Some('#') | Some('♯') => Accidental::Sharp,
            Some('b') | Some('♭') => Accidental::Flat,
            _ => Accidental::None,
        }
    }
}

/// One of the twelve pitch classes, or no pitch at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PitchClass {
    None,
    C,
    Cs,
    D,
    Ds,
    E,
    F,
    Fs,
    G,
    Gs,
    A,
    As,
    B,
}

const BY_SEMITONE: [PitchClass; 12] = [
    PitchClass::C,
    PitchClass::Cs,
    PitchClass::D,
    PitchClass::Ds,
    PitchClass::E,
    PitchClass::F,
    PitchClass::Fs,
    PitchClass::G,
    PitchClass::Gs,
    PitchClass::A,
    PitchClass::As,
    PitchClass::B,
];

impl PitchClass {
    /// Semitones above C, or `None` for the empty pitch class.
    pub fn semitone(self) -> Option<i32> {
        BY_SEMITONE.iter().position(|p| *p == self).map(|i| i as i32)
    }

    pub fn from_semitone(semitone: i32) -> Self {
        BY_SEMITONE[semitone.rem_euclid(12) as usize]
    }

    /// Parse a leading pitch class. Returns the pitch class and the number of
    /// bytes consumed; `(None, 0)` when the text does not start with a letter
    /// name.
    pub fn parse_prefix(text: &str) -> (Self, usize) {
        let mut chars = text.char_indices();
        let base = match chars.next() {
            Some((_, 'C')) => 0,
            Some((_, 'D')) => 2,
            Some((_, 'E')) => 4,
            Some((_, 'F')) => 5,
            Some((_, 'G')) => 7,
            Some((_, 'A')) => 9,
            Some((_, 'B')) => 11,
            _ => return (PitchClass::None, 0),
        };
        let mut shift = 0;
        let mut consumed = 1;
        for (i, c) in chars {
            match c {
                '#' | '♯' => shift += 1,
                'b' | '♭' => shift -= 1,
                _ => break,
            }
            consumed = i + c.len_utf8();
        }
        (Self::from_semitone(base + shift), consumed)
    }

    /// Shortest signed distance in semitones from `self` up (positive) or
    /// down (negative) to `target`, in `-5..=6`. Zero if either is `None`.
    pub fn delta(self, target: PitchClass) -> i32 {
        match (self.semitone(), target.semitone()) {
            (Some(a), Some(b)) => {
                let d = (b - a).rem_euclid(12);
                if d > 6 { d - 12 } else { d }
            }
            _ => 0,
        }
    }

    pub fn name(self, accidental: Accidental) -> &'static str {
        let flats = accidental == Accidental::Flat;
        match self {
            PitchClass::None => "X",
            PitchClass::C => "C",
            PitchClass::Cs if flats => "Db",
            PitchClass::Cs => "C#",
            PitchClass::D => "D",
            PitchClass::Ds if flats => "Eb",
            PitchClass::Ds => "D#",
            PitchClass::E => "E",
            PitchClass::F => "F",
            PitchClass::Fs if flats => "Gb",
            PitchClass::Fs => "F#",
            PitchClass::G => "G",
            PitchClass::Gs if flats => "Ab",
            PitchClass::Gs => "G#",
            PitchClass::A => "A",
            PitchClass::As if flats => "Bb",
            PitchClass::As => "A#",
            PitchClass::B => "B",
        }
    }
}

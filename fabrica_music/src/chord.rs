// Chord names.
//
// A chord name is a root pitch class, a free-form description ("m7", "sus4",
// "maj9") and an optional slash bass ("/G"). Names that do not begin with a
// letter ("NC", "", "N.C.") describe the absence of a chord.
//
// Chord-mode instruments carry audios tagged with chord names. Matching an
// audio to a segment chord first looks for the same chord, then for an
// "acceptable" one: same root and same basic quality (major, minor,
// diminished, augmented or suspended), ignoring extensions and slash bass.

use crate::pitch::{Accidental, PitchClass};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chord {
    pub name: String,
    pub root: PitchClass,
    /// Bass note; equals `root` when no slash is given.
    pub slash_root: PitchClass,
    pub description: String,
    pub accidental: Accidental,
}

/// Basic triad family used for "acceptable" matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quality {
    Major,
    Minor,
    Diminished,
    Augmented,
    Suspended,
}

impl Chord {
    pub fn of(name: &str) -> Self {
        let name = name.trim();
        let (root, consumed) = PitchClass::parse_prefix(name);
        if root == PitchClass::None {
            return Chord {
                name: name.to_string(),
                root,
                slash_root: root,
                description: String::new(),
                accidental: Accidental::None,
            };
        }
        let rest = &name[consumed..];
        let (description, slash_root) = match rest.rsplit_once('/') {
            Some((desc, bass)) => {
                let (bass_pc, _) = PitchClass::parse_prefix(bass.trim());
                if bass_pc == PitchClass::None {
                    (rest, root)
                } else {
                    (desc, bass_pc)
                }
            }
            None => (rest, root),
        };
        Chord {
            name: name.to_string(),
            root,
            slash_root,
            description: description.trim().to_string(),
            accidental: Accidental::of(name),
        }
    }

    /// False for "no chord".
    pub fn is_present(&self) -> bool {
        self.root != PitchClass::None
    }

    pub fn is_same(&self, other: &Chord) -> bool {
        self.root == other.root
            && self.slash_root == other.slash_root
            && self.description == other.description
    }

    pub fn is_acceptable(&self, other: &Chord) -> bool {
        self.is_present() && self.root == other.root && self.quality() == other.quality()
    }

    fn quality(&self) -> Quality {
        let raw = self.description.as_str();
        let d = raw.to_lowercase();
        if d.starts_with("dim") || d.starts_with('°') || d.starts_with('o') {
            Quality::Diminished
        } else if d.starts_with("aug") || d.starts_with('+') {
            Quality::Augmented
        } else if d.starts_with("sus") {
            Quality::Suspended
        } else if d.starts_with("maj") || raw.starts_with('M') {
            Quality::Major
        } else if raw.starts_with('m') || d.starts_with('-') {
            Quality::Minor
        } else {
            Quality::Major
        }
    }
}

impl fmt::Display for Chord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

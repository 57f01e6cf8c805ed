// Voicing-constrained note picking.
//
// A program event says "play E4"; the segment's chord voicing offers a set of
// concrete notes. The picker chooses the voicing note closest to what the
// event asked for. With inversion seeking enabled it also considers each
// voicing note an octave up or down, as long as that stays within the
// optimal range accumulated so far, which keeps pads and stabs from leaping
// between chords.
//
// Atonal requests are resolved to a random voicing note; the caller is
// expected to go through a sticky bun first when reproducibility matters.

use crate::note::Note;
use crate::range::NoteRange;
use fabrica_prng::FabRng;

pub struct NotePicker {
    range: NoteRange,
    voicing: Vec<Note>,
    seek_inversions: bool,
}

impl NotePicker {
    pub fn new(range: NoteRange, voicing: Vec<Note>, seek_inversions: bool) -> Self {
        let mut voicing: Vec<Note> = voicing.into_iter().filter(|n| !n.is_atonal()).collect();
        voicing.sort();
        NotePicker {
            range,
            voicing,
            seek_inversions,
        }
    }

    fn candidates(&self) -> Vec<Note> {
        if !self.seek_inversions || self.range.is_empty() {
            return self.voicing.clone();
        }
        let mut out = self.voicing.clone();
        for note in &self.voicing {
            for octaves in [-1, 1] {
                let inverted = note.shift_octave(octaves);
                if self.range.contains(&inverted) {
                    out.push(inverted);
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Pick a concrete note for `target`. Returns the atonal note when the
    /// voicing is empty.
    pub fn pick(&mut self, target: &Note, rng: &mut FabRng) -> Note {
        if target.is_atonal() {
            return rng.choose(&self.voicing).copied().unwrap_or_else(Note::atonal);
        }
        let picked = self
            .candidates()
            .into_iter()
            .min_by_key(|candidate| target.delta(candidate).abs())
            .unwrap_or_else(Note::atonal);
        self.range.expand_note(&picked);
        picked
    }

    pub fn range(&self) -> &NoteRange {
        &self.range
    }
}

// Sticky buns: reproducible choices for atonal events.
//
// An event written as "X" (or several X's) means "some note from the current
// voicing". Rolling a fresh random note every segment makes a riff wander, so
// the first time an event is seen we roll one value per tone and persist the
// bun in segment meta. Later segments load the same bun and map the same
// values onto whatever voicing is current, so the relative position of each
// note within the voicing is preserved across chord changes.

use crate::note::Note;
use fabrica_prng::FabRng;
use serde::{Deserialize, Serialize};

const META_KEY_PREFIX: &str = "StickyBun";

/// Values are drawn from `0..VALUE_SPAN` and scaled onto the voicing length.
const VALUE_SPAN: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickyBun {
    pub event_key: String,
    pub values: Vec<u32>,
}

impl StickyBun {
    /// Roll a bun with `size` values (at least one) for the event identified
    /// by `event_key`.
    pub fn new(event_key: impl Into<String>, size: usize, rng: &mut FabRng) -> Self {
        let values = (0..size.max(1))
            .map(|_| rng.range_u64(0, VALUE_SPAN as u64) as u32)
            .collect();
        StickyBun {
            event_key: event_key.into(),
            values,
        }
    }

    pub fn meta_key_for(event_key: &str) -> String {
        format!("{META_KEY_PREFIX}_{event_key}")
    }

    pub fn meta_key(&self) -> String {
        Self::meta_key_for(&self.event_key)
    }

    /// The note for tone `index` of the event, drawn from `voicing`. Indices
    /// past the rolled values reuse the first value. Atonal when the voicing
    /// has no pitched notes.
    pub fn compute(&self, voicing: &[Note], index: usize) -> Note {
        let mut pitched: Vec<Note> = voicing.iter().filter(|n| !n.is_atonal()).copied().collect();
        if pitched.is_empty() {
            return Note::atonal();
        }
        pitched.sort();
        let value = self
            .values
            .get(index)
            .or_else(|| self.values.first())
            .copied()
            .unwrap_or(0);
        let slot = (value as usize * pitched.len() / VALUE_SPAN as usize).min(pitched.len() - 1);
        pitched[slot]
    }
}

// Data-driven fabrication configuration.
//
// Three layers of tunables, all serde structs whose every field has a
// default so a partial (or empty) JSON document is valid:
// - `TemplateConfig`: per chain. Snapshotted into `Chain::template_config`
//   when the chain is created and parsed once per `Fabricator`. Controls
//   delta arcs, intensity layering, muting, one-shot cutoff finalization,
//   inversion seeking, sticky buns, the meme taxonomy and the crescendo.
// - `ProgramConfig`: per program (bar length, whether patterns restart on
//   every chord change).
// - `InstrumentConfig`: per instrument (one-shot behavior, audio selection
//   persistence, multiphonic/tonal sampling).
//
// JSON keys are camelCase to match the option names content authors use.
//
// See also: `meme.rs` for `MemeTaxonomy`, `fabricator.rs` which owns the
// parsed `TemplateConfig` for one segment.

use crate::content::InstrumentType;
use crate::error::Result;
use crate::meme::MemeTaxonomy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// TemplateConfig
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TemplateConfig {
    /// Chance that a freshly chosen (not continued) choice is muted.
    pub choice_mute_probability: BTreeMap<InstrumentType, f64>,
    /// Beat layers that should already be audible when a main program starts.
    pub delta_arc_beat_layers_incoming: u32,
    /// Substrings (case-insensitive) of beat voice names that enter first.
    pub delta_arc_beat_layers_to_prioritize: Vec<String>,
    pub delta_arc_detail_layers_incoming: u32,
    /// When false every layer is active for the whole segment.
    pub delta_arc_enabled: bool,
    /// Order in which detail instrument types are crafted.
    pub detail_layer_order: Vec<InstrumentType>,
    pub event_names_large: Vec<String>,
    pub event_names_medium: Vec<String>,
    pub event_names_small: Vec<String>,
    /// Types whose one-shot picks get their lengths resolved at the end.
    pub instrument_types_for_audio_length_finalization: Vec<InstrumentType>,
    /// Types whose note picker may use chord inversions.
    pub instrument_types_for_inversion_seeking: Vec<InstrumentType>,
    pub intensity_auto_crescendo_enabled: bool,
    pub intensity_auto_crescendo_maximum: f64,
    pub intensity_auto_crescendo_minimum: f64,
    /// How many intensity-sorted audios to layer per instrument type.
    pub intensity_layers: BTreeMap<InstrumentType, usize>,
    pub intensity_threshold: BTreeMap<InstrumentType, f64>,
    /// Crescendo window in beats; also caps how long a main program continues.
    pub main_program_length_max_delta: i32,
    pub meme_taxonomy: MemeTaxonomy,
    pub sticky_bun_enabled: bool,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        use InstrumentType::*;
        let per_type = |value: f64| InstrumentType::ALL.iter().map(|t| (*t, value)).collect();
        let names = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        TemplateConfig {
            choice_mute_probability: per_type(0.0),
            delta_arc_beat_layers_incoming: 1,
            delta_arc_beat_layers_to_prioritize: names(&["kick"]),
            delta_arc_detail_layers_incoming: 1,
            delta_arc_enabled: false,
            detail_layer_order: vec![Bass, Pad, Stab, Sticky, Stripe],
            event_names_large: names(&["BIG", "HIGH", "LARGE", "PRIMARY"]),
            event_names_medium: names(&["MEDIUM", "MIDDLE", "REGULAR", "SECONDARY"]),
            event_names_small: names(&["LITTLE", "LOW", "SMALL"]),
            instrument_types_for_audio_length_finalization: vec![Bass, Pad, Stab, Sticky, Stripe],
            instrument_types_for_inversion_seeking: vec![Pad, Stab, Sticky, Stripe],
            intensity_auto_crescendo_enabled: true,
            intensity_auto_crescendo_maximum: 0.8,
            intensity_auto_crescendo_minimum: 0.2,
            intensity_layers: [
                (Background, 3),
                (Bass, 1),
                (Drum, 1),
                (Hook, 3),
                (Pad, 3),
                (Percussion, 3),
                (Stab, 2),
                (Sticky, 2),
                (Stripe, 2),
                (Transition, 3),
            ]
            .into_iter()
            .collect(),
            intensity_threshold: per_type(0.5),
            main_program_length_max_delta: 280,
            meme_taxonomy: MemeTaxonomy::default(),
            sticky_bun_enabled: true,
        }
    }
}

impl TemplateConfig {
    /// Parse a template configuration; blank input yields the defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn mute_probability(&self, instrument_type: InstrumentType) -> f64 {
        self.choice_mute_probability
            .get(&instrument_type)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn intensity_layers_for(&self, instrument_type: InstrumentType) -> usize {
        self.intensity_layers.get(&instrument_type).copied().unwrap_or(1)
    }

    pub fn finalizes_audio_lengths(&self, instrument_type: InstrumentType) -> bool {
        self.instrument_types_for_audio_length_finalization
            .contains(&instrument_type)
    }

    pub fn seeks_inversions(&self, instrument_type: InstrumentType) -> bool {
        self.instrument_types_for_inversion_seeking
            .contains(&instrument_type)
    }
}

// ---------------------------------------------------------------------------
// Program and instrument configuration
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgramConfig {
    pub bar_beats: u32,
    /// Restart pattern selection at every chord change.
    pub do_pattern_restart_on_chord: bool,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        ProgramConfig {
            bar_beats: 4,
            do_pattern_restart_on_chord: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstrumentConfig {
    /// Reuse the same audio for the same track/note in later segments.
    pub is_audio_selection_persistent: bool,
    /// Choose audios per note rather than per event.
    pub is_multiphonic: bool,
    /// Audios play to their natural end instead of the event duration.
    pub is_one_shot: bool,
    /// One-shot audios are cut off by the next pick of the same choice.
    pub is_one_shot_cutoff_enabled: bool,
    /// Picks carry the note name rather than the event name.
    pub is_tonal: bool,
    /// Track names that keep the event duration even on a one-shot instrument.
    pub one_shot_observe_length_of_events: Vec<String>,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        InstrumentConfig {
            is_audio_selection_persistent: true,
            is_multiphonic: false,
            is_one_shot: false,
            is_one_shot_cutoff_enabled: true,
            is_tonal: false,
            one_shot_observe_length_of_events: Vec::new(),
        }
    }
}

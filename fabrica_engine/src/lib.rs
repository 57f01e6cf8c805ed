// fabrica_engine: segment-by-segment procedural music fabrication.
//
// A chain is an endless production line of segments. Each segment is
// fabricated by choosing programs (macro form, main harmony, beats, detail
// parts) and instruments from a read-only content library, arranging their
// pattern events against the segment's chords, and emitting picks: concrete
// audio samples with start times, lengths and amplitudes that a downstream
// mixer can render without any music theory of its own.
//
// Module overview:
// - `ids.rs`:           Content uuids and segment record ids.
// - `content/`:         ContentStore, the indexed read-only content library.
// - `config.rs`:        TemplateConfig / ProgramConfig / InstrumentConfig.
// - `entities.rs`:      Chain, Segment and the per-segment records.
// - `store.rs`:         SegmentStore, partitioned by segment, with the
//                       segment state transition table.
// - `meme.rs`:          Meme taxonomy, stack and isometry (compatibility tags).
// - `bag.rs`:           SelectionBag, the phased weighted chooser.
// - `retrospective.rs`: Read-only history of a segment's main-program lineage.
// - `delta_arc.rs`:     Staggered layer entrances across a main program.
// - `fabricator.rs`:    Per-segment context every craft stage works through.
// - `craft/`:           The stage pipeline: Macro/Main, Beat, Detail,
//                       Background, Transition.
// - `work.rs`:          ChainWork, the driver that plans and crafts segments.
//
// Music theory (notes, chords, ranges, note picking, sticky buns) lives in
// `fabrica_music`; the random generator in `fabrica_prng`.
//
// **Critical constraint:** randomness is explicit. Every draw comes from a
// `FabRng` owned by the caller and threaded through the Fabricator; nothing
// here touches a global generator or the clock.

pub mod bag;
pub mod config;
pub mod content;
pub mod craft;
pub mod delta_arc;
pub mod entities;
pub mod error;
pub mod fabricator;
pub mod ids;
pub mod meme;
pub mod retrospective;
pub mod store;
pub mod work;

#[cfg(test)]
mod test_fixtures;

pub use error::{FabricationError, Result};
pub use fabricator::{Fabricator, FabricatorOverrides};
pub use work::ChainWork;

// Music-theory primitives for segment fabrication.
//
// The engine never does string surgery on note or chord names itself; it goes
// through the small contract in this crate:
// - `pitch`: pitch classes and accidental spelling preference
// - `note`: a pitch class plus octave, or the atonal "X" note
// - `chord`: chord names split into root, description and slash root, with
//   exact and "acceptable" matching used by chord-mode audio selection
// - `range`: note ranges, transposition and octave fitting
// - `picker`: choosing concrete notes from a chord voicing
// - `sticky_bun`: persisted random values that make atonal note choices
//   repeat identically from segment to segment
// - `bar`: bar-subdivision arithmetic used to snap delta arcs and
//   transition hits to musically sensible boundaries
//
// Everything here is pure and allocation-light; randomness comes in through
// an explicit `FabRng` argument.

pub mod bar;
pub mod chord;
pub mod note;
pub mod picker;
pub mod pitch;
pub mod range;
pub mod sticky_bun;

pub use bar::Bar;
pub use chord::Chord;
pub use note::Note;
pub use picker::NotePicker;
pub use pitch::{Accidental, PitchClass};
pub use range::NoteRange;
pub use sticky_bun::StickyBun;

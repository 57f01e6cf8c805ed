// Craft pipeline: the fixed sequence of stages that fills one segment.
//
// Stages run in `CraftStage::PIPELINE` order. Macro/Main resolves tempo, key,
// duration and chords, and every later stage reads those, so the order is not
// negotiable. Each stage is a plain function over `&mut Fabricator`; the
// closed `CraftStage` enum dispatches to them.
//
// This module also holds the machinery shared by several stages:
// - fresh program / instrument selection through a phased `SelectionBag`
//   (directly bound content first, then published content, both filtered by
//   meme compatibility and weighted by meme overlap);
// - intensity-layered audio selection for Background, Transition and Loop
//   instruments;
// - the event arrangement algorithm: per chord section, repeatedly lay a
//   random pattern of the choice's sequence and voice, turn each event into
//   notes (chord voicing, transposition, octave fitting, sticky buns for
//   atonal tones) and each note into a pick with a concrete audio;
// - chord-part arrangement for Chord-mode instruments;
// - the one-shot cutoff pass that resolves pick lengths.
//
// Recoverable content gaps (no instrument for a voice, no audio for a note)
// become segment messages and skip only the affected voice or pick. Fatal
// errors bubble up to `ChainWork`, which fails the segment.
//
// See also: `fabricator.rs` for every lookup used here, `delta_arc.rs` for
// the delta windows consumed by `volume_ratio`.

pub mod background;
pub mod beat;
pub mod detail;
pub mod macro_main;
pub mod transition;

use crate::bag::SelectionBag;
use crate::content::*;
use crate::delta_arc::DeltaArcs;
use crate::entities::*;
use crate::error::Result;
use crate::fabricator::{Fabricator, segment_micros_at_position, voicing_notes};
use crate::ids::*;
use crate::meme::to_memes;
use fabrica_music::{Chord, Note, NotePicker};
use std::collections::BTreeSet;
use tracing::trace;

/// One step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CraftStage {
    MacroMain,
    Beat,
    Detail,
    Background,
    Transition,
}

impl CraftStage {
    pub const PIPELINE: [CraftStage; 5] = [
        CraftStage::MacroMain,
        CraftStage::Beat,
        CraftStage::Detail,
        CraftStage::Background,
        CraftStage::Transition,
    ];

    pub fn run(self, fab: &mut Fabricator<'_>) -> Result<()> {
        match self {
            CraftStage::MacroMain => macro_main::craft(fab),
            CraftStage::Beat => beat::craft(fab),
            CraftStage::Detail => detail::craft(fab),
            CraftStage::Background => background::craft(fab),
            CraftStage::Transition => transition::craft(fab),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CraftStage::MacroMain => "macro-main",
            CraftStage::Beat => "beat",
            CraftStage::Detail => "detail",
            CraftStage::Background => "background",
            CraftStage::Transition => "transition",
        }
    }
}

/// `value` lies inside `[floor, ceiling]`, either edge possibly unbounded.
pub(crate) fn in_bounds(floor: i32, ceiling: i32, value: f64) -> bool {
    let above = floor == DELTA_UNLIMITED || value >= floor as f64;
    let below = ceiling == DELTA_UNLIMITED || value <= ceiling as f64;
    above && below
}

// ---------------------------------------------------------------------------
// Fresh selection
// ---------------------------------------------------------------------------

/// A program of `program_type` compatible with the segment's memes. With a
/// `voice_type`, only programs having a voice of that type qualify.
pub(crate) fn choose_fresh_program<'a>(
    fab: &mut Fabricator<'a>,
    program_type: ProgramType,
    voice_type: Option<InstrumentType>,
) -> Result<Option<&'a Program>> {
    let content = fab.content();
    let candidates: Vec<&Program> = content
        .programs_of_type(program_type)
        .into_iter()
        .filter(|p| {
            voice_type.is_none_or(|t| {
                content
                    .voices_of_program(p.id)
                    .iter()
                    .any(|v| v.instrument_type == t)
            })
        })
        .collect();

    let isometry = fab.meme_isometry_of_segment();
    let mut bag = SelectionBag::new();
    for program in &candidates {
        let memes = to_memes(content.memes_of_program(program.id).iter().map(|m| &m.name));
        if !isometry.is_allowed(&memes) {
            continue;
        }
        let quantity = 1 + isometry.score(&memes) as u64;
        if fab.is_directly_bound_program(program) {
            bag.add(1, program.id, quantity);
        }
        if program.state == ContentState::Published {
            bag.add(2, program.id, quantity);
        }
    }

    let label = match voice_type {
        Some(t) => format!("choiceOf{t}{program_type:?}Program"),
        None => format!("choiceOf{program_type:?}Program"),
    };
    fab.put_report(&label, format!("{bag:?}"))?;
    if bag.is_empty() {
        return Ok(None);
    }
    let picked = bag.pick(fab.rng())?;
    Ok(content.program(picked))
}

/// An instrument of `instrument_type` compatible with the segment's memes
/// whose audios cover every name in `require_event_names`.
pub(crate) fn choose_fresh_instrument<'a>(
    fab: &mut Fabricator<'a>,
    instrument_type: InstrumentType,
    require_event_names: &[String],
) -> Result<Option<&'a Instrument>> {
    let content = fab.content();
    let isometry = fab.meme_isometry_of_segment();
    let mut bag = SelectionBag::new();
    for instrument in content.instruments_of_type(instrument_type) {
        if !instrument_contains_audio_events_like(content, instrument, require_event_names) {
            continue;
        }
        let memes = to_memes(
            content
                .memes_of_instrument(instrument.id)
                .iter()
                .map(|m| &m.name),
        );
        if !isometry.is_allowed(&memes) {
            continue;
        }
        let quantity = 1 + isometry.score(&memes) as u64;
        if fab.is_directly_bound_instrument(instrument) {
            bag.add(1, instrument.id, quantity);
        }
        if instrument.state == ContentState::Published {
            bag.add(2, instrument.id, quantity);
        }
    }
    fab.put_report(&format!("choiceOf{instrument_type}Instrument"), format!("{bag:?}"))?;
    if bag.is_empty() {
        return Ok(None);
    }
    let picked = bag.pick(fab.rng())?;
    Ok(content.instrument(picked))
}

/// Every required name matches the event of some audio of the instrument.
pub(crate) fn instrument_contains_audio_events_like(
    content: &ContentStore,
    instrument: &Instrument,
    require_event_names: &[String],
) -> bool {
    let audios = content.audios_of_instrument(instrument.id);
    require_event_names
        .iter()
        .all(|name| audios.iter().any(|a| a.event.eq_ignore_ascii_case(name)))
}

/// The continued instrument for `instrument_type` in a Continue segment,
/// else a fresh one.
pub(crate) fn continued_or_fresh_instrument<'a>(
    fab: &mut Fabricator<'a>,
    instrument_type: InstrumentType,
) -> Result<(Option<&'a Instrument>, Option<SegmentChoice>)> {
    let content = fab.content();
    let continued = fab.choice_if_continued_by_type(instrument_type);
    if let Some(instrument) = continued
        .as_ref()
        .and_then(|c| c.instrument_id)
        .and_then(|id| content.instrument(id))
    {
        return Ok((Some(instrument), continued));
    }
    Ok((choose_fresh_instrument(fab, instrument_type, &[])?, None))
}

/// Audios for an instrument that plays several intensity layers at once.
///
/// A persistent instrument replays whatever it played earlier in the
/// lineage. Otherwise the instrument's audios are sorted by intensity, cut
/// into `intensityLayers` groups of equal size and one audio is drawn from
/// each group.
pub(crate) fn select_general_audio_intensity_layers<'a>(
    fab: &mut Fabricator<'a>,
    instrument: &Instrument,
) -> Result<Vec<&'a InstrumentAudio>> {
    let content = fab.content();
    if instrument.config.is_audio_selection_persistent {
        let previous: BTreeSet<InstrumentAudioId> = fab
            .retrospective()
            .previous_picks_for_instrument(instrument.id)
            .iter()
            .map(|p| p.instrument_audio_id)
            .collect();
        if !previous.is_empty() {
            return Ok(previous.into_iter().filter_map(|id| content.audio(id)).collect());
        }
    }

    let mut sorted = content.audios_of_instrument(instrument.id);
    if sorted.is_empty() {
        return Ok(Vec::new());
    }
    sorted.sort_by(|a, b| a.intensity.total_cmp(&b.intensity));
    let layers = fab.config().intensity_layers_for(instrument.instrument_type).max(1);
    let per_layer = sorted.len().div_ceil(layers);

    let mut result = Vec::new();
    for group in sorted.chunks(per_layer) {
        let mut bag = SelectionBag::new();
        bag.add_all(1, group.iter().map(|a| a.id), 1);
        if let Some(audio) = content.audio(bag.pick(fab.rng())?) {
            result.push(audio);
        }
    }
    Ok(result)
}

pub(crate) fn compute_mute(fab: &mut Fabricator<'_>, instrument_type: InstrumentType) -> bool {
    let probability = fab.config().mute_probability(instrument_type);
    fab.rng().random_bool(probability)
}

/// Delta window and mute flag for a new choice: inherited from the continued
/// choice, else planned.
pub(crate) fn apply_continuation(
    fab: &mut Fabricator<'_>,
    choice: &mut SegmentChoice,
    continued: Option<&SegmentChoice>,
    arcs: &DeltaArcs,
    layer: &str,
) {
    match continued {
        Some(previous) => {
            choice.delta_in = previous.delta_in;
            choice.delta_out = previous.delta_out;
            choice.mute = previous.mute;
        }
        None => {
            choice.delta_in = arcs.delta_in(layer);
            choice.delta_out = arcs.delta_out(layer);
            if let Some(t) = choice.instrument_type {
                choice.mute = compute_mute(fab, t);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event arrangement
// ---------------------------------------------------------------------------

/// How a note-event craft decides instruments and layers for its voices.
pub(crate) struct NoteEventPlan<'p> {
    pub tempo: f64,
    pub sequence: &'p ProgramSequence,
    pub arcs: &'p DeltaArcs,
    /// Events with no chord voicing play as atonal "X" notes.
    pub default_atonal: bool,
}

/// Arrange every voice of `plan.sequence`'s program. `instrument_for`
/// supplies a fresh instrument when the voice is not continued; `layer_of`
/// names the voice's delta-arc layer. A recoverable error skips only the
/// voice it came from.
pub(crate) fn craft_note_events<'a>(
    fab: &mut Fabricator<'a>,
    plan: &NoteEventPlan<'_>,
    voices: &[&'a ProgramVoice],
    mut instrument_for: impl FnMut(&mut Fabricator<'a>, &'a ProgramVoice) -> Result<Option<&'a Instrument>>,
    layer_of: impl Fn(&ProgramVoice) -> String,
) -> Result<()> {
    let content = fab.content();
    let Some(program) = content.program(plan.sequence.program_id) else {
        fab.add_error_message(format!("Program for sequence {} not found", plan.sequence.name))?;
        return Ok(());
    };

    for &voice in voices {
        match craft_voice(fab, plan, program, voice, &mut instrument_for, &layer_of) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => fab.add_error_message(format!(
                "Failed to craft {} voice {} of program {}: {e}",
                voice.instrument_type, voice.name, program.name
            ))?,
        }
    }
    Ok(())
}

fn craft_voice<'a>(
    fab: &mut Fabricator<'a>,
    plan: &NoteEventPlan<'_>,
    program: &'a Program,
    voice: &'a ProgramVoice,
    instrument_for: &mut impl FnMut(&mut Fabricator<'a>, &'a ProgramVoice) -> Result<Option<&'a Instrument>>,
    layer_of: &impl Fn(&ProgramVoice) -> String,
) -> Result<()> {
    let content = fab.content();
    let continued = fab.choice_if_continued_by_voice(voice);
    let instrument = match continued
        .as_ref()
        .and_then(|c| c.instrument_id)
        .and_then(|id| content.instrument(id))
    {
        Some(instrument) => Some(instrument),
        None => instrument_for(fab, voice)?,
    };
    let Some(instrument) = instrument else {
        return fab.add_warning_message(format!(
            "No instrument found for {} voice {} of program {}",
            voice.instrument_type, voice.name, program.name
        ));
    };

    let mut choice = SegmentChoice::new(fab.segment_id());
    choice.program_id = Some(program.id);
    choice.program_type = Some(program.program_type);
    choice.program_sequence_id = Some(plan.sequence.id);
    choice.program_voice_id = Some(voice.id);
    choice.instrument_id = Some(instrument.id);
    choice.instrument_type = Some(voice.instrument_type);
    choice.instrument_mode = Some(instrument.mode);
    apply_continuation(fab, &mut choice, continued.as_ref(), plan.arcs, &layer_of(voice));

    let Some(choice) = fab.put_choice(choice, false)? else {
        return Ok(());
    };
    craft_note_event_arrangements(fab, plan, program, &choice, instrument)
}

/// Lay patterns across the segment, restarting per chord section when the
/// program asks for it, then resolve one-shot lengths.
fn craft_note_event_arrangements<'a>(
    fab: &mut Fabricator<'a>,
    plan: &NoteEventPlan<'_>,
    program: &Program,
    choice: &SegmentChoice,
    instrument: &'a Instrument,
) -> Result<()> {
    let segment = fab.segment()?;
    let chords = fab.chords();
    let spans: Vec<(f64, f64)> = if program.config.do_pattern_restart_on_chord && !chords.is_empty() {
        sections(&chords, segment.total)
            .into_iter()
            .map(|(_, from, to)| (from, to))
            .collect()
    } else {
        vec![(0.0, segment.total as f64)]
    };
    for (from, to) in spans {
        craft_note_event_section(fab, plan, &segment, choice, instrument, from, to)?;
    }
    finalize_one_shot_cutoffs(fab, choice, instrument)
}

/// Chord sections: each chord paired with the span until the next chord, the
/// last running to `total`. Chords at or past `total` are dropped.
pub(crate) fn sections(chords: &[SegmentChord], total: u32) -> Vec<(SegmentChord, f64, f64)> {
    let total = total as f64;
    let inside: Vec<&SegmentChord> = chords.iter().filter(|c| c.position < total).collect();
    inside
        .iter()
        .enumerate()
        .map(|(i, chord)| {
            let to = inside.get(i + 1).map(|next| next.position).unwrap_or(total);
            ((*chord).clone(), chord.position, to)
        })
        .collect()
}

fn craft_note_event_section<'a>(
    fab: &mut Fabricator<'a>,
    plan: &NoteEventPlan<'_>,
    segment: &Segment,
    choice: &SegmentChoice,
    instrument: &'a Instrument,
    from: f64,
    to: f64,
) -> Result<()> {
    let mut position = from;
    while position < to {
        let Some(pattern) = fab.randomly_selected_pattern(choice) else {
            return Ok(());
        };
        let advanced = craft_pattern_events(fab, plan, segment, choice, instrument, pattern, position, to)?;
        if advanced <= 0.0 {
            return Ok(());
        }
        position += advanced;
    }
    Ok(())
}

/// Arrange one pass of `pattern` starting at `from`. Returns how many beats
/// it covered.
#[allow(clippy::too_many_arguments)]
fn craft_pattern_events<'a>(
    fab: &mut Fabricator<'a>,
    plan: &NoteEventPlan<'_>,
    segment: &Segment,
    choice: &SegmentChoice,
    instrument: &'a Instrument,
    pattern: &ProgramSequencePattern,
    from: f64,
    to: f64,
) -> Result<f64> {
    let covered = (pattern.total as f64).min(to - from);
    if covered <= 0.0 {
        return Ok(0.0);
    }
    let content = fab.content();
    let arrangement = fab.put_arrangement(choice, Some(pattern.id))?;
    for event in content.events_of_pattern(pattern.id) {
        // Events past the pattern length still sound; past the section end
        // they would have no length left.
        if from + event.position >= to {
            continue;
        }
        let placed = PlacedEvent {
            event,
            position: from + event.position,
            section_end: to,
        };
        pick_notes_and_instrument_audio_for_event(fab, plan, segment, choice, &arrangement, instrument, &placed)?;
    }
    Ok(covered)
}

/// A pattern event pinned to a segment position.
struct PlacedEvent<'e> {
    event: &'e ProgramSequencePatternEvent,
    position: f64,
    section_end: f64,
}

fn pick_notes_and_instrument_audio_for_event<'a>(
    fab: &mut Fabricator<'a>,
    plan: &NoteEventPlan<'_>,
    segment: &Segment,
    choice: &SegmentChoice,
    arrangement: &SegmentChoiceArrangement,
    instrument: &'a Instrument,
    placed: &PlacedEvent<'_>,
) -> Result<()> {
    let position = placed.position;
    if position < 0.0 || position >= segment.total as f64 {
        return Ok(());
    }
    let duration = placed.event.duration.min(placed.section_end - position);
    let volume = volume_ratio(fab, choice, segment.delta, position);
    if volume <= 0.0 {
        trace!(segment_id = segment.id.0, position, "event outside delta window");
        return Ok(());
    }

    let chord = fab.chord_at(position);
    let voicing = match (&chord, choice.instrument_type) {
        (Some(chord), Some(t)) => fab.choose_voicing(chord, t),
        _ => None,
    };
    let notes = match (&chord, &voicing) {
        (Some(chord), Some(voicing)) => pick_notes_for_event(fab, choice, placed.event, chord, voicing)?,
        _ if plan.default_atonal => vec!["X".to_string()],
        _ => Vec::new(),
    };

    let timing = PickTiming {
        tempo: plan.tempo,
        position,
        duration,
        amplitude: placed.event.velocity * volume,
    };
    for note in notes {
        pick_instrument_audio(fab, &note, instrument, placed.event, arrangement, voicing.as_ref(), &timing)?;
    }
    Ok(())
}

/// Concrete note names for each tone of `event` against a segment voicing.
///
/// Written tones are transposed from the choice's key to the chord and
/// shifted by whole octaves so the program's range sits against the
/// voicing's range; atonal tones take their sticky bun's note from the
/// voicing. Every target is then snapped onto the voicing by the picker.
fn pick_notes_for_event(
    fab: &mut Fabricator<'_>,
    choice: &SegmentChoice,
    event: &ProgramSequencePatternEvent,
    chord: &SegmentChord,
    voicing: &SegmentChordVoicing,
) -> Result<Vec<String>> {
    let Some(instrument_type) = choice.instrument_type else {
        return Ok(Vec::new());
    };
    let source_key = fab.key_for_choice(choice);
    let target_chord = Chord::of(&chord.name);
    let transpose = fab.program_target_shift(instrument_type, &source_key, &target_chord);
    let program_range = match choice.program_id {
        Some(id) => fab.program_range(id, instrument_type),
        None => Default::default(),
    };
    let voicing_range = fab.program_voicing_note_range(instrument_type);
    let octaves = fab.program_range_shift_octaves(instrument_type, &program_range.shifted(transpose), &voicing_range);
    let voiced = voicing_notes(voicing);
    let seek = fab.config().seeks_inversions(instrument_type);
    let mut picker = NotePicker::new(voicing_range, voiced.clone(), seek);

    let mut names = Vec::new();
    let tones = event.tones.split(',').map(str::trim).filter(|t| !t.is_empty());
    for (index, tone) in tones.enumerate() {
        let written = Note::of(tone);
        let target = if written.is_atonal() {
            match fab.sticky_bun(event.id)? {
                Some(bun) => bun.compute(&voiced, index),
                None => fab.rng().choose(&voiced).copied().unwrap_or_else(Note::atonal),
            }
        } else {
            written.shift(transpose).shift_octave(octaves)
        };
        if target.is_atonal() {
            continue;
        }
        let note = picker.pick(&target, fab.rng());
        names.push(note.name(target_chord.accidental));
    }
    Ok(names)
}

struct PickTiming {
    tempo: f64,
    position: f64,
    duration: f64,
    amplitude: f64,
}

fn pick_instrument_audio<'a>(
    fab: &mut Fabricator<'a>,
    note: &str,
    instrument: &'a Instrument,
    event: &ProgramSequencePatternEvent,
    arrangement: &SegmentChoiceArrangement,
    voicing: Option<&SegmentChordVoicing>,
    timing: &PickTiming,
) -> Result<()> {
    let audio = if instrument.config.is_multiphonic {
        select_multiphonic_instrument_audio(fab, instrument, event, note)?
    } else {
        select_monophonic_instrument_audio(fab, instrument, event)?
    };
    let Some(audio) = audio else {
        return Ok(());
    };

    let track = fab.track_name(event);
    let start = segment_micros_at_position(timing.tempo, timing.position);
    let length = if fab.is_one_shot(instrument, Some(&track)) {
        None
    } else {
        Some(segment_micros_at_position(timing.tempo, timing.position + timing.duration) - start)
    };
    fab.put_pick(SegmentChoiceArrangementPick {
        id: PickId(0),
        segment_id: fab.segment_id(),
        segment_choice_arrangement_id: arrangement.id,
        program_sequence_pattern_event_id: Some(event.id),
        instrument_audio_id: audio.id,
        segment_chord_voicing_id: voicing.map(|v| v.id),
        start_at_segment_micros: start,
        length_micros: length,
        amplitude: timing.amplitude,
        tones: if instrument.config.is_tonal { note.to_string() } else { "X".to_string() },
        event: track,
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Audio selection
// ---------------------------------------------------------------------------

/// One audio per event, keyed by the event's track and written tones.
fn select_monophonic_instrument_audio<'a>(
    fab: &mut Fabricator<'a>,
    instrument: &Instrument,
    event: &ProgramSequencePatternEvent,
) -> Result<Option<&'a InstrumentAudio>> {
    let parent = event.program_voice_track_id.to_string();
    let persistent = instrument.config.is_audio_selection_persistent;
    if persistent && let Some(audio) = fab.preferred_audio(&parent, &event.tones) {
        return Ok(Some(audio));
    }
    let Some(audio) = select_new_note_event_audio(fab, instrument, event)? else {
        let track = fab.track_name(event);
        fab.add_error_message(format!(
            "Unable to select audio for event {track} ({}) on instrument {}",
            event.tones, instrument.name
        ))?;
        return Ok(None);
    };
    if persistent {
        fab.put_preferred_audio(&parent, &event.tones, audio.id);
    }
    Ok(Some(audio))
}

/// Drum audios match on event name, everything else on the written note.
/// The best score wins and ties are drawn at random, so an instrument with
/// any audio always yields one. `None` only for an instrument without audios.
fn select_new_note_event_audio<'a>(
    fab: &mut Fabricator<'a>,
    instrument: &Instrument,
    event: &ProgramSequencePatternEvent,
) -> Result<Option<&'a InstrumentAudio>> {
    let content = fab.content();
    let track = fab.track_name(event);
    let written = Note::of(event.tones.split(',').next().unwrap_or_default());
    let scored: Vec<(&InstrumentAudio, u64)> = content
        .audios_of_instrument(instrument.id)
        .into_iter()
        .map(|audio| {
            let score = match instrument.instrument_type {
                InstrumentType::Drum if audio.event.eq_ignore_ascii_case(&track) => 300,
                InstrumentType::Drum => 0,
                _ if !written.is_atonal() && Note::of(&audio.tones) == written => 100,
                _ => 0,
            };
            (audio, score)
        })
        .collect();
    let Some(best) = scored.iter().map(|(_, s)| *s).max() else {
        return Ok(None);
    };
    let mut bag = SelectionBag::new();
    bag.add_all(
        1,
        scored.iter().filter(|(_, s)| *s == best).map(|(a, _)| a.id),
        1,
    );
    Ok(content.audio(bag.pick(fab.rng())?))
}

/// One audio per note, keyed by the event's track and the picked note.
fn select_multiphonic_instrument_audio<'a>(
    fab: &mut Fabricator<'a>,
    instrument: &Instrument,
    event: &ProgramSequencePatternEvent,
    note: &str,
) -> Result<Option<&'a InstrumentAudio>> {
    let parent = event.program_voice_track_id.to_string();
    let persistent = instrument.config.is_audio_selection_persistent;
    if persistent && let Some(audio) = fab.preferred_audio(&parent, note) {
        return Ok(Some(audio));
    }
    let Some(audio) = select_new_multiphonic_audio(fab, instrument, note)? else {
        let available: Vec<String> = fab
            .content()
            .audios_of_instrument(instrument.id)
            .iter()
            .map(|a| a.tones.clone())
            .collect();
        fab.add_error_message(format!(
            "Unable to select audio for note {note} on instrument {}; available tones [{}]",
            instrument.name,
            available.join(", ")
        ))?;
        return Ok(None);
    };
    if persistent {
        fab.put_preferred_audio(&parent, note, audio.id);
    }
    Ok(Some(audio))
}

/// Audios whose tone equals `note`, or where either side is atonal.
fn select_new_multiphonic_audio<'a>(
    fab: &mut Fabricator<'a>,
    instrument: &Instrument,
    note: &str,
) -> Result<Option<&'a InstrumentAudio>> {
    let content = fab.content();
    let wanted = Note::of(note);
    let mut bag = SelectionBag::new();
    for audio in content.audios_of_instrument(instrument.id) {
        let tone = Note::of(&audio.tones);
        if wanted.is_atonal() || tone.is_atonal() || tone == wanted {
            bag.add(1, audio.id, 1);
        }
    }
    if bag.is_empty() {
        return Ok(None);
    }
    Ok(content.audio(bag.pick(fab.rng())?))
}

/// The instrument's audio for `chord`: the same chord first, else an
/// acceptable substitute. Remembered per instrument and chord name.
fn select_chord_part_audio<'a>(
    fab: &mut Fabricator<'a>,
    instrument: &Instrument,
    chord: &Chord,
) -> Result<Option<&'a InstrumentAudio>> {
    let parent = instrument.id.to_string();
    let persistent = instrument.config.is_audio_selection_persistent;
    if persistent && let Some(audio) = fab.preferred_audio(&parent, &chord.name) {
        return Ok(Some(audio));
    }
    let content = fab.content();
    let mut bag = SelectionBag::new();
    for audio in content.audios_of_instrument(instrument.id) {
        let sounds = Chord::of(&audio.tones);
        if sounds.is_same(chord) {
            bag.add(0, audio.id, 1);
        } else if sounds.is_acceptable(chord) {
            bag.add(1, audio.id, 1);
        }
    }
    if bag.is_empty() {
        fab.add_warning_message(format!(
            "No chord audio for {} on instrument {}",
            chord.name, instrument.name
        ))?;
        return Ok(None);
    }
    let Some(audio) = content.audio(bag.pick(fab.rng())?) else {
        return Ok(None);
    };
    if persistent {
        fab.put_preferred_audio(&parent, &chord.name, audio.id);
    }
    Ok(Some(audio))
}

// ---------------------------------------------------------------------------
// Finishing passes
// ---------------------------------------------------------------------------

/// Give open-ended picks of a one-shot, cutoff-enabled instrument a length:
/// up to the next later start of the same choice, else to the segment end.
/// Picks starting at or past the end are deleted.
pub(crate) fn finalize_one_shot_cutoffs(
    fab: &mut Fabricator<'_>,
    choice: &SegmentChoice,
    instrument: &Instrument,
) -> Result<()> {
    if !instrument.config.is_one_shot
        || !fab.is_one_shot_cutoff_enabled(instrument)
        || !fab.config().finalizes_audio_lengths(instrument.instrument_type)
    {
        return Ok(());
    }
    let total = fab.total_segment_micros()?;
    let picks = fab.picks_of_choice(choice.id);
    let starts: BTreeSet<i64> = picks.iter().map(|p| p.start_at_segment_micros).collect();
    for mut pick in picks {
        if pick.length_micros.is_some() {
            continue;
        }
        let start = pick.start_at_segment_micros;
        if start >= total {
            fab.delete_pick(pick.id);
            continue;
        }
        let end = starts
            .range(start + 1..)
            .next()
            .copied()
            .unwrap_or(total)
            .min(total);
        pick.length_micros = Some(end - start);
        fab.put_pick(pick)?;
    }
    Ok(())
}

/// 1 while `delta + position` is inside the choice's delta window, else 0.
pub(crate) fn volume_ratio(fab: &Fabricator<'_>, choice: &SegmentChoice, delta: i32, position: f64) -> f64 {
    if !fab.config().delta_arc_enabled {
        return 1.0;
    }
    if in_bounds(choice.delta_in, choice.delta_out, delta as f64 + position) {
        1.0
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Part crafts
// ---------------------------------------------------------------------------

/// One pick per chord section for a Chord-mode instrument.
pub(crate) fn craft_chord_parts<'a>(
    fab: &mut Fabricator<'a>,
    instrument: &'a Instrument,
    continued: Option<&SegmentChoice>,
    arcs: &DeltaArcs,
) -> Result<()> {
    let segment = fab.segment()?;
    let mut choice = SegmentChoice::new(fab.segment_id());
    choice.instrument_id = Some(instrument.id);
    choice.instrument_type = Some(instrument.instrument_type);
    choice.instrument_mode = Some(InstrumentMode::Chord);
    apply_continuation(fab, &mut choice, continued, arcs, &instrument.instrument_type.to_string());
    let Some(choice) = fab.put_choice(choice, false)? else {
        return Ok(());
    };
    let arrangement = fab.put_arrangement(&choice, None)?;
    let one_shot = fab.is_one_shot(instrument, None);
    let chords = fab.chords();

    for (chord, from, to) in sections(&chords, segment.total) {
        let volume = volume_ratio(fab, &choice, segment.delta, from);
        if volume <= 0.0 {
            continue;
        }
        let target = Chord::of(&chord.name);
        if !target.is_present() {
            continue;
        }
        let Some(audio) = select_chord_part_audio(fab, instrument, &target)? else {
            continue;
        };
        let start = segment_micros_at_position(segment.tempo, from);
        let length = if one_shot {
            None
        } else {
            Some(segment_micros_at_position(segment.tempo, to) - start)
        };
        fab.put_pick(SegmentChoiceArrangementPick {
            id: PickId(0),
            segment_id: fab.segment_id(),
            segment_choice_arrangement_id: arrangement.id,
            program_sequence_pattern_event_id: None,
            instrument_audio_id: audio.id,
            segment_chord_voicing_id: None,
            start_at_segment_micros: start,
            length_micros: length,
            amplitude: volume,
            tones: chord.name.clone(),
            event: instrument.instrument_type.to_string().to_uppercase(),
        })?;
    }
    finalize_one_shot_cutoffs(fab, &choice, instrument)
}

/// Arrange the voices of `program` matching the instrument's type, always
/// played on `instrument`.
pub(crate) fn craft_event_parts<'a>(
    fab: &mut Fabricator<'a>,
    instrument: &'a Instrument,
    program: &'a Program,
    arcs: &DeltaArcs,
) -> Result<()> {
    let content = fab.content();
    let segment = fab.segment()?;
    let Some(sequence) = fab.randomly_selected_sequence(program.id) else {
        fab.add_warning_message(format!("Program {} has no sequences", program.name))?;
        return Ok(());
    };
    let voices: Vec<&ProgramVoice> = content
        .voices_of_program(program.id)
        .into_iter()
        .filter(|v| v.instrument_type == instrument.instrument_type)
        .collect();
    if voices.is_empty() {
        fab.add_warning_message(format!(
            "Program {} has no {} voice",
            program.name, instrument.instrument_type
        ))?;
        return Ok(());
    }
    let plan = NoteEventPlan {
        tempo: segment.tempo,
        sequence,
        arcs,
        default_atonal: false,
    };
    let layer = instrument.instrument_type.to_string();
    craft_note_events(fab, &plan, &voices, |_, _| Ok(Some(instrument)), |_| layer.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentConfig;
    use crate::fabricator::FabricatorOverrides;
    use crate::ids::*;
    use crate::store::SegmentStore;
    use crate::test_fixtures::Fixtures;
    use fabrica_prng::FabRng;

    #[test]
    fn bounds_treat_unlimited_edges_as_open() {
        assert!(in_bounds(DELTA_UNLIMITED, DELTA_UNLIMITED, 1e9));
        assert!(in_bounds(16, DELTA_UNLIMITED, 16.0));
        assert!(!in_bounds(16, DELTA_UNLIMITED, 15.5));
        assert!(in_bounds(DELTA_UNLIMITED, 32, 32.0));
        assert!(!in_bounds(DELTA_UNLIMITED, 32, 32.5));
        assert!(in_bounds(8, 16, 12.0));
    }

    #[test]
    fn sections_span_chord_to_chord() {
        let chord = |name: &str, position: f64| SegmentChord {
            id: SegmentChordId(0),
            segment_id: SegmentId(0),
            name: name.into(),
            position,
        };
        let chords = vec![chord("C", 0.0), chord("G", 8.0), chord("F", 16.0)];
        let spans: Vec<(String, f64, f64)> = sections(&chords, 16)
            .into_iter()
            .map(|(c, from, to)| (c.name, from, to))
            .collect();
        assert_eq!(spans, vec![("C".into(), 0.0, 8.0), ("G".into(), 8.0, 16.0)]);
        assert!(sections(&[], 16).is_empty());
    }

    /// Store with a crafted-in-progress segment 0 of `duration` micros.
    fn segment_store(fx: &Fixtures, duration: i64) -> SegmentStore {
        let mut store = fx.store_with_planned_segment();
        let mut segment = store.read_segment(SegmentId(0)).unwrap().clone();
        segment.total = 2;
        segment.tempo = 120.0;
        segment.duration_micros = Some(duration);
        store.update_segment(segment).unwrap();
        store
    }

    #[test]
    fn one_shot_cutoff_runs_to_next_start_then_segment_end() {
        let fx = Fixtures::new(21);
        let mut store = segment_store(&fx, 1_000_000);
        let mut rng = FabRng::new(21);
        let mut fab =
            Fabricator::new(&mut store, &fx.content, &mut rng, SegmentId(0), FabricatorOverrides::default())
                .unwrap();
        let mut instrument = fx.content.instrument(fx.bass_instrument).unwrap().clone();
        instrument.config = InstrumentConfig {
            is_one_shot: true,
            is_one_shot_cutoff_enabled: true,
            ..Default::default()
        };
        let mut choice = SegmentChoice::new(SegmentId(0));
        choice.instrument_id = Some(instrument.id);
        let choice = fab.put_choice(choice, true).unwrap().unwrap();
        let arrangement = fab.put_arrangement(&choice, None).unwrap();
        let audio = fx.content.audios_of_instrument(instrument.id)[0].id;
        for start in [0, 500_000, 1_200_000] {
            fab.put_pick(SegmentChoiceArrangementPick {
                id: PickId(0),
                segment_id: SegmentId(0),
                segment_choice_arrangement_id: arrangement.id,
                program_sequence_pattern_event_id: None,
                instrument_audio_id: audio,
                segment_chord_voicing_id: None,
                start_at_segment_micros: start,
                length_micros: None,
                amplitude: 1.0,
                tones: "C2".into(),
                event: "BASS".into(),
            })
            .unwrap();
        }

        finalize_one_shot_cutoffs(&mut fab, &choice, &instrument).unwrap();
        let lengths: Vec<(i64, Option<i64>)> = fab
            .picks_of_choice(choice.id)
            .iter()
            .map(|p| (p.start_at_segment_micros, p.length_micros))
            .collect();
        assert_eq!(lengths, vec![(0, Some(500_000)), (500_000, Some(500_000))]);
    }

    #[test]
    fn cutoff_skips_types_not_finalized() {
        let fx = Fixtures::new(22);
        let mut store = segment_store(&fx, 1_000_000);
        let mut rng = FabRng::new(22);
        let mut fab =
            Fabricator::new(&mut store, &fx.content, &mut rng, SegmentId(0), FabricatorOverrides::default())
                .unwrap();
        // Drums are one-shot but not in the default finalization list.
        let drum = fx.content.instrument(fx.drum_instrument).unwrap();
        let mut choice = SegmentChoice::new(SegmentId(0));
        choice.instrument_id = Some(drum.id);
        let choice = fab.put_choice(choice, true).unwrap().unwrap();
        let arrangement = fab.put_arrangement(&choice, None).unwrap();
        fab.put_pick(SegmentChoiceArrangementPick {
            id: PickId(0),
            segment_id: SegmentId(0),
            segment_choice_arrangement_id: arrangement.id,
            program_sequence_pattern_event_id: None,
            instrument_audio_id: fx.content.audios_of_instrument(drum.id)[0].id,
            segment_chord_voicing_id: None,
            start_at_segment_micros: 0,
            length_micros: None,
            amplitude: 1.0,
            tones: "X".into(),
            event: "KICK".into(),
        })
        .unwrap();
        finalize_one_shot_cutoffs(&mut fab, &choice, drum).unwrap();
        assert_eq!(fab.picks_of_choice(choice.id)[0].length_micros, None);
    }

    #[test]
    fn fresh_instrument_requires_event_names() {
        let fx = Fixtures::new(23);
        let mut store = fx.store_with_planned_segment();
        let mut rng = FabRng::new(23);
        let mut fab =
            Fabricator::new(&mut store, &fx.content, &mut rng, SegmentId(0), FabricatorOverrides::default())
                .unwrap();
        let found = choose_fresh_instrument(&mut fab, InstrumentType::Drum, &["kick".into(), "SNARE".into()])
            .unwrap()
            .unwrap();
        assert_eq!(found.id, fx.drum_instrument);
        assert!(choose_fresh_instrument(&mut fab, InstrumentType::Drum, &["COWBELL".into()])
            .unwrap()
            .is_none());
    }

    #[test]
    fn fresh_program_respects_meme_stack_and_voice_type() {
        let fx = Fixtures::new(24);
        let mut store = fx.store_with_planned_segment();
        let mut rng = FabRng::new(24);
        let mut fab =
            Fabricator::new(&mut store, &fx.content, &mut rng, SegmentId(0), FabricatorOverrides::default())
                .unwrap();
        fab.put_meme("WINTER", true).unwrap();
        for _ in 0..20 {
            let program = choose_fresh_program(&mut fab, ProgramType::Main, None).unwrap().unwrap();
            assert_eq!(program.id, fx.main_program);
        }
        let detail = choose_fresh_program(&mut fab, ProgramType::Detail, Some(InstrumentType::Bass))
            .unwrap()
            .unwrap();
        assert_eq!(detail.id, fx.detail_program);
        assert!(choose_fresh_program(&mut fab, ProgramType::Detail, Some(InstrumentType::Hook))
            .unwrap()
            .is_none());
    }

    #[test]
    fn intensity_layers_draw_one_audio_per_group() {
        let fx = Fixtures::new(25);
        let mut store = fx.store_with_planned_segment();
        let mut rng = FabRng::new(25);
        let mut fab =
            Fabricator::new(&mut store, &fx.content, &mut rng, SegmentId(0), FabricatorOverrides::default())
                .unwrap();
        // Three transition audios over the default three layers.
        let transition = fx.content.instrument(fx.transition_instrument).unwrap();
        let audios = select_general_audio_intensity_layers(&mut fab, transition).unwrap();
        assert_eq!(audios.len(), 3);
        // Six bass audios over one layer.
        let bass = fx.content.instrument(fx.bass_instrument).unwrap();
        assert_eq!(select_general_audio_intensity_layers(&mut fab, bass).unwrap().len(), 1);
    }

    #[test]
    fn monophonic_selection_falls_back_to_any_audio() {
        let mut fx = Fixtures::new(26);
        let mut ids = FabRng::new(260);
        let instrument_id = InstrumentId::new(&mut ids);
        let mut instrument = fx.content.instrument(fx.bass_instrument).unwrap().clone();
        instrument.id = instrument_id;
        instrument.name = "Sub Bass".into();
        fx.content.put_instrument(instrument);
        let mut audio = fx.content.audios_of_instrument(fx.bass_instrument)[0].clone();
        audio.id = InstrumentAudioId::new(&mut ids);
        audio.instrument_id = instrument_id;
        audio.tones = "A1".into();
        fx.content.put_audio(audio.clone());

        let mut store = fx.store_with_planned_segment();
        let mut rng = FabRng::new(26);
        let mut fab =
            Fabricator::new(&mut store, &fx.content, &mut rng, SegmentId(0), FabricatorOverrides::default())
                .unwrap();
        // The event is written as C2; the only sample is A1.
        let event = fx.content.event(fx.bass_event).unwrap();
        let instrument = fx.content.instrument(instrument_id).unwrap();
        let picked = select_new_note_event_audio(&mut fab, instrument, event).unwrap();
        assert_eq!(picked.map(|a| a.id), Some(audio.id));
        let picked = select_monophonic_instrument_audio(&mut fab, instrument, event).unwrap();
        assert_eq!(picked.map(|a| a.id), Some(audio.id));
        assert!(fab.messages().is_empty());
    }

    /// Bass pick starts after crafting the walking bass over a 16-beat
    /// segment at 120 BPM with the given chords.
    fn walking_bass_starts(fx: &Fixtures, seed: u64, chords: &[(&str, f64)]) -> Vec<i64> {
        let mut store = fx.store_with_planned_segment();
        let mut segment = store.read_segment(SegmentId(0)).unwrap().clone();
        segment.total = 16;
        segment.tempo = 120.0;
        segment.duration_micros = Some(8_000_000);
        store.update_segment(segment).unwrap();
        let mut rng = FabRng::new(seed);
        let mut fab =
            Fabricator::new(&mut store, &fx.content, &mut rng, SegmentId(0), FabricatorOverrides::default())
                .unwrap();
        for (name, position) in chords {
            let chord = fab.put_chord(name, *position).unwrap();
            fab.put_chord_voicing(&chord, InstrumentType::Bass, "C2,E2,G2").unwrap();
        }
        let instrument = fx.content.instrument(fx.bass_instrument).unwrap();
        let program = fx.content.program(fx.detail_program).unwrap();
        craft_event_parts(&mut fab, instrument, program, &DeltaArcs::default()).unwrap();
        let mut starts: Vec<i64> = fab.picks().iter().map(|p| p.start_at_segment_micros).collect();
        starts.sort();
        starts
    }

    #[test]
    fn restart_on_a_lone_chord_starts_at_the_chord() {
        let mut fx = Fixtures::new(27);
        let mut program = fx.content.program(fx.detail_program).unwrap().clone();
        program.config.do_pattern_restart_on_chord = true;
        fx.content.put_program(program);
        // Four-beat pattern with events at 0 and 2, laid from beat 4.
        assert_eq!(
            walking_bass_starts(&fx, 27, &[("C", 4.0)]),
            vec![2_000_000, 3_000_000, 4_000_000, 5_000_000, 6_000_000, 7_000_000]
        );
    }

    #[test]
    fn events_past_the_pattern_length_still_sound() {
        let mut fx = Fixtures::new(28);
        let pattern_id = fx.content.event(fx.bass_event).unwrap().program_sequence_pattern_id;
        let mut pattern = fx.content.pattern(pattern_id).unwrap().clone();
        pattern.total = 2;
        fx.content.put_pattern(pattern);
        // Passes every 2 beats; the event at beat 2 of each pass lands on
        // the next pass's start, except past the segment end.
        let starts = walking_bass_starts(&fx, 28, &[("C", 0.0)]);
        assert_eq!(starts.len(), 15);
        assert_eq!(starts.iter().filter(|s| **s == 1_000_000).count(), 2);
        assert_eq!(starts.last(), Some(&7_000_000));
    }
}

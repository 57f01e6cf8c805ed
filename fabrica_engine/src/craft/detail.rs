// Detail stage: melodic and textural layers over the harmony.
//
// For each detail instrument type, the lineage's instrument is kept in a
// Continue segment, else a fresh one is chosen. What happens next depends on
// the instrument's mode:
// - Event: the voices of a Detail program are arranged note by note against
//   the segment's chord voicings.
// - Chord: one audio per chord section, chosen by chord name.
// - Loop: each intensity-layered audio is tiled from the segment start at
//   its loop length, the last tile clipped to the segment end.
//
// A type with no usable instrument is skipped silently, and a recoverable
// error in one type is recorded without stopping the others. Delta arcs are
// planned per instrument type.

use super::*;
use crate::delta_arc::{self, DeltaArcPlan};
use tracing::debug;

/// Detail instrument types in crafting order.
pub const DETAIL_TYPES: [InstrumentType; 7] = [
    InstrumentType::Bass,
    InstrumentType::Pad,
    InstrumentType::Hook,
    InstrumentType::Stab,
    InstrumentType::Sticky,
    InstrumentType::Stripe,
    InstrumentType::Percussion,
];

pub fn craft(fab: &mut Fabricator<'_>) -> Result<()> {
    let arcs = plan_arcs(fab)?;
    for instrument_type in DETAIL_TYPES {
        match craft_instrument_type(fab, instrument_type, &arcs) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => fab.add_error_message(format!("Failed to craft {instrument_type} detail: {e}"))?,
        }
    }
    Ok(())
}

fn craft_instrument_type(fab: &mut Fabricator<'_>, instrument_type: InstrumentType, arcs: &DeltaArcs) -> Result<()> {
    let (instrument, continued) = continued_or_fresh_instrument(fab, instrument_type)?;
    let Some(instrument) = instrument else {
        return Ok(());
    };
    debug!(
        segment_id = fab.segment_id().0,
        instrument = %instrument.name,
        mode = ?instrument.mode,
        "detail instrument"
    );
    match instrument.mode {
        InstrumentMode::Event => craft_event_mode(fab, instrument, arcs),
        InstrumentMode::Chord => craft_chord_parts(fab, instrument, continued.as_ref(), arcs),
        InstrumentMode::Loop => craft_loop_parts(fab, instrument, continued.as_ref(), arcs),
    }
}

fn plan_arcs(fab: &mut Fabricator<'_>) -> Result<DeltaArcs> {
    let content = fab.content();
    let segment = fab.segment()?;
    let config = fab.config().clone();
    let bar_beats = fab
        .current_choice_of_type(ProgramType::Main)
        .and_then(|c| c.program_id)
        .and_then(|id| content.program(id))
        .map(|p| p.config.bar_beats)
        .unwrap_or(4);
    let layers: Vec<String> = config.detail_layer_order.iter().map(ToString::to_string).collect();
    let history = fab.retrospective().choices().to_vec();
    let plan = DeltaArcPlan {
        enabled: config.delta_arc_enabled,
        segment_type: fab.segment_type(),
        total: segment.total,
        bar_beats,
        layers: &layers,
        prioritize: &[],
        incoming: config.delta_arc_detail_layers_incoming,
    };
    Ok(delta_arc::precompute(
        &plan,
        &history,
        |choice| {
            let detail = choice.program_type == Some(ProgramType::Detail)
                || (choice.program_type.is_none() && choice.instrument_mode.is_some());
            if detail {
                choice.instrument_type.map(|t| t.to_string())
            } else {
                None
            }
        },
        fab.rng(),
    ))
}

fn craft_event_mode<'a>(fab: &mut Fabricator<'a>, instrument: &'a Instrument, arcs: &DeltaArcs) -> Result<()> {
    let content = fab.content();
    let continued_program = fab
        .choice_if_continued_by_type_and_mode(instrument.instrument_type, InstrumentMode::Event)
        .and_then(|c| c.program_id)
        .and_then(|id| content.program(id));
    let program = match continued_program {
        Some(program) => Some(program),
        None => choose_fresh_program(fab, ProgramType::Detail, Some(instrument.instrument_type))?,
    };
    match program {
        Some(program) => craft_event_parts(fab, instrument, program, arcs),
        None => {
            fab.add_warning_message(format!(
                "No detail program for {} instrument {}",
                instrument.instrument_type, instrument.name
            ))?;
            Ok(())
        }
    }
}

fn craft_loop_parts<'a>(
    fab: &mut Fabricator<'a>,
    instrument: &'a Instrument,
    continued: Option<&SegmentChoice>,
    arcs: &DeltaArcs,
) -> Result<()> {
    let segment = fab.segment()?;
    let mut choice = SegmentChoice::new(fab.segment_id());
    choice.instrument_id = Some(instrument.id);
    choice.instrument_type = Some(instrument.instrument_type);
    choice.instrument_mode = Some(InstrumentMode::Loop);
    apply_continuation(fab, &mut choice, continued, arcs, &instrument.instrument_type.to_string());
    let Some(choice) = fab.put_choice(choice, false)? else {
        return Ok(());
    };
    let arrangement = fab.put_arrangement(&choice, None)?;
    let total = segment.total as f64;

    for audio in select_general_audio_intensity_layers(fab, instrument)? {
        if audio.loop_beats <= 0.0 {
            fab.add_warning_message(format!(
                "Loop audio {} of {} has no loop length",
                audio.name, instrument.name
            ))?;
            continue;
        }
        let mut position = 0.0;
        while position < total {
            let end = (position + audio.loop_beats).min(total);
            let volume = volume_ratio(fab, &choice, segment.delta, position);
            if volume > 0.0 {
                let start = segment_micros_at_position(segment.tempo, position);
                fab.put_pick(SegmentChoiceArrangementPick {
                    id: PickId(0),
                    segment_id: fab.segment_id(),
                    segment_choice_arrangement_id: arrangement.id,
                    program_sequence_pattern_event_id: None,
                    instrument_audio_id: audio.id,
                    segment_chord_voicing_id: None,
                    start_at_segment_micros: start,
                    length_micros: Some(segment_micros_at_position(segment.tempo, end) - start),
                    amplitude: volume,
                    tones: "X".into(),
                    event: audio.event.clone(),
                })?;
            }
            position += audio.loop_beats;
        }
    }
    Ok(())
}

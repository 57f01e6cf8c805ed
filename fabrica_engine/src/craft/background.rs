// Background stage: ambience under the whole segment.
//
// One Background instrument (the lineage's in a Continue segment, else a
// fresh one). Each of its intensity-layered audios plays once, from the
// segment start for the segment's full duration.

use super::*;

pub fn craft(fab: &mut Fabricator<'_>) -> Result<()> {
    let (instrument, continued) = continued_or_fresh_instrument(fab, InstrumentType::Background)?;
    let Some(instrument) = instrument else {
        return Ok(());
    };
    let mut choice = SegmentChoice::new(fab.segment_id());
    choice.instrument_id = Some(instrument.id);
    choice.instrument_type = Some(instrument.instrument_type);
    choice.instrument_mode = Some(instrument.mode);
    apply_continuation(
        fab,
        &mut choice,
        continued.as_ref(),
        &DeltaArcs::default(),
        &instrument.instrument_type.to_string(),
    );
    let Some(choice) = fab.put_choice(choice, false)? else {
        return Ok(());
    };
    let arrangement = fab.put_arrangement(&choice, None)?;
    let duration = fab.total_segment_micros()?;

    for audio in select_general_audio_intensity_layers(fab, instrument)? {
        fab.put_pick(SegmentChoiceArrangementPick {
            id: PickId(0),
            segment_id: fab.segment_id(),
            segment_choice_arrangement_id: arrangement.id,
            program_sequence_pattern_event_id: None,
            instrument_audio_id: audio.id,
            segment_chord_voicing_id: None,
            start_at_segment_micros: 0,
            length_micros: Some(duration),
            amplitude: 1.0,
            tones: "X".into(),
            event: audio.event.clone(),
        })?;
    }
    Ok(())
}

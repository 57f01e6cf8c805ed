// Transition stage: swells and hits that mark the form.
//
// The Transition instrument's intensity-layered audios are sorted by event
// name into large, medium and small sets (template lists, matched without
// regard to case). Large ones sound at the start of a segment that begins a
// new macro program (or the chain), medium ones at the start of a new main
// program. Small ones sound at every bar subsection of the segment, and at
// its start unless the segment merely continues the previous one.

use super::*;
use fabrica_music::Bar;

pub fn craft(fab: &mut Fabricator<'_>) -> Result<()> {
    let (instrument, continued) = continued_or_fresh_instrument(fab, InstrumentType::Transition)?;
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

    let audios = select_general_audio_intensity_layers(fab, instrument)?;
    let config = fab.config();
    let large = audios_named(&audios, &config.event_names_large);
    let medium = audios_named(&audios, &config.event_names_medium);
    let small = audios_named(&audios, &config.event_names_small);

    let segment = fab.segment()?;
    let bar_beats = fab
        .current_choice_of_type(ProgramType::Main)
        .and_then(|c| c.program_id)
        .and_then(|id| fab.content().program(id))
        .map(|p| p.config.bar_beats)
        .unwrap_or(4);
    let segment_type = fab.segment_type();

    let mut hits: Vec<(f64, &InstrumentAudio)> = Vec::new();
    if matches!(segment_type, SegmentType::Initial | SegmentType::NextMacro) {
        hits.extend(large.iter().map(|a| (0.0, *a)));
    }
    if segment_type == SegmentType::NextMain {
        hits.extend(medium.iter().map(|a| (0.0, *a)));
    }
    if segment_type != SegmentType::Continue {
        hits.extend(small.iter().map(|a| (0.0, *a)));
    }
    let step = Bar::of(bar_beats).subsection_beats(segment.total);
    if step > 0 {
        let mut position = step;
        while position < segment.total {
            hits.extend(small.iter().map(|a| (position as f64, *a)));
            position += step;
        }
    }

    for (position, audio) in hits {
        fab.put_pick(SegmentChoiceArrangementPick {
            id: PickId(0),
            segment_id: fab.segment_id(),
            segment_choice_arrangement_id: arrangement.id,
            program_sequence_pattern_event_id: None,
            instrument_audio_id: audio.id,
            segment_chord_voicing_id: None,
            start_at_segment_micros: segment_micros_at_position(segment.tempo, position),
            length_micros: Some((audio.length_seconds * 1_000_000.0) as i64),
            amplitude: 1.0,
            tones: "X".into(),
            event: audio.event.clone(),
        })?;
    }
    Ok(())
}

fn audios_named<'a>(audios: &[&'a InstrumentAudio], names: &[String]) -> Vec<&'a InstrumentAudio> {
    audios
        .iter()
        .copied()
        .filter(|a| names.iter().any(|n| n.eq_ignore_ascii_case(&a.event)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabricator::FabricatorOverrides;
    use crate::ids::SegmentId;
    use crate::test_fixtures::Fixtures;
    use fabrica_prng::FabRng;

    #[test]
    fn initial_segment_gets_large_and_small_hits() {
        let fx = Fixtures::new(71);
        let mut store = fx.store_with_planned_segment();
        let mut rng = FabRng::new(71);
        let mut fab =
            Fabricator::new(&mut store, &fx.content, &mut rng, SegmentId(0), FabricatorOverrides::default())
                .unwrap();
        super::super::macro_main::craft(&mut fab).unwrap();
        craft(&mut fab).unwrap();

        let choice = fab
            .choices()
            .into_iter()
            .find(|c| c.instrument_type == Some(InstrumentType::Transition))
            .unwrap();
        let mut hits: Vec<(i64, String)> = fab
            .picks_of_choice(choice.id)
            .into_iter()
            .map(|p| (p.start_at_segment_micros, p.event))
            .collect();
        hits.sort();
        // Sixteen beats of 4/4 subdivide at beat 8 (4 seconds at 120 BPM).
        assert_eq!(
            hits,
            vec![
                (0, "BIG".to_string()),
                (0, "SMALL".to_string()),
                (4_000_000, "SMALL".to_string()),
            ]
        );
    }
}

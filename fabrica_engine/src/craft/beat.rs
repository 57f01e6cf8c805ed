// Beat stage: rhythm from a Beat program's drum voices.
//
// A Continue segment keeps the Beat program already playing in the lineage;
// otherwise a fresh Beat program with at least one Drum voice is chosen. One
// sequence of it is arranged across the whole segment, every voice on a drum
// instrument whose audios cover the voice's track names. Beat events carry
// no harmony, so tones without a chord voicing play as "X".
//
// Delta arcs are planned per voice name, so kick and snare can enter at
// different points of the main program.

use super::*;
use crate::delta_arc::{self, DeltaArcPlan};

pub fn craft(fab: &mut Fabricator<'_>) -> Result<()> {
    let content = fab.content();
    let continued_program = fab
        .choice_if_continued_by_program_type(ProgramType::Beat)
        .and_then(|c| c.program_id)
        .and_then(|id| content.program(id));
    let program = match continued_program {
        Some(program) => Some(program),
        None => choose_fresh_program(fab, ProgramType::Beat, Some(InstrumentType::Drum))?,
    };
    let Some(program) = program else {
        fab.add_warning_message("No beat program available")?;
        return Ok(());
    };

    let Some(sequence) = fab.randomly_selected_sequence(program.id) else {
        fab.add_warning_message(format!("Beat program {} has no sequences", program.name))?;
        return Ok(());
    };
    let voices = content.voices_of_program(program.id);
    let layers: Vec<String> = voices.iter().map(|v| v.name.clone()).collect();

    let segment = fab.segment()?;
    let config = fab.config().clone();
    let history = fab.retrospective().choices().to_vec();
    let plan = DeltaArcPlan {
        enabled: config.delta_arc_enabled,
        segment_type: fab.segment_type(),
        total: segment.total,
        bar_beats: program.config.bar_beats,
        layers: &layers,
        prioritize: &config.delta_arc_beat_layers_to_prioritize,
        incoming: config.delta_arc_beat_layers_incoming,
    };
    let arcs = delta_arc::precompute(
        &plan,
        &history,
        |choice| {
            if choice.program_type != Some(ProgramType::Beat) {
                return None;
            }
            choice
                .program_voice_id
                .and_then(|id| content.voice(id))
                .map(|v| v.name.clone())
        },
        fab.rng(),
    );

    let plan = NoteEventPlan {
        tempo: segment.tempo,
        sequence,
        arcs: &arcs,
        default_atonal: true,
    };
    craft_note_events(
        fab,
        &plan,
        &voices,
        |fab, voice| choose_fresh_instrument(fab, InstrumentType::Drum, &content.track_names_of_voice(voice.id)),
        |voice| voice.name.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabricator::FabricatorOverrides;
    use crate::ids::SegmentId;
    use crate::test_fixtures::Fixtures;
    use fabrica_prng::FabRng;

    #[test]
    fn beat_arranges_kick_and_snare_on_the_drum_kit() {
        let fx = Fixtures::new(41);
        let mut store = fx.store_with_planned_segment();
        let mut rng = FabRng::new(41);
        let mut fab =
            Fabricator::new(&mut store, &fx.content, &mut rng, SegmentId(0), FabricatorOverrides::default())
                .unwrap();
        super::super::macro_main::craft(&mut fab).unwrap();
        craft(&mut fab).unwrap();

        let beat_choices: Vec<SegmentChoice> = fab
            .choices()
            .into_iter()
            .filter(|c| c.program_type == Some(ProgramType::Beat))
            .collect();
        assert_eq!(beat_choices.len(), 2);
        for choice in &beat_choices {
            assert_eq!(choice.program_id, Some(fx.beat_program));
            assert_eq!(choice.instrument_id, Some(fx.drum_instrument));
            assert_eq!(choice.instrument_mode, Some(InstrumentMode::Event));
            let picks = fab.picks_of_choice(choice.id);
            // A four-beat pattern with two hits, tiled over sixteen beats.
            assert_eq!(picks.len(), 8);
            assert!(picks.iter().all(|p| p.tones == "X"));
        }
    }

    #[test]
    fn beat_without_program_only_warns() {
        let fx = Fixtures::new(42);
        let mut content = ContentStore::new();
        for program in fx.content.programs().filter(|p| p.program_type != ProgramType::Beat) {
            content.put_program(program.clone());
        }
        let mut store = fx.store_with_planned_segment();
        let mut rng = FabRng::new(42);
        let mut fab =
            Fabricator::new(&mut store, &content, &mut rng, SegmentId(0), FabricatorOverrides::default()).unwrap();
        craft(&mut fab).unwrap();
        assert!(fab.choices().is_empty());
        assert!(fab
            .messages()
            .iter()
            .any(|m| m.message_type == SegmentMessageType::Warning));
    }
}

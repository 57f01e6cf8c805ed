// Macro/Main stage: the segment's form, tempo, key, length and harmony.
//
// Chooses the macro program (the large-scale arc) and the main program (the
// harmonic content) together with one sequence binding of each, then writes
// everything later stages depend on: segment type, tempo, key, total beats,
// duration, delta, intensity, and the main sequence's chords and voicings.
//
// Both choices are forced into the segment; fabrication cannot go on
// without them. Their memes are still added one at a time without force, so
// a conflicting meme is dropped rather than stacked.
//
// With a memes override the override memes are committed first and the main
// program is chosen before the macro, so the main program is the one that
// has to agree with the override.

use super::*;
use crate::error::FabricationError;
use crate::ids::ProgramId;
use crate::meme::MemeIsometry;
use fabrica_music::Chord;
use tracing::debug;

pub fn craft(fab: &mut Fabricator<'_>) -> Result<()> {
    let (macro_sequence, main_sequence) = match fab.overrides().memes.clone() {
        Some(memes) => {
            for meme in &memes {
                fab.put_meme(meme, true)?;
            }
            let main = do_main_choice_work(fab)?;
            let macro_ = do_macro_choice_work(fab)?;
            (macro_, main)
        }
        None => {
            let macro_ = do_macro_choice_work(fab)?;
            let main = do_main_choice_work(fab)?;
            (macro_, main)
        }
    };

    let content = fab.content();
    let main_program = content.program(main_sequence.program_id).ok_or_else(|| {
        FabricationError::content(format!("Unable to determine main program for segment {}", fab.segment_id()))
    })?;

    for chord in fab.program_sequence_chords(main_sequence.id) {
        if chord.position >= main_sequence.total as f64 {
            continue;
        }
        let segment_chord = fab.put_chord(&Chord::of(&chord.name).name, chord.position)?;
        for voicing in content.voicings_of_chord(chord.id) {
            fab.put_chord_voicing(&segment_chord, voicing.instrument_type, &voicing.notes)?;
        }
    }

    let segment_type = fab.segment_type();
    let mut segment = fab.segment()?;
    segment.segment_type = segment_type;
    segment.tempo = main_program.tempo;
    segment.key = segment_key(main_sequence, main_program);
    segment.total = main_sequence.total;
    segment.duration_micros = Some(segment_micros_at_position(main_program.tempo, main_sequence.total as f64));
    segment.delta = match (segment_type, fab.retrospective().previous_segment()) {
        (SegmentType::Continue, Some(previous)) => previous.delta + previous.total as i32,
        _ => 0,
    };
    segment.intensity = segment_intensity(fab, segment.delta, Some(macro_sequence), Some(main_sequence))?;
    debug!(
        segment_id = segment.id.0,
        segment_type = ?segment.segment_type,
        tempo = segment.tempo,
        key = %segment.key,
        total = segment.total,
        delta = segment.delta,
        "macro-main crafted"
    );
    fab.update_segment(segment)?;
    Ok(())
}

fn do_macro_choice_work<'a>(fab: &mut Fabricator<'a>) -> Result<&'a ProgramSequence> {
    let program = choose_macro_program(fab)?;
    let offset = macro_sequence_binding_offset(fab, program.id);
    do_choice_work(fab, program, offset, ProgramType::Macro)
}

fn do_main_choice_work<'a>(fab: &mut Fabricator<'a>) -> Result<&'a ProgramSequence> {
    let program = choose_main_program(fab)?;
    let offset = main_sequence_binding_offset(fab);
    do_choice_work(fab, program, offset, ProgramType::Main)
}

fn do_choice_work<'a>(
    fab: &mut Fabricator<'a>,
    program: &'a Program,
    offset: i32,
    program_type: ProgramType,
) -> Result<&'a ProgramSequence> {
    let content = fab.content();
    let binding = fab
        .randomly_selected_sequence_binding_at_offset(program.id, offset)
        .ok_or_else(|| {
            FabricationError::content(format!(
                "Unable to determine {program_type:?} sequence binding of {} for segment {}",
                program.name,
                fab.segment_id()
            ))
        })?;
    let sequence = content.sequence_of_binding(binding).ok_or_else(|| {
        FabricationError::content(format!(
            "Unable to determine {program_type:?} sequence of {} for segment {}",
            program.name,
            fab.segment_id()
        ))
    })?;

    let mut choice = SegmentChoice::new(fab.segment_id());
    choice.program_id = Some(program.id);
    choice.program_type = Some(program_type);
    choice.program_sequence_id = Some(sequence.id);
    choice.program_sequence_binding_id = Some(binding.id);
    fab.put_choice(choice, true)?;
    Ok(sequence)
}

// ---------------------------------------------------------------------------
// Program selection
// ---------------------------------------------------------------------------

fn choose_macro_program<'a>(fab: &mut Fabricator<'a>) -> Result<&'a Program> {
    let content = fab.content();
    if let Some(id) = fab.overrides().macro_program {
        return content
            .program(id)
            .ok_or_else(|| FabricationError::content(format!("Override macro program {id} not found")));
    }
    let candidates = content.programs_of_type(ProgramType::Macro);
    if fab.is_initial_segment() {
        return choose_random_program(fab, &candidates, None);
    }

    let previous = fab.previous_macro_choice();
    if fab.is_continuation_of_macro_program()
        && let Some(previous) = &previous
    {
        return previous
            .program_id
            .and_then(|id| content.program(id))
            .ok_or_else(|| {
                FabricationError::content(format!(
                    "Unable to get previous macro program for segment {}",
                    fab.segment_id()
                ))
            });
    }

    let isometry = match &fab.overrides().memes {
        Some(memes) => MemeIsometry::of(fab.config().meme_taxonomy.clone(), memes),
        None => fab.meme_isometry_of_next_sequence_in_previous_macro(),
    };
    let avoid = previous.and_then(|c| c.program_id);
    let mut bag = SelectionBag::new();
    for program in &candidates {
        let score = isometry.score(&content.memes_at_beginning(program.id)) as u64;
        let avoided = avoid == Some(program.id);
        if fab.is_directly_bound_program(program) {
            if !avoided {
                bag.add(1, program.id, score);
                bag.add(2, program.id, 1 + score);
            }
            bag.add(3, program.id, 1);
        }
        if program.state == ContentState::Published {
            if !avoided {
                bag.add(4, program.id, score);
                bag.add(5, program.id, 1 + score);
            }
            bag.add(6, program.id, 1);
        }
        bag.add(7, program.id, 1);
    }
    pick_program(fab, bag, "macroChoice")
}

fn choose_main_program<'a>(fab: &mut Fabricator<'a>) -> Result<&'a Program> {
    let content = fab.content();
    let previous = fab.previous_main_choice();
    if fab.segment_type() == SegmentType::Continue
        && let Some(previous) = &previous
    {
        return previous
            .program_id
            .and_then(|id| content.program(id))
            .ok_or_else(|| {
                FabricationError::content(format!(
                    "Unable to get previous main program for segment {}",
                    fab.segment_id()
                ))
            });
    }

    let isometry = fab.meme_isometry_of_segment();
    let avoid = previous.and_then(|c| c.program_id);
    let mut bag = SelectionBag::new();
    for program in content.programs_of_type(ProgramType::Main) {
        let memes = content.memes_at_beginning(program.id);
        if isometry.is_allowed(&memes) {
            let quantity = 1 + isometry.score(&memes) as u64;
            let avoided = avoid == Some(program.id);
            if fab.is_directly_bound_program(program) && !avoided {
                bag.add(1, program.id, quantity);
            }
            if program.state == ContentState::Published {
                bag.add(if avoided { 3 } else { 2 }, program.id, quantity);
            }
        }
        bag.add(4, program.id, 1);
    }
    pick_program(fab, bag, "mainChoice")
}

/// Uniform choice preferring bound over published content and avoiding
/// `avoid` where anything else is available.
fn choose_random_program<'a>(
    fab: &mut Fabricator<'a>,
    candidates: &[&'a Program],
    avoid: Option<ProgramId>,
) -> Result<&'a Program> {
    let mut bag = SelectionBag::new();
    for program in candidates {
        let avoided = avoid == Some(program.id);
        if fab.is_directly_bound_program(program) {
            if !avoided {
                bag.add(1, program.id, 1);
            }
            bag.add(2, program.id, 1);
        }
        if program.state == ContentState::Published {
            if !avoided {
                bag.add(3, program.id, 1);
            }
            bag.add(4, program.id, 1);
        }
        bag.add(5, program.id, 1);
    }
    pick_program(fab, bag, "randomChoice")
}

fn pick_program<'a>(fab: &mut Fabricator<'a>, bag: SelectionBag<ProgramId>, report: &str) -> Result<&'a Program> {
    if bag.is_empty() {
        return Err(FabricationError::content(format!(
            "Failed to choose any program for {report}; no candidates available"
        )));
    }
    fab.put_report(report, format!("{bag:?}"))?;
    let id = bag.pick(fab.rng())?;
    fab.content()
        .program(id)
        .ok_or_else(|| FabricationError::content(format!("Chosen program {id} not found")))
}

// ---------------------------------------------------------------------------
// Offsets, key, intensity
// ---------------------------------------------------------------------------

fn macro_sequence_binding_offset(fab: &Fabricator<'_>, program_id: ProgramId) -> i32 {
    match fab.segment_type() {
        SegmentType::Initial | SegmentType::NextMacro => {
            if fab.overrides().macro_program.is_some() {
                fab.second_macro_sequence_binding_offset(program_id)
            } else {
                0
            }
        }
        SegmentType::Continue => fab
            .retrospective()
            .previous_choice_of_type(ProgramType::Macro)
            .map(|c| fab.sequence_binding_offset(c))
            .unwrap_or(0),
        SegmentType::NextMain => fab
            .retrospective()
            .previous_choice_of_type(ProgramType::Macro)
            .map(|c| fab.next_sequence_binding_offset(c))
            .unwrap_or(0),
        SegmentType::Pending => 0,
    }
}

fn main_sequence_binding_offset(fab: &Fabricator<'_>) -> i32 {
    match fab.segment_type() {
        SegmentType::Continue => fab
            .retrospective()
            .previous_choice_of_type(ProgramType::Main)
            .map(|c| fab.next_sequence_binding_offset(c))
            .unwrap_or(0),
        _ => 0,
    }
}

/// The main sequence's key, else its program's, normalized as a chord name.
fn segment_key(sequence: &ProgramSequence, program: &Program) -> String {
    let key = if sequence.key.trim().is_empty() {
        &program.key
    } else {
        &sequence.key
    };
    Chord::of(key).name.trim().to_string()
}

/// Mean of the macro and main sequence intensities (or whichever exists),
/// ramped by the auto-crescendo across `mainProgramLengthMaxDelta` beats.
fn segment_intensity(
    fab: &Fabricator<'_>,
    delta: i32,
    macro_sequence: Option<&ProgramSequence>,
    main_sequence: Option<&ProgramSequence>,
) -> Result<f64> {
    let base = match (
        macro_sequence.and_then(|s| s.intensity),
        main_sequence.and_then(|s| s.intensity),
    ) {
        (Some(a), Some(b)) => (a + b) / 2.0,
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => return Err(FabricationError::content("Failed to compute intensity")),
    };
    let config = fab.config();
    if !config.intensity_auto_crescendo_enabled || config.main_program_length_max_delta <= 0 {
        return Ok(base);
    }
    let ratio = delta as f64 / config.main_program_length_max_delta as f64;
    let low = config.intensity_auto_crescendo_minimum;
    let high = config.intensity_auto_crescendo_maximum;
    Ok(floor_hundredths(low + (high - low) * ratio * base))
}

fn floor_hundredths(value: f64) -> f64 {
    (value * 100.0).floor() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabricator::FabricatorOverrides;
    use crate::ids::SegmentId;
    use crate::test_fixtures::Fixtures;
    use fabrica_prng::FabRng;

    #[test]
    fn initial_segment_gets_one_macro_and_one_main_choice() {
        for seed in 0..10 {
            let fx = Fixtures::new(seed);
            let mut store = fx.store_with_planned_segment();
            let mut rng = FabRng::new(seed);
            let mut fab =
                Fabricator::new(&mut store, &fx.content, &mut rng, SegmentId(0), FabricatorOverrides::default())
                    .unwrap();
            craft(&mut fab).unwrap();

            let choices = fab.choices();
            let count = |t| choices.iter().filter(|c| c.program_type == Some(t)).count();
            assert_eq!(count(ProgramType::Macro), 1);
            assert_eq!(count(ProgramType::Main), 1);
            assert!(fab.meme_stack().is_valid(), "memes {:?}", fab.memes());

            let segment = fab.segment().unwrap();
            assert_eq!(segment.segment_type, SegmentType::Initial);
            assert_eq!(segment.total, 16);
            assert_eq!(segment.tempo, 120.0);
            assert_eq!(segment.duration_micros, Some(8_000_000));
            assert_eq!(segment.delta, 0);
            assert!(!fab.chords().is_empty());
        }
    }

    #[test]
    fn winter_main_writes_chords_and_voicings() {
        let fx = Fixtures::new(31);
        let mut store = fx.store_with_planned_segment();
        let mut rng = FabRng::new(31);
        let overrides = FabricatorOverrides {
            memes: Some(["WINTER".to_string()].into()),
            ..Default::default()
        };
        let mut fab = Fabricator::new(&mut store, &fx.content, &mut rng, SegmentId(0), overrides).unwrap();
        craft(&mut fab).unwrap();

        let main = fab.current_choice_of_type(ProgramType::Main).unwrap();
        assert_eq!(main.program_id, Some(fx.main_program));
        let names: Vec<String> = fab.chords().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["C", "G"]);
        assert_eq!(fab.chord_voicings().len(), 4);
        assert_eq!(fab.segment().unwrap().key, "C");
        assert!(fab.memes().contains("WINTER"));
    }

    #[test]
    fn override_macro_program_starts_at_second_offset() {
        let fx = Fixtures::new(32);
        let mut store = fx.store_with_planned_segment();
        let mut rng = FabRng::new(32);
        let overrides = FabricatorOverrides {
            macro_program: Some(fx.macro_program),
            ..Default::default()
        };
        let mut fab = Fabricator::new(&mut store, &fx.content, &mut rng, SegmentId(0), overrides).unwrap();
        craft(&mut fab).unwrap();
        let macro_choice = fab.current_choice_of_type(ProgramType::Macro).unwrap();
        assert_eq!(fab.sequence_binding_offset(&macro_choice), 1);
    }

    #[test]
    fn intensity_averages_and_ramps() {
        let fx = Fixtures::new(33);
        let mut store = fx.store_with_planned_segment();
        let mut rng = FabRng::new(33);
        let fab =
            Fabricator::new(&mut store, &fx.content, &mut rng, SegmentId(0), FabricatorOverrides::default())
                .unwrap();
        let sequence = |intensity: Option<f64>| ProgramSequence {
            id: crate::ids::ProgramSequenceId::new(&mut FabRng::new(1)),
            program_id: fx.main_program,
            name: "s".into(),
            key: String::new(),
            total: 16,
            intensity,
        };
        let low = sequence(Some(0.4));
        let high = sequence(Some(0.8));
        let none = sequence(None);
        // Default crescendo: 0.2 + 0.6 * (140 / 280) * 0.6 = 0.38
        assert_eq!(segment_intensity(&fab, 140, Some(&low), Some(&high)).unwrap(), 0.38);
        assert_eq!(segment_intensity(&fab, 0, None, Some(&high)).unwrap(), 0.2);
        assert!(segment_intensity(&fab, 0, Some(&none), None).is_err());
        assert_eq!(floor_hundredths(0.4199), 0.41);
    }

    #[test]
    fn key_falls_back_to_program() {
        let fx = Fixtures::new(34);
        let program = fx.content.program(fx.main_program).unwrap();
        let mut sequence = fx.content.sequences_of_program(fx.main_program)[0].clone();
        sequence.key = " ".into();
        assert_eq!(segment_key(&sequence, program), "C");
        sequence.key = "Ebm".into();
        assert_eq!(segment_key(&sequence, program), "Ebm");
    }
}

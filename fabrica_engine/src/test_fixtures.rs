// Shared content library and chain fixtures for unit tests.
//
// One library bound to one template, holding just enough content to run
// every craft stage end to end: a three-offset macro program, two main
// programs (WINTER and SUMMER), a two-voice beat program, a bass detail
// program and one instrument per mode. Ids are drawn from a seeded `FabRng`
// so fixtures built with the same seed are identical.

use crate::config::InstrumentConfig;
use crate::content::*;
use crate::entities::*;
use crate::ids::*;
use crate::store::SegmentStore;
use fabrica_prng::FabRng;

/// Route `tracing` output to the test harness, filtered by `RUST_LOG`.
/// Safe to call from every test; only the first call installs.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Fixtures {
    pub content: ContentStore,
    pub library: LibraryId,
    pub template: TemplateId,
    pub macro_program: ProgramId,
    pub main_program: ProgramId,
    pub summer_main_program: ProgramId,
    pub beat_program: ProgramId,
    pub detail_program: ProgramId,
    pub bass_event: ProgramSequencePatternEventId,
    pub drum_instrument: InstrumentId,
    pub bass_instrument: InstrumentId,
    pub pad_instrument: InstrumentId,
    pub percussion_instrument: InstrumentId,
    pub background_instrument: InstrumentId,
    pub transition_instrument: InstrumentId,
    rng: FabRng,
}

impl Fixtures {
    pub fn new(seed: u64) -> Self {
        init_test_logging();
        let mut rng = FabRng::new(seed);
        let library = LibraryId::new(&mut rng);
        let template = TemplateId::new(&mut rng);
        let mut fx = Fixtures {
            content: ContentStore::new(),
            library,
            template,
            macro_program: ProgramId::new(&mut rng),
            main_program: ProgramId::new(&mut rng),
            summer_main_program: ProgramId::new(&mut rng),
            beat_program: ProgramId::new(&mut rng),
            detail_program: ProgramId::new(&mut rng),
            bass_event: ProgramSequencePatternEventId::new(&mut rng),
            drum_instrument: InstrumentId::new(&mut rng),
            bass_instrument: InstrumentId::new(&mut rng),
            pad_instrument: InstrumentId::new(&mut rng),
            percussion_instrument: InstrumentId::new(&mut rng),
            background_instrument: InstrumentId::new(&mut rng),
            transition_instrument: InstrumentId::new(&mut rng),
            rng,
        };
        fx.content.put_library(Library {
            id: library,
            name: "Fixtures".into(),
        });
        fx.content.put_template(Template {
            id: template,
            name: "Fixture Template".into(),
            ship_key: "test-chain".into(),
            config: String::new(),
        });
        let binding_id = TemplateBindingId::new(&mut fx.rng);
        fx.content.put_template_binding(TemplateBinding {
            id: binding_id,
            template_id: template,
            content_type: TemplateBindingType::Library,
            target_id: library.0,
        });
        fx.add_macro_program();
        fx.add_main_programs();
        fx.add_beat_program();
        fx.add_detail_program();
        fx.add_instruments();
        fx
    }

    pub fn chain(&self) -> Chain {
        Chain {
            id: ChainId(1),
            name: "Test Chain".into(),
            template_id: Some(self.template),
            template_config: String::new(),
            ship_key: "test-chain".into(),
            state: ChainState::Fabricate,
        }
    }

    pub fn planned_segment(&self, id: u32) -> Segment {
        Segment {
            id: SegmentId(id),
            chain_id: ChainId(1),
            segment_type: SegmentType::Pending,
            state: SegmentState::Planned,
            delta: 0,
            total: 0,
            tempo: 0.0,
            key: String::new(),
            intensity: 0.0,
            begin_at_chain_micros: 0,
            duration_micros: None,
            storage_key: String::new(),
            created_at_micros: 0,
            updated_at_micros: 0,
        }
    }

    /// A store holding the fixture chain and a planned segment 0.
    pub fn store_with_planned_segment(&self) -> SegmentStore {
        let mut store = SegmentStore::new();
        store.put_chain(self.chain());
        store
            .put_segment(self.planned_segment(0))
            .expect("planned segment is valid");
        store
    }

    // -----------------------------------------------------------------------
    // Builders
    // -----------------------------------------------------------------------

    fn program(&mut self, id: ProgramId, name: &str, program_type: ProgramType, key: &str) {
        self.content.put_program(Program {
            id,
            library_id: self.library,
            name: name.into(),
            program_type,
            state: ContentState::Published,
            key: key.into(),
            tempo: 120.0,
            config: Default::default(),
        });
    }

    fn program_meme(&mut self, program_id: ProgramId, name: &str) {
        let id = ProgramMemeId::new(&mut self.rng);
        self.content.put_program_meme(ProgramMeme {
            id,
            program_id,
            name: name.into(),
        });
    }

    fn sequence(&mut self, program_id: ProgramId, name: &str, total: u32, key: &str, intensity: f64) -> ProgramSequenceId {
        let id = ProgramSequenceId::new(&mut self.rng);
        self.content.put_sequence(ProgramSequence {
            id,
            program_id,
            name: name.into(),
            key: key.into(),
            total,
            intensity: Some(intensity),
        });
        id
    }

    fn binding(&mut self, program_id: ProgramId, sequence_id: ProgramSequenceId, offset: i32) -> ProgramSequenceBindingId {
        let id = ProgramSequenceBindingId::new(&mut self.rng);
        self.content.put_binding(ProgramSequenceBinding {
            id,
            program_id,
            program_sequence_id: sequence_id,
            offset,
        });
        id
    }

    fn chord(&mut self, program_id: ProgramId, sequence_id: ProgramSequenceId, name: &str, position: f64, voicings: &[(InstrumentType, &str)]) {
        let chord_id = ProgramSequenceChordId::new(&mut self.rng);
        self.content.put_chord(ProgramSequenceChord {
            id: chord_id,
            program_id,
            program_sequence_id: sequence_id,
            name: name.into(),
            position,
        });
        for (instrument_type, notes) in voicings {
            let id = ProgramSequenceChordVoicingId::new(&mut self.rng);
            self.content.put_voicing(ProgramSequenceChordVoicing {
                id,
                program_id,
                program_sequence_chord_id: chord_id,
                instrument_type: *instrument_type,
                notes: (*notes).into(),
            });
        }
    }

    fn voice(&mut self, program_id: ProgramId, instrument_type: InstrumentType, name: &str, track: &str) -> (ProgramVoiceId, ProgramVoiceTrackId) {
        let voice_id = ProgramVoiceId::new(&mut self.rng);
        self.content.put_voice(ProgramVoice {
            id: voice_id,
            program_id,
            instrument_type,
            name: name.into(),
            order: 0.0,
        });
        let track_id = ProgramVoiceTrackId::new(&mut self.rng);
        self.content.put_track(ProgramVoiceTrack {
            id: track_id,
            program_id,
            program_voice_id: voice_id,
            name: track.into(),
            order: 0.0,
        });
        (voice_id, track_id)
    }

    fn pattern(&mut self, program_id: ProgramId, sequence_id: ProgramSequenceId, voice_id: ProgramVoiceId, total: u32) -> ProgramSequencePatternId {
        let id = ProgramSequencePatternId::new(&mut self.rng);
        self.content.put_pattern(ProgramSequencePattern {
            id,
            program_id,
            program_sequence_id: sequence_id,
            program_voice_id: voice_id,
            name: "pattern".into(),
            total,
        });
        id
    }

    fn event(&mut self, id: ProgramSequencePatternEventId, program_id: ProgramId, pattern_id: ProgramSequencePatternId, track_id: ProgramVoiceTrackId, position: f64, duration: f64, tones: &str) {
        self.content.put_event(ProgramSequencePatternEvent {
            id,
            program_id,
            program_sequence_pattern_id: pattern_id,
            program_voice_track_id: track_id,
            position,
            duration,
            velocity: 1.0,
            tones: tones.into(),
        });
    }

    fn instrument(&mut self, id: InstrumentId, name: &str, instrument_type: InstrumentType, mode: InstrumentMode, config: InstrumentConfig) {
        self.content.put_instrument(Instrument {
            id,
            library_id: self.library,
            name: name.into(),
            instrument_type,
            mode,
            state: ContentState::Published,
            volume: 1.0,
            config,
        });
    }

    fn audio(&mut self, instrument_id: InstrumentId, event: &str, tones: &str, length_seconds: f64, loop_beats: f64) {
        let id = InstrumentAudioId::new(&mut self.rng);
        self.content.put_audio(InstrumentAudio {
            id,
            instrument_id,
            name: format!("{event} {tones}"),
            event: event.into(),
            tones: tones.into(),
            intensity: 0.5,
            length_seconds,
            loop_beats,
            volume: 1.0,
        });
    }

    // -----------------------------------------------------------------------
    // Library content
    // -----------------------------------------------------------------------

    fn add_macro_program(&mut self) {
        let program = self.macro_program;
        self.program(program, "Seasons Macro", ProgramType::Macro, "C");
        self.program_meme(program, "Cozy");
        for offset in 0..3 {
            let sequence = self.sequence(program, &format!("macro {offset}"), 0, "C", 0.4);
            self.binding(program, sequence, offset);
        }
    }

    fn add_main_programs(&mut self) {
        use InstrumentType::*;
        let program = self.main_program;
        self.program(program, "Winter Main", ProgramType::Main, "C");
        self.program_meme(program, "Winter");
        let sequence = self.sequence(program, "verse", 16, "C", 0.6);
        self.chord(program, sequence, "C", 0.0, &[(Bass, "C2,E2,G2"), (Pad, "C4,E4,G4")]);
        self.chord(program, sequence, "G", 8.0, &[(Bass, "G1,B1,D2"), (Pad, "G3,B3,D4")]);
        self.binding(program, sequence, 0);
        self.binding(program, sequence, 1);

        let program = self.summer_main_program;
        self.program(program, "Summer Main", ProgramType::Main, "G");
        self.program_meme(program, "Summer");
        let sequence = self.sequence(program, "chorus", 16, "G", 0.7);
        self.chord(program, sequence, "G", 0.0, &[(Pad, "G3,B3,D4")]);
        self.binding(program, sequence, 0);
    }

    fn add_beat_program(&mut self) {
        let program = self.beat_program;
        self.program(program, "Basic Beat", ProgramType::Beat, "");
        let sequence = self.sequence(program, "beat", 16, "", 0.5);
        let (kick, kick_track) = self.voice(program, InstrumentType::Drum, "Kick", "KICK");
        let (snare, snare_track) = self.voice(program, InstrumentType::Drum, "Snare", "SNARE");
        let kick_pattern = self.pattern(program, sequence, kick, 4);
        for position in [0.0, 2.0] {
            let id = ProgramSequencePatternEventId::new(&mut self.rng);
            self.event(id, program, kick_pattern, kick_track, position, 0.5, "X");
        }
        let snare_pattern = self.pattern(program, sequence, snare, 4);
        for position in [1.0, 3.0] {
            let id = ProgramSequencePatternEventId::new(&mut self.rng);
            self.event(id, program, snare_pattern, snare_track, position, 0.5, "X");
        }
    }

    fn add_detail_program(&mut self) {
        let program = self.detail_program;
        self.program(program, "Walking Bass", ProgramType::Detail, "C");
        let sequence = self.sequence(program, "bass", 16, "C", 0.5);
        let (voice, track) = self.voice(program, InstrumentType::Bass, "Bass", "BASS");
        let pattern = self.pattern(program, sequence, voice, 4);
        let first = self.bass_event;
        self.event(first, program, pattern, track, 0.0, 2.0, "C2");
        let second = ProgramSequencePatternEventId::new(&mut self.rng);
        self.event(second, program, pattern, track, 2.0, 2.0, "G2");
    }

    fn add_instruments(&mut self) {
        use InstrumentMode::*;
        use InstrumentType::*;
        let one_shot = InstrumentConfig {
            is_one_shot: true,
            ..Default::default()
        };
        let drum = self.drum_instrument;
        self.instrument(drum, "Drum Kit", Drum, Event, one_shot);
        self.audio(drum, "KICK", "X", 0.5, 0.0);
        self.audio(drum, "SNARE", "X", 0.5, 0.0);

        let tonal = InstrumentConfig {
            is_tonal: true,
            ..Default::default()
        };
        let bass = self.bass_instrument;
        self.instrument(bass, "Bass Synth", Bass, Event, tonal.clone());
        for tones in ["C2", "E2", "G2", "B1", "D2", "G1"] {
            self.audio(bass, "BASS", tones, 1.0, 0.0);
        }

        let pad = self.pad_instrument;
        self.instrument(pad, "Warm Pad", Pad, Chord, tonal);
        self.audio(pad, "PAD", "C", 4.0, 0.0);
        self.audio(pad, "PAD", "G", 4.0, 0.0);

        let percussion = self.percussion_instrument;
        self.instrument(percussion, "Shaker Loop", Percussion, Loop, InstrumentConfig::default());
        self.audio(percussion, "LOOP", "X", 2.0, 4.0);

        let background = self.background_instrument;
        self.instrument(background, "Room Tone", Background, Event, InstrumentConfig::default());
        self.audio(background, "AMBIENCE", "X", 30.0, 0.0);

        let transition = self.transition_instrument;
        self.instrument(transition, "Swells", Transition, Event, InstrumentConfig::default());
        self.audio(transition, "BIG", "X", 2.0, 0.0);
        self.audio(transition, "MEDIUM", "X", 1.0, 0.0);
        self.audio(transition, "SMALL", "X", 0.5, 0.0);
    }
}

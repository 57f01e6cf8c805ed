// Read-only source content: the library of programs and instruments that
// fabrication chooses from.
//
// `ContentStore` owns every content record in a `BTreeMap` keyed by id and
// keeps parent-to-children indexes so the per-event lookups made by the craft
// stages (events of a pattern, audios of an instrument, voicings of a chord,
// bindings of a program) never scan a whole table. Indexes are maintained by
// the `put_*` methods; nothing else mutates the store, and fabrication only
// ever holds a shared reference, so one store can back any number of chains.
//
// A store is usually loaded from a JSON document (`ContentStore::from_json`)
// with one array per entity kind, camelCase keys:
// `{"programs": [...], "programSequences": [...], "instrumentAudios": [...]}`.
//
// See also: `entities.rs` for the record types, `fabricator.rs` which resolves
// the chain's template bindings against this store.

pub mod entities;

pub use entities::*;

use crate::error::Result;
use crate::ids::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Serialized form of a whole content library.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContentDocument {
    pub libraries: Vec<Library>,
    pub templates: Vec<Template>,
    pub template_bindings: Vec<TemplateBinding>,
    pub programs: Vec<Program>,
    pub program_memes: Vec<ProgramMeme>,
    pub program_sequences: Vec<ProgramSequence>,
    pub program_sequence_bindings: Vec<ProgramSequenceBinding>,
    pub program_sequence_binding_memes: Vec<ProgramSequenceBindingMeme>,
    pub program_sequence_chords: Vec<ProgramSequenceChord>,
    pub program_sequence_chord_voicings: Vec<ProgramSequenceChordVoicing>,
    pub program_voices: Vec<ProgramVoice>,
    pub program_voice_tracks: Vec<ProgramVoiceTrack>,
    pub program_sequence_patterns: Vec<ProgramSequencePattern>,
    pub program_sequence_pattern_events: Vec<ProgramSequencePatternEvent>,
    pub instruments: Vec<Instrument>,
    pub instrument_memes: Vec<InstrumentMeme>,
    pub instrument_audios: Vec<InstrumentAudio>,
}

type Index<K, V> = BTreeMap<K, Vec<V>>;

fn index_insert<K: Ord, V: PartialEq>(index: &mut Index<K, V>, key: K, value: V) {
    let children = index.entry(key).or_default();
    if !children.contains(&value) {
        children.push(value);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContentStore {
    libraries: BTreeMap<LibraryId, Library>,
    templates: BTreeMap<TemplateId, Template>,
    template_bindings: BTreeMap<TemplateBindingId, TemplateBinding>,
    programs: BTreeMap<ProgramId, Program>,
    program_memes: BTreeMap<ProgramMemeId, ProgramMeme>,
    sequences: BTreeMap<ProgramSequenceId, ProgramSequence>,
    bindings: BTreeMap<ProgramSequenceBindingId, ProgramSequenceBinding>,
    binding_memes: BTreeMap<ProgramSequenceBindingMemeId, ProgramSequenceBindingMeme>,
    chords: BTreeMap<ProgramSequenceChordId, ProgramSequenceChord>,
    voicings: BTreeMap<ProgramSequenceChordVoicingId, ProgramSequenceChordVoicing>,
    voices: BTreeMap<ProgramVoiceId, ProgramVoice>,
    tracks: BTreeMap<ProgramVoiceTrackId, ProgramVoiceTrack>,
    patterns: BTreeMap<ProgramSequencePatternId, ProgramSequencePattern>,
    events: BTreeMap<ProgramSequencePatternEventId, ProgramSequencePatternEvent>,
    instruments: BTreeMap<InstrumentId, Instrument>,
    instrument_memes: BTreeMap<InstrumentMemeId, InstrumentMeme>,
    audios: BTreeMap<InstrumentAudioId, InstrumentAudio>,

    // Parent -> children indexes.
    memes_by_program: Index<ProgramId, ProgramMemeId>,
    sequences_by_program: Index<ProgramId, ProgramSequenceId>,
    bindings_by_program: Index<ProgramId, ProgramSequenceBindingId>,
    memes_by_binding: Index<ProgramSequenceBindingId, ProgramSequenceBindingMemeId>,
    chords_by_sequence: Index<ProgramSequenceId, ProgramSequenceChordId>,
    voicings_by_chord: Index<ProgramSequenceChordId, ProgramSequenceChordVoicingId>,
    voices_by_program: Index<ProgramId, ProgramVoiceId>,
    tracks_by_voice: Index<ProgramVoiceId, ProgramVoiceTrackId>,
    patterns_by_sequence_voice: Index<(ProgramSequenceId, ProgramVoiceId), ProgramSequencePatternId>,
    events_by_pattern: Index<ProgramSequencePatternId, ProgramSequencePatternEventId>,
    memes_by_instrument: Index<InstrumentId, InstrumentMemeId>,
    audios_by_instrument: Index<InstrumentId, InstrumentAudioId>,
}

macro_rules! lookup {
    ($field:ident, $get:ident, $all:ident, $id:ty, $ty:ty) => {
        pub fn $get(&self, id: $id) -> Option<&$ty> {
            self.$field.get(&id)
        }

        pub fn $all(&self) -> impl Iterator<Item = &$ty> {
            self.$field.values()
        }
    };
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(doc: ContentDocument) -> Self {
        let mut store = ContentStore::new();
        doc.libraries.into_iter().for_each(|e| store.put_library(e));
        doc.templates.into_iter().for_each(|e| store.put_template(e));
        doc.template_bindings
            .into_iter()
            .for_each(|e| store.put_template_binding(e));
        doc.programs.into_iter().for_each(|e| store.put_program(e));
        doc.program_memes.into_iter().for_each(|e| store.put_program_meme(e));
        doc.program_sequences
            .into_iter()
            .for_each(|e| store.put_sequence(e));
        doc.program_sequence_bindings
            .into_iter()
            .for_each(|e| store.put_binding(e));
        doc.program_sequence_binding_memes
            .into_iter()
            .for_each(|e| store.put_binding_meme(e));
        doc.program_sequence_chords
            .into_iter()
            .for_each(|e| store.put_chord(e));
        doc.program_sequence_chord_voicings
            .into_iter()
            .for_each(|e| store.put_voicing(e));
        doc.program_voices.into_iter().for_each(|e| store.put_voice(e));
        doc.program_voice_tracks
            .into_iter()
            .for_each(|e| store.put_track(e));
        doc.program_sequence_patterns
            .into_iter()
            .for_each(|e| store.put_pattern(e));
        doc.program_sequence_pattern_events
            .into_iter()
            .for_each(|e| store.put_event(e));
        doc.instruments.into_iter().for_each(|e| store.put_instrument(e));
        doc.instrument_memes
            .into_iter()
            .for_each(|e| store.put_instrument_meme(e));
        doc.instrument_audios.into_iter().for_each(|e| store.put_audio(e));
        store
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let doc: ContentDocument = serde_json::from_str(json)?;
        Ok(Self::from_document(doc))
    }

    // -----------------------------------------------------------------------
    // Writes (loading only)
    // -----------------------------------------------------------------------

    pub fn put_library(&mut self, e: Library) {
        self.libraries.insert(e.id, e);
    }

    pub fn put_template(&mut self, e: Template) {
        self.templates.insert(e.id, e);
    }

    pub fn put_template_binding(&mut self, e: TemplateBinding) {
        self.template_bindings.insert(e.id, e);
    }

    pub fn put_program(&mut self, e: Program) {
        self.programs.insert(e.id, e);
    }

    pub fn put_program_meme(&mut self, e: ProgramMeme) {
        index_insert(&mut self.memes_by_program, e.program_id, e.id);
        self.program_memes.insert(e.id, e);
    }

    pub fn put_sequence(&mut self, e: ProgramSequence) {
        index_insert(&mut self.sequences_by_program, e.program_id, e.id);
        self.sequences.insert(e.id, e);
    }

    pub fn put_binding(&mut self, e: ProgramSequenceBinding) {
        index_insert(&mut self.bindings_by_program, e.program_id, e.id);
        self.bindings.insert(e.id, e);
    }

    pub fn put_binding_meme(&mut self, e: ProgramSequenceBindingMeme) {
        index_insert(&mut self.memes_by_binding, e.program_sequence_binding_id, e.id);
        self.binding_memes.insert(e.id, e);
    }

    pub fn put_chord(&mut self, e: ProgramSequenceChord) {
        index_insert(&mut self.chords_by_sequence, e.program_sequence_id, e.id);
        self.chords.insert(e.id, e);
    }

    pub fn put_voicing(&mut self, e: ProgramSequenceChordVoicing) {
        index_insert(&mut self.voicings_by_chord, e.program_sequence_chord_id, e.id);
        self.voicings.insert(e.id, e);
    }

    pub fn put_voice(&mut self, e: ProgramVoice) {
        index_insert(&mut self.voices_by_program, e.program_id, e.id);
        self.voices.insert(e.id, e);
    }

    pub fn put_track(&mut self, e: ProgramVoiceTrack) {
        index_insert(&mut self.tracks_by_voice, e.program_voice_id, e.id);
        self.tracks.insert(e.id, e);
    }

    pub fn put_pattern(&mut self, e: ProgramSequencePattern) {
        index_insert(
            &mut self.patterns_by_sequence_voice,
            (e.program_sequence_id, e.program_voice_id),
            e.id,
        );
        self.patterns.insert(e.id, e);
    }

    pub fn put_event(&mut self, e: ProgramSequencePatternEvent) {
        index_insert(&mut self.events_by_pattern, e.program_sequence_pattern_id, e.id);
        self.events.insert(e.id, e);
    }

    pub fn put_instrument(&mut self, e: Instrument) {
        self.instruments.insert(e.id, e);
    }

    pub fn put_instrument_meme(&mut self, e: InstrumentMeme) {
        index_insert(&mut self.memes_by_instrument, e.instrument_id, e.id);
        self.instrument_memes.insert(e.id, e);
    }

    pub fn put_audio(&mut self, e: InstrumentAudio) {
        index_insert(&mut self.audios_by_instrument, e.instrument_id, e.id);
        self.audios.insert(e.id, e);
    }

    // -----------------------------------------------------------------------
    // Lookups by id
    // -----------------------------------------------------------------------

    lookup!(libraries, library, libraries, LibraryId, Library);
    lookup!(templates, template, templates, TemplateId, Template);
    lookup!(programs, program, programs, ProgramId, Program);
    lookup!(sequences, sequence, sequences, ProgramSequenceId, ProgramSequence);
    lookup!(bindings, binding, bindings, ProgramSequenceBindingId, ProgramSequenceBinding);
    lookup!(chords, chord, chords, ProgramSequenceChordId, ProgramSequenceChord);
    lookup!(voices, voice, voices, ProgramVoiceId, ProgramVoice);
    lookup!(tracks, track, tracks, ProgramVoiceTrackId, ProgramVoiceTrack);
    lookup!(patterns, pattern, patterns, ProgramSequencePatternId, ProgramSequencePattern);
    lookup!(events, event, events, ProgramSequencePatternEventId, ProgramSequencePatternEvent);
    lookup!(instruments, instrument, instruments, InstrumentId, Instrument);
    lookup!(audios, audio, audios, InstrumentAudioId, InstrumentAudio);

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    pub fn bindings_of_template(&self, template_id: TemplateId) -> Vec<&TemplateBinding> {
        self.template_bindings
            .values()
            .filter(|b| b.template_id == template_id)
            .collect()
    }

    pub fn programs_of_library(&self, library_id: LibraryId) -> Vec<&Program> {
        self.programs
            .values()
            .filter(|p| p.library_id == library_id)
            .collect()
    }

    pub fn instruments_of_library(&self, library_id: LibraryId) -> Vec<&Instrument> {
        self.instruments
            .values()
            .filter(|i| i.library_id == library_id)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Programs
    // -----------------------------------------------------------------------

    pub fn programs_of_type(&self, program_type: ProgramType) -> Vec<&Program> {
        self.programs
            .values()
            .filter(|p| p.program_type == program_type)
            .collect()
    }

    pub fn memes_of_program(&self, program_id: ProgramId) -> Vec<&ProgramMeme> {
        self.children(&self.memes_by_program, &program_id, &self.program_memes)
    }

    pub fn sequences_of_program(&self, program_id: ProgramId) -> Vec<&ProgramSequence> {
        self.children(&self.sequences_by_program, &program_id, &self.sequences)
    }

    /// Bindings of a program ordered by offset.
    pub fn bindings_of_program(&self, program_id: ProgramId) -> Vec<&ProgramSequenceBinding> {
        let mut out = self.children(&self.bindings_by_program, &program_id, &self.bindings);
        out.sort_by_key(|b| b.offset);
        out
    }

    /// Distinct binding offsets of a program, ascending.
    pub fn available_offsets(&self, program_id: ProgramId) -> Vec<i32> {
        let offsets: BTreeSet<i32> = self
            .bindings_of_program(program_id)
            .iter()
            .map(|b| b.offset)
            .collect();
        offsets.into_iter().collect()
    }

    /// Bindings at exactly `offset`, or (with `include_nearest`) at the
    /// available offset closest to it.
    pub fn bindings_at_offset(
        &self,
        program_id: ProgramId,
        offset: i32,
        include_nearest: bool,
    ) -> Vec<&ProgramSequenceBinding> {
        let candidates = self.bindings_of_program(program_id);
        let target = if include_nearest {
            candidates
                .iter()
                .min_by_key(|b| (b.offset - offset).abs())
                .map(|b| b.offset)
                .unwrap_or(offset)
        } else {
            offset
        };
        candidates.into_iter().filter(|b| b.offset == target).collect()
    }

    pub fn memes_of_binding(
        &self,
        binding_id: ProgramSequenceBindingId,
    ) -> Vec<&ProgramSequenceBindingMeme> {
        self.children(&self.memes_by_binding, &binding_id, &self.binding_memes)
    }

    /// Program memes plus the memes of every binding at offset 0, deduplicated.
    pub fn memes_at_beginning(&self, program_id: ProgramId) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self
            .memes_of_program(program_id)
            .iter()
            .map(|m| m.name.clone())
            .collect();
        for binding in self.bindings_at_offset(program_id, 0, false) {
            out.extend(self.memes_of_binding(binding.id).iter().map(|m| m.name.clone()));
        }
        out
    }

    pub fn sequence_of_binding(&self, binding: &ProgramSequenceBinding) -> Option<&ProgramSequence> {
        self.sequences.get(&binding.program_sequence_id)
    }

    /// Chords of a sequence ordered by position.
    pub fn chords_of_sequence(&self, sequence_id: ProgramSequenceId) -> Vec<&ProgramSequenceChord> {
        let mut out = self.children(&self.chords_by_sequence, &sequence_id, &self.chords);
        out.sort_by(|a, b| a.position.total_cmp(&b.position));
        out
    }

    pub fn voicings_of_chord(
        &self,
        chord_id: ProgramSequenceChordId,
    ) -> Vec<&ProgramSequenceChordVoicing> {
        self.children(&self.voicings_by_chord, &chord_id, &self.voicings)
    }

    /// Voices of a program ordered by `order`.
    pub fn voices_of_program(&self, program_id: ProgramId) -> Vec<&ProgramVoice> {
        let mut out = self.children(&self.voices_by_program, &program_id, &self.voices);
        out.sort_by(|a, b| a.order.total_cmp(&b.order));
        out
    }

    pub fn tracks_of_voice(&self, voice_id: ProgramVoiceId) -> Vec<&ProgramVoiceTrack> {
        let mut out = self.children(&self.tracks_by_voice, &voice_id, &self.tracks);
        out.sort_by(|a, b| a.order.total_cmp(&b.order));
        out
    }

    pub fn track_names_of_voice(&self, voice_id: ProgramVoiceId) -> Vec<String> {
        self.tracks_of_voice(voice_id)
            .iter()
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn patterns_of(
        &self,
        sequence_id: ProgramSequenceId,
        voice_id: ProgramVoiceId,
    ) -> Vec<&ProgramSequencePattern> {
        self.children(
            &self.patterns_by_sequence_voice,
            &(sequence_id, voice_id),
            &self.patterns,
        )
    }

    /// Events of a pattern ordered by position.
    pub fn events_of_pattern(
        &self,
        pattern_id: ProgramSequencePatternId,
    ) -> Vec<&ProgramSequencePatternEvent> {
        let mut out = self.children(&self.events_by_pattern, &pattern_id, &self.events);
        out.sort_by(|a, b| a.position.total_cmp(&b.position));
        out
    }

    pub fn track_of_event(&self, event: &ProgramSequencePatternEvent) -> Option<&ProgramVoiceTrack> {
        self.tracks.get(&event.program_voice_track_id)
    }

    pub fn voice_of_event(&self, event: &ProgramSequencePatternEvent) -> Option<&ProgramVoice> {
        self.track_of_event(event)
            .and_then(|t| self.voices.get(&t.program_voice_id))
    }

    pub fn instrument_type_of_event(
        &self,
        event: &ProgramSequencePatternEvent,
    ) -> Option<InstrumentType> {
        self.voice_of_event(event).map(|v| v.instrument_type)
    }

    // -----------------------------------------------------------------------
    // Instruments
    // -----------------------------------------------------------------------

    pub fn instruments_of_type(&self, instrument_type: InstrumentType) -> Vec<&Instrument> {
        self.instruments
            .values()
            .filter(|i| i.instrument_type == instrument_type)
            .collect()
    }

    pub fn instruments_of_types_and_modes(
        &self,
        types: &[InstrumentType],
        modes: &[InstrumentMode],
    ) -> Vec<&Instrument> {
        self.instruments
            .values()
            .filter(|i| types.contains(&i.instrument_type) && modes.contains(&i.mode))
            .collect()
    }

    pub fn memes_of_instrument(&self, instrument_id: InstrumentId) -> Vec<&InstrumentMeme> {
        self.children(&self.memes_by_instrument, &instrument_id, &self.instrument_memes)
    }

    pub fn audios_of_instrument(&self, instrument_id: InstrumentId) -> Vec<&InstrumentAudio> {
        self.children(&self.audios_by_instrument, &instrument_id, &self.audios)
    }

    pub fn audios_of_types_and_modes(
        &self,
        types: &[InstrumentType],
        modes: &[InstrumentMode],
    ) -> Vec<&InstrumentAudio> {
        self.instruments_of_types_and_modes(types, modes)
            .into_iter()
            .flat_map(|i| self.audios_of_instrument(i.id))
            .collect()
    }

    pub fn instrument_type_of_audio(&self, audio_id: InstrumentAudioId) -> Option<InstrumentType> {
        let audio = self.audios.get(&audio_id)?;
        self.instruments
            .get(&audio.instrument_id)
            .map(|i| i.instrument_type)
    }

    fn children<'a, K: Ord, I: Ord + Copy, V>(
        &'a self,
        index: &'a Index<K, I>,
        key: &K,
        table: &'a BTreeMap<I, V>,
    ) -> Vec<&'a V> {
        index
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| table.get(id)).collect())
            .unwrap_or_default()
    }
}

// Per-segment fabrication context.
//
// A `Fabricator` is bound to exactly one segment of one chain. It borrows the
// chain's `SegmentStore` mutably, the shared `ContentStore` immutably and the
// caller's `FabRng`, and gives the craft stages one place to:
// - read the segment being built, its chords/voicings/memes/choices, and the
//   lineage history through a `Retrospective`;
// - write choices, memes, arrangements, picks, chords, messages and metas;
// - answer derived questions (chord at a beat, key of a choice, note range
//   of a program voice, octave/semitone shifts, next binding offset),
//   memoized per segment.
//
// Construction loads the chain (fatal if absent), parses its template
// configuration (fatal if unparseable), resolves the template bindings into
// the "directly bound" sets, loads the retrospective, classifies the segment
// type and seeds the preferred-audio cache from the lineage's picks. The
// segment's storage key is filled in if still blank.
//
// Content references handed out by the Fabricator carry the content store's
// lifetime `'a`, not the Fabricator's, so a stage can hold a `&Program` while
// it keeps writing through `&mut self`.
//
// **Critical constraint: meme theorem.** `put_choice` and `put_meme` refuse
// anything that would place two values of one taxonomy category in the
// segment, unless forced. A refusal is recorded as an error message on the
// segment and is not an error for the caller.
//
// See also: `craft/` for the stages that drive this, `retrospective.rs`,
// `store.rs`.

use crate::bag::SelectionBag;
use crate::config::TemplateConfig;
use crate::content::*;
use crate::entities::*;
use crate::error::{FabricationError, Result};
use crate::ids::*;
use crate::meme::{MemeIsometry, MemeStack, to_meme, to_memes};
use crate::retrospective::Retrospective;
use crate::store::SegmentStore;
use fabrica_music::{Accidental, Chord, Note, NoteRange, StickyBun};
use fabrica_prng::FabRng;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

/// Microseconds per minute, for beats-to-time conversion.
const MICROS_PER_MINUTE: f64 = 60_000_000.0;

/// Caller-supplied overrides, used when rewriting the future of a chain.
#[derive(Debug, Clone, Default)]
pub struct FabricatorOverrides {
    pub segment_type: Option<SegmentType>,
    pub macro_program: Option<ProgramId>,
    pub memes: Option<BTreeSet<String>>,
}

/// Content the chain's template binds directly, by kind.
#[derive(Debug, Clone, Default)]
struct BoundContent {
    libraries: BTreeSet<LibraryId>,
    programs: BTreeSet<ProgramId>,
    instruments: BTreeSet<InstrumentId>,
}

pub struct Fabricator<'a> {
    store: &'a mut SegmentStore,
    content: &'a ContentStore,
    rng: &'a mut FabRng,
    chain: Chain,
    config: TemplateConfig,
    segment_id: SegmentId,
    segment_type: SegmentType,
    overrides: FabricatorOverrides,
    bound: BoundContent,
    retrospective: Retrospective,
    /// Keyed by `preferred_audio_key(parent, ident)`.
    preferred_audios: BTreeMap<String, InstrumentAudioId>,

    // Memo caches. Chord and voicing caches are dropped whenever a chord or
    // voicing is written; the pick cache whenever a pick is.
    ordered_chords: Option<Vec<SegmentChord>>,
    voicing_ranges: FxHashMap<InstrumentType, NoteRange>,
    picks_by_choice: FxHashMap<ChoiceId, Vec<SegmentChoiceArrangementPick>>,
    program_ranges: FxHashMap<(ProgramId, InstrumentType), NoteRange>,
    octave_shifts: FxHashMap<(InstrumentType, String, String), i32>,
    target_shifts: FxHashMap<(InstrumentType, String, String), i32>,
    sequence_chords: FxHashMap<ProgramSequenceId, Vec<&'a ProgramSequenceChord>>,
    random_sequences: FxHashMap<ProgramId, Option<ProgramSequenceId>>,
}

impl<'a> Fabricator<'a> {
    pub fn new(
        store: &'a mut SegmentStore,
        content: &'a ContentStore,
        rng: &'a mut FabRng,
        segment_id: SegmentId,
        overrides: FabricatorOverrides,
    ) -> Result<Self> {
        let chain = store.read_chain()?.clone();
        let config = TemplateConfig::from_json(&chain.template_config).map_err(|e| {
            FabricationError::fatal(format!("chain {} template config: {e}", chain.id))
        })?;
        store.read_segment(segment_id)?;

        let mut bound = BoundContent::default();
        if let Some(template_id) = chain.template_id {
            for binding in content.bindings_of_template(template_id) {
                match binding.content_type {
                    TemplateBindingType::Library => {
                        bound.libraries.insert(LibraryId(binding.target_id));
                    }
                    TemplateBindingType::Program => {
                        bound.programs.insert(ProgramId(binding.target_id));
                    }
                    TemplateBindingType::Instrument => {
                        bound.instruments.insert(InstrumentId(binding.target_id));
                    }
                }
            }
        }

        let retrospective = Retrospective::load(store, segment_id)?;
        let mut fabricator = Fabricator {
            store,
            content,
            rng,
            chain,
            config,
            segment_id,
            segment_type: SegmentType::Pending,
            overrides,
            bound,
            retrospective,
            preferred_audios: BTreeMap::new(),
            ordered_chords: None,
            voicing_ranges: FxHashMap::default(),
            picks_by_choice: FxHashMap::default(),
            program_ranges: FxHashMap::default(),
            octave_shifts: FxHashMap::default(),
            target_shifts: FxHashMap::default(),
            sequence_chords: FxHashMap::default(),
            random_sequences: FxHashMap::default(),
        };
        fabricator.segment_type = match fabricator.overrides.segment_type {
            Some(t) => t,
            None => fabricator.compute_type(),
        };
        fabricator.seed_preferred_audios();
        fabricator.ensure_storage_key()?;
        debug!(
            chain_id = fabricator.chain.id.0,
            segment_id = segment_id.0,
            segment_type = ?fabricator.segment_type,
            "fabricator ready"
        );
        Ok(fabricator)
    }

    // -----------------------------------------------------------------------
    // Context
    // -----------------------------------------------------------------------

    pub fn content(&self) -> &'a ContentStore {
        self.content
    }

    pub fn rng(&mut self) -> &mut FabRng {
        self.rng
    }

    pub fn config(&self) -> &TemplateConfig {
        &self.config
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn segment_type(&self) -> SegmentType {
        self.segment_type
    }

    pub fn retrospective(&self) -> &Retrospective {
        &self.retrospective
    }

    pub fn overrides(&self) -> &FabricatorOverrides {
        &self.overrides
    }

    pub fn segment(&self) -> Result<Segment> {
        Ok(self.store.read_segment(self.segment_id)?.clone())
    }

    pub fn update_segment(&mut self, segment: Segment) -> Result<Segment> {
        self.store.update_segment(segment)
    }

    pub fn is_initial_segment(&self) -> bool {
        self.segment_id.is_first()
    }

    pub fn is_continuation_of_macro_program(&self) -> bool {
        matches!(self.segment_type, SegmentType::Continue | SegmentType::NextMain)
    }

    fn ensure_storage_key(&mut self) -> Result<()> {
        let mut segment = self.segment()?;
        if !segment.storage_key.is_empty() {
            return Ok(());
        }
        segment.storage_key = storage_key(&self.chain, segment.begin_at_chain_micros);
        self.store.update_segment(segment)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Segment type
    // -----------------------------------------------------------------------

    /// Initial for the first segment; Continue while the previous main
    /// program has another binding offset and the running delta is under
    /// `mainProgramLengthMaxDelta`; NextMain while the previous macro
    /// program has two more offsets; otherwise NextMacro.
    pub fn compute_type(&self) -> SegmentType {
        if self.is_initial_segment() {
            return SegmentType::Initial;
        }
        let previous_delta = self
            .retrospective
            .previous_segment()
            .map(|s| s.delta)
            .unwrap_or(0);
        if let Some(main) = self.retrospective.previous_choice_of_type(ProgramType::Main)
            && self.has_more_sequence_binding_offsets(main, 1)
            && self.config.main_program_length_max_delta > previous_delta
        {
            return SegmentType::Continue;
        }
        if let Some(macro_choice) = self.retrospective.previous_choice_of_type(ProgramType::Macro)
            && self.has_more_sequence_binding_offsets(macro_choice, 2)
        {
            return SegmentType::NextMain;
        }
        SegmentType::NextMacro
    }

    // -----------------------------------------------------------------------
    // Reads of the current segment
    // -----------------------------------------------------------------------

    pub fn choices(&self) -> Vec<SegmentChoice> {
        self.store
            .read_all::<SegmentChoice>(self.segment_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn current_choice_of_type(&self, program_type: ProgramType) -> Option<SegmentChoice> {
        self.store.read_choice(self.segment_id, program_type).cloned()
    }

    pub fn previous_main_choice(&self) -> Option<SegmentChoice> {
        self.retrospective
            .previous_choice_of_type(ProgramType::Main)
            .cloned()
    }

    pub fn previous_macro_choice(&self) -> Option<SegmentChoice> {
        self.retrospective
            .previous_choice_of_type(ProgramType::Macro)
            .cloned()
    }

    /// Chords of the segment ordered by position.
    pub fn chords(&mut self) -> Vec<SegmentChord> {
        if self.ordered_chords.is_none() {
            let chords = self
                .store
                .read_ordered_segment_chords(self.segment_id)
                .into_iter()
                .cloned()
                .collect();
            self.ordered_chords = Some(chords);
        }
        self.ordered_chords.clone().unwrap_or_default()
    }

    pub fn chord_voicings(&self) -> Vec<SegmentChordVoicing> {
        self.store
            .read_all::<SegmentChordVoicing>(self.segment_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn memes(&self) -> BTreeSet<String> {
        self.store
            .read_all::<SegmentMeme>(self.segment_id)
            .into_iter()
            .map(|m| m.name.clone())
            .collect()
    }

    pub fn meme_stack(&self) -> MemeStack {
        MemeStack::new(self.config.meme_taxonomy.clone(), self.memes())
    }

    pub fn meme_isometry_of_segment(&self) -> MemeIsometry {
        MemeIsometry::of(self.config.meme_taxonomy.clone(), self.memes())
    }

    /// Isometry of what the previous macro program would play next: its
    /// program memes plus the memes of the binding after the one it used.
    pub fn meme_isometry_of_next_sequence_in_previous_macro(&self) -> MemeIsometry {
        let taxonomy = self.config.meme_taxonomy.clone();
        let Some(previous) = self.retrospective.previous_choice_of_type(ProgramType::Macro) else {
            return MemeIsometry::none(taxonomy);
        };
        let (Some(program_id), Some(binding)) = (
            previous.program_id,
            previous
                .program_sequence_binding_id
                .and_then(|id| self.content.binding(id)),
        ) else {
            return MemeIsometry::none(taxonomy);
        };
        let mut memes: Vec<String> = self
            .content
            .memes_of_program(program_id)
            .iter()
            .map(|m| m.name.clone())
            .collect();
        for next in self
            .content
            .bindings_at_offset(program_id, binding.offset + 1, true)
        {
            memes.extend(self.content.memes_of_binding(next.id).iter().map(|m| m.name.clone()));
        }
        MemeIsometry::of(taxonomy, memes)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Store `choice` together with the memes of its program, binding and
    /// instrument. Returns `None` when the memes conflict with the segment
    /// and `force` is false.
    pub fn put_choice(&mut self, choice: SegmentChoice, force: bool) -> Result<Option<SegmentChoice>> {
        let mut raw: Vec<String> = Vec::new();
        if let Some(program_id) = choice.program_id {
            raw.extend(self.content.memes_of_program(program_id).iter().map(|m| m.name.clone()));
        }
        if let Some(binding_id) = choice.program_sequence_binding_id {
            raw.extend(self.content.memes_of_binding(binding_id).iter().map(|m| m.name.clone()));
        }
        if let Some(instrument_id) = choice.instrument_id {
            raw.extend(
                self.content
                    .memes_of_instrument(instrument_id)
                    .iter()
                    .map(|m| m.name.clone()),
            );
        }
        let memes = to_memes(raw);

        if !force {
            let stack = self.meme_stack();
            if !stack.is_allowed(&memes) {
                let body = format!(
                    "Refused to add Choice[{}] because adding Memes[{}] to MemeStack[{}] would result in an invalid meme stack theorem!",
                    self.describe_choice(&choice),
                    memes.iter().cloned().collect::<Vec<_>>().join(", "),
                    stack.constellation()
                );
                self.add_error_message(body)?;
                return Ok(None);
            }
        }
        for meme in &memes {
            self.put_meme(meme, false)?;
        }
        Ok(Some(self.store.put(choice)?))
    }

    /// Store one meme. Duplicates are skipped; a theorem violation is
    /// refused unless `force`. Returns whether the meme was stored.
    pub fn put_meme(&mut self, name: &str, force: bool) -> Result<bool> {
        let name = to_meme(name);
        if name.is_empty() {
            return Ok(false);
        }
        let existing = self.memes();
        if existing.contains(&name) {
            return Ok(false);
        }
        if !force {
            let proposed: BTreeSet<String> = [name.clone()].into();
            if !self.meme_stack().is_allowed(&proposed) {
                debug!(segment_id = self.segment_id.0, meme = %name, "meme refused");
                return Ok(false);
            }
        }
        self.store.put(SegmentMeme {
            id: MemeId(0),
            segment_id: self.segment_id,
            name,
        })?;
        Ok(true)
    }

    pub fn put_arrangement(
        &mut self,
        choice: &SegmentChoice,
        pattern_id: Option<ProgramSequencePatternId>,
    ) -> Result<SegmentChoiceArrangement> {
        self.store.put(SegmentChoiceArrangement {
            id: ArrangementId(0),
            segment_id: self.segment_id,
            segment_choice_id: choice.id,
            program_sequence_pattern_id: pattern_id,
        })
    }

    /// Insert or update a pick.
    pub fn put_pick(&mut self, pick: SegmentChoiceArrangementPick) -> Result<SegmentChoiceArrangementPick> {
        self.picks_by_choice.clear();
        self.store.put(pick)
    }

    pub fn delete_pick(&mut self, id: PickId) {
        self.picks_by_choice.clear();
        self.store
            .delete::<SegmentChoiceArrangementPick>(self.segment_id, id);
    }

    pub fn put_chord(&mut self, name: &str, position: f64) -> Result<SegmentChord> {
        self.ordered_chords = None;
        self.store.put(SegmentChord {
            id: SegmentChordId(0),
            segment_id: self.segment_id,
            name: name.to_string(),
            position,
        })
    }

    pub fn put_chord_voicing(
        &mut self,
        chord: &SegmentChord,
        instrument_type: InstrumentType,
        notes: &str,
    ) -> Result<SegmentChordVoicing> {
        self.voicing_ranges.clear();
        self.store.put(SegmentChordVoicing {
            id: VoicingId(0),
            segment_id: self.segment_id,
            segment_chord_id: chord.id,
            instrument_type,
            notes: notes.to_string(),
        })
    }

    /// Upsert a meta value by key.
    pub fn put_meta(&mut self, key: &str, value: String) -> Result<SegmentMeta> {
        let id = self
            .store
            .read_all::<SegmentMeta>(self.segment_id)
            .into_iter()
            .find(|m| m.key == key)
            .map(|m| m.id)
            .unwrap_or(MetaId(0));
        self.store.put(SegmentMeta {
            id,
            segment_id: self.segment_id,
            key: key.to_string(),
            value,
        })
    }

    pub fn meta(&self, key: &str) -> Option<SegmentMeta> {
        self.store
            .read_all::<SegmentMeta>(self.segment_id)
            .into_iter()
            .find(|m| m.key == key)
            .cloned()
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Record a segment message and mirror it to `tracing`.
    pub fn add_message(&mut self, message_type: SegmentMessageType, body: impl Into<String>) -> Result<()> {
        let body = body.into();
        let segment_id = self.segment_id.0;
        match message_type {
            SegmentMessageType::Debug => debug!(segment_id, "{body}"),
            SegmentMessageType::Info => info!(segment_id, "{body}"),
            SegmentMessageType::Warning => warn!(segment_id, "{body}"),
            SegmentMessageType::Error => error!(segment_id, "{body}"),
        }
        self.store.put(SegmentMessage {
            id: MessageId(0),
            segment_id: self.segment_id,
            message_type,
            body,
        })?;
        Ok(())
    }

    pub fn add_error_message(&mut self, body: impl Into<String>) -> Result<()> {
        self.add_message(SegmentMessageType::Error, body)
    }

    pub fn add_warning_message(&mut self, body: impl Into<String>) -> Result<()> {
        self.add_message(SegmentMessageType::Warning, body)
    }

    pub fn add_info_message(&mut self, body: impl Into<String>) -> Result<()> {
        self.add_message(SegmentMessageType::Info, body)
    }

    /// Debug message holding `{key: value}` as JSON.
    pub fn put_report(&mut self, key: &str, value: impl Serialize) -> Result<()> {
        let mut report = serde_json::Map::new();
        report.insert(key.to_string(), serde_json::to_value(value)?);
        let body = serde_json::Value::Object(report).to_string();
        self.add_message(SegmentMessageType::Debug, body)
    }

    pub fn messages(&self) -> Vec<SegmentMessage> {
        self.store
            .read_all::<SegmentMessage>(self.segment_id)
            .into_iter()
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Binding
    // -----------------------------------------------------------------------

    pub fn is_directly_bound_program(&self, program: &Program) -> bool {
        self.bound.programs.contains(&program.id) || self.bound.libraries.contains(&program.library_id)
    }

    pub fn is_directly_bound_instrument(&self, instrument: &Instrument) -> bool {
        self.bound.instruments.contains(&instrument.id)
            || self.bound.libraries.contains(&instrument.library_id)
    }

    // -----------------------------------------------------------------------
    // Continuation
    // -----------------------------------------------------------------------

    fn continued_choice(&self, matches: impl Fn(&SegmentChoice) -> bool) -> Option<SegmentChoice> {
        if self.segment_type != SegmentType::Continue {
            return None;
        }
        self.retrospective.choices().iter().find(|c| matches(c)).cloned()
    }

    /// The lineage's choice for a voice of the same name and type.
    pub fn choice_if_continued_by_voice(&self, voice: &ProgramVoice) -> Option<SegmentChoice> {
        let content = self.content;
        self.continued_choice(|c| {
            c.program_voice_id
                .and_then(|id| content.voice(id))
                .is_some_and(|v| v.name == voice.name && v.instrument_type == voice.instrument_type)
        })
    }

    pub fn choice_if_continued_by_type(&self, instrument_type: InstrumentType) -> Option<SegmentChoice> {
        self.continued_choice(|c| c.instrument_type == Some(instrument_type))
    }

    pub fn choice_if_continued_by_type_and_mode(
        &self,
        instrument_type: InstrumentType,
        mode: InstrumentMode,
    ) -> Option<SegmentChoice> {
        self.continued_choice(|c| {
            c.instrument_type == Some(instrument_type) && c.instrument_mode == Some(mode)
        })
    }

    pub fn choice_if_continued_by_program_type(&self, program_type: ProgramType) -> Option<SegmentChoice> {
        self.continued_choice(|c| c.program_type == Some(program_type))
    }

    // -----------------------------------------------------------------------
    // Sequence bindings
    // -----------------------------------------------------------------------

    pub fn sequence_binding_offset(&self, choice: &SegmentChoice) -> i32 {
        choice
            .program_sequence_binding_id
            .and_then(|id| self.content.binding(id))
            .map(|b| b.offset)
            .unwrap_or(0)
    }

    /// Smallest available offset after the choice's, or 0 to wrap around.
    pub fn next_sequence_binding_offset(&self, choice: &SegmentChoice) -> i32 {
        let (Some(program_id), Some(binding)) = (
            choice.program_id,
            choice
                .program_sequence_binding_id
                .and_then(|id| self.content.binding(id)),
        ) else {
            return 0;
        };
        self.content
            .available_offsets(program_id)
            .into_iter()
            .find(|o| *o > binding.offset)
            .unwrap_or(0)
    }

    /// Whether at least `count` more offsets follow the choice's.
    pub fn has_more_sequence_binding_offsets(&self, choice: &SegmentChoice, count: usize) -> bool {
        let (Some(program_id), Some(binding)) = (
            choice.program_id,
            choice
                .program_sequence_binding_id
                .and_then(|id| self.content.binding(id)),
        ) else {
            return false;
        };
        let offsets = self.content.available_offsets(program_id);
        offsets
            .iter()
            .position(|o| *o == binding.offset)
            .is_some_and(|i| i + count < offsets.len())
    }

    pub fn second_macro_sequence_binding_offset(&self, program_id: ProgramId) -> i32 {
        let offsets = self.content.available_offsets(program_id);
        offsets.get(1).or(offsets.first()).copied().unwrap_or(0)
    }

    pub fn randomly_selected_sequence_binding_at_offset(
        &mut self,
        program_id: ProgramId,
        offset: i32,
    ) -> Option<&'a ProgramSequenceBinding> {
        let content = self.content;
        let mut bag = SelectionBag::new();
        for binding in content.bindings_at_offset(program_id, offset, true) {
            bag.add(1, binding.id, 1);
        }
        bag.pick(self.rng).ok().and_then(|id| content.binding(id))
    }

    /// A random sequence of the program, the same one for the whole segment.
    pub fn randomly_selected_sequence(&mut self, program_id: ProgramId) -> Option<&'a ProgramSequence> {
        let content = self.content;
        if let Some(memo) = self.random_sequences.get(&program_id) {
            return memo.and_then(|id| content.sequence(id));
        }
        let mut bag = SelectionBag::new();
        for sequence in content.sequences_of_program(program_id) {
            bag.add(1, sequence.id, 1);
        }
        let picked = bag.pick(self.rng).ok();
        self.random_sequences.insert(program_id, picked);
        picked.and_then(|id| content.sequence(id))
    }

    /// The choice's bound sequence, else its recorded sequence, else a
    /// random sequence of its program.
    pub fn sequence_of_choice(&mut self, choice: &SegmentChoice) -> Option<&'a ProgramSequence> {
        let content = self.content;
        if let Some(binding) = choice
            .program_sequence_binding_id
            .and_then(|id| content.binding(id))
        {
            return content.sequence_of_binding(binding);
        }
        if let Some(sequence) = choice.program_sequence_id.and_then(|id| content.sequence(id)) {
            return Some(sequence);
        }
        let program_id = choice.program_id?;
        self.randomly_selected_sequence(program_id)
    }

    pub fn randomly_selected_pattern(&mut self, choice: &SegmentChoice) -> Option<&'a ProgramSequencePattern> {
        let content = self.content;
        let voice_id = choice.program_voice_id?;
        let sequence = self.sequence_of_choice(choice)?;
        let mut bag = SelectionBag::new();
        for pattern in content.patterns_of(sequence.id, voice_id) {
            bag.add(1, pattern.id, 1);
        }
        bag.pick(self.rng).ok().and_then(|id| content.pattern(id))
    }

    /// Chords of a sequence, one per position: where several share a
    /// position, the one whose voicings carry the most notes.
    pub fn program_sequence_chords(&mut self, sequence_id: ProgramSequenceId) -> Vec<&'a ProgramSequenceChord> {
        let content = self.content;
        self.sequence_chords
            .entry(sequence_id)
            .or_insert_with(|| {
                let mut best: Vec<(&ProgramSequenceChord, usize)> = Vec::new();
                for chord in content.chords_of_sequence(sequence_id) {
                    let notes: usize = content
                        .voicings_of_chord(chord.id)
                        .iter()
                        .map(|v| v.notes.split(',').filter(|n| Note::is_valid(n)).count())
                        .sum();
                    match best.iter_mut().find(|(c, _)| c.position == chord.position) {
                        Some(entry) if entry.1 < notes => *entry = (chord, notes),
                        Some(_) => {}
                        None => best.push((chord, notes)),
                    }
                }
                best.into_iter().map(|(c, _)| c).collect()
            })
            .clone()
    }

    // -----------------------------------------------------------------------
    // Harmony
    // -----------------------------------------------------------------------

    /// The chord sounding at `position`: the last chord at or before it,
    /// falling back to the first chord.
    pub fn chord_at(&mut self, position: f64) -> Option<SegmentChord> {
        let chords = self.chords();
        let mut found = chords.first()?;
        for chord in &chords {
            if chord.position > found.position && chord.position <= position {
                found = chord;
            }
        }
        Some(found.clone())
    }

    /// A random voicing of `chord` for `instrument_type` with playable notes.
    pub fn choose_voicing(
        &mut self,
        chord: &SegmentChord,
        instrument_type: InstrumentType,
    ) -> Option<SegmentChordVoicing> {
        let candidates: Vec<SegmentChordVoicing> = self
            .chord_voicings()
            .into_iter()
            .filter(|v| {
                v.segment_chord_id == chord.id
                    && v.instrument_type == instrument_type
                    && !voicing_notes(v).is_empty()
            })
            .collect();
        self.rng.choose(&candidates).cloned()
    }

    /// Key the choice's events were written in: the bound sequence's key if
    /// set, else the program's.
    pub fn key_for_choice(&mut self, choice: &SegmentChoice) -> Chord {
        let content = self.content;
        if choice.program_sequence_binding_id.is_some()
            && let Some(sequence) = self.sequence_of_choice(choice)
            && !sequence.key.trim().is_empty()
        {
            return Chord::of(&sequence.key);
        }
        choice
            .program_id
            .and_then(|id| content.program(id))
            .map(|p| Chord::of(&p.key))
            .unwrap_or_else(|| Chord::of(""))
    }

    /// Range of every pitched tone the program writes for `instrument_type`.
    pub fn program_range(&mut self, program_id: ProgramId, instrument_type: InstrumentType) -> NoteRange {
        let content = self.content;
        *self
            .program_ranges
            .entry((program_id, instrument_type))
            .or_insert_with(|| {
                let notes: Vec<Note> = content
                    .events()
                    .filter(|e| {
                        e.program_id == program_id
                            && content.instrument_type_of_event(e) == Some(instrument_type)
                    })
                    .flat_map(|e| e.tones.split(',').filter_map(Note::parse).collect::<Vec<_>>())
                    .collect();
                NoteRange::of_notes(&notes)
            })
    }

    /// Range of the segment's voicings for `instrument_type`.
    pub fn program_voicing_note_range(&mut self, instrument_type: InstrumentType) -> NoteRange {
        if let Some(range) = self.voicing_ranges.get(&instrument_type) {
            return *range;
        }
        let notes: Vec<Note> = self
            .chord_voicings()
            .iter()
            .filter(|v| v.instrument_type == instrument_type)
            .flat_map(voicing_notes)
            .collect();
        let range = NoteRange::of_notes(&notes);
        self.voicing_ranges.insert(instrument_type, range);
        range
    }

    /// Octaves to move `source` so it sits well against `target`: bass
    /// lands at or above the target's low note, pads/stabs/stickies/stripes
    /// center on its median, everything else stays put.
    pub fn program_range_shift_octaves(
        &mut self,
        instrument_type: InstrumentType,
        source: &NoteRange,
        target: &NoteRange,
    ) -> i32 {
        let key = (
            instrument_type,
            source.name(Accidental::Sharp),
            target.name(Accidental::Sharp),
        );
        *self.octave_shifts.entry(key).or_insert_with(|| match instrument_type {
            InstrumentType::Bass => NoteRange::lowest_optimal_shift_octaves(source, target).unwrap_or(0),
            InstrumentType::Pad | InstrumentType::Stab | InstrumentType::Sticky | InstrumentType::Stripe => {
                NoteRange::median_optimal_shift_octaves(source, target)
            }
            _ => 0,
        })
    }

    /// Semitones from the program key to the segment chord: bass follows the
    /// slash root, everything else the root. Zero when the key is absent.
    pub fn program_target_shift(&mut self, instrument_type: InstrumentType, from: &Chord, to: &Chord) -> i32 {
        if !from.is_present() {
            return 0;
        }
        let key = (instrument_type, from.name.clone(), to.name.clone());
        *self.target_shifts.entry(key).or_insert_with(|| match instrument_type {
            InstrumentType::Bass => from.root.delta(to.slash_root),
            _ => from.root.delta(to.root),
        })
    }

    // -----------------------------------------------------------------------
    // Picks and audio
    // -----------------------------------------------------------------------

    /// Picks of the choice's arrangements, ordered by start.
    pub fn picks_of_choice(&mut self, choice_id: ChoiceId) -> Vec<SegmentChoiceArrangementPick> {
        if let Some(picks) = self.picks_by_choice.get(&choice_id) {
            return picks.clone();
        }
        let arrangements: BTreeSet<ArrangementId> = self
            .store
            .read_all::<SegmentChoiceArrangement>(self.segment_id)
            .into_iter()
            .filter(|a| a.segment_choice_id == choice_id)
            .map(|a| a.id)
            .collect();
        let mut picks: Vec<SegmentChoiceArrangementPick> = self
            .store
            .read_all::<SegmentChoiceArrangementPick>(self.segment_id)
            .into_iter()
            .filter(|p| arrangements.contains(&p.segment_choice_arrangement_id))
            .cloned()
            .collect();
        picks.sort_by_key(|p| p.start_at_segment_micros);
        self.picks_by_choice.insert(choice_id, picks.clone());
        picks
    }

    pub fn picks(&self) -> Vec<SegmentChoiceArrangementPick> {
        self.store
            .read_all::<SegmentChoiceArrangementPick>(self.segment_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn preferred_audio(&self, parent: &str, ident: &str) -> Option<&'a InstrumentAudio> {
        self.preferred_audios
            .get(&preferred_audio_key(parent, ident))
            .and_then(|id| self.content.audio(*id))
    }

    pub fn put_preferred_audio(&mut self, parent: &str, ident: &str, audio: InstrumentAudioId) {
        self.preferred_audios
            .insert(preferred_audio_key(parent, ident), audio);
    }

    /// Seed from the lineage, newest pick first. Event picks are keyed by
    /// track with both the picked tone and the event's written tones; chord
    /// picks by instrument and chord name.
    fn seed_preferred_audios(&mut self) {
        let content = self.content;
        let mut seeded = BTreeMap::new();
        for pick in self.retrospective.picks() {
            match pick
                .program_sequence_pattern_event_id
                .and_then(|id| content.event(id))
            {
                Some(event) => {
                    let parent = event.program_voice_track_id.to_string();
                    seeded
                        .entry(preferred_audio_key(&parent, &pick.tones))
                        .or_insert(pick.instrument_audio_id);
                    seeded
                        .entry(preferred_audio_key(&parent, &event.tones))
                        .or_insert(pick.instrument_audio_id);
                }
                None => {
                    if let Some(instrument_id) = self.retrospective.instrument_of_pick(pick) {
                        seeded
                            .entry(preferred_audio_key(&instrument_id.to_string(), &pick.tones))
                            .or_insert(pick.instrument_audio_id);
                    }
                }
            }
        }
        self.preferred_audios = seeded;
    }

    /// One-shot, unless the track is one whose written length is observed.
    pub fn is_one_shot(&self, instrument: &Instrument, track_name: Option<&str>) -> bool {
        instrument.config.is_one_shot
            && !track_name.is_some_and(|t| {
                instrument
                    .config
                    .one_shot_observe_length_of_events
                    .iter()
                    .any(|e| e == t)
            })
    }

    pub fn is_one_shot_cutoff_enabled(&self, instrument: &Instrument) -> bool {
        instrument.config.is_one_shot_cutoff_enabled
    }

    pub fn track_name(&self, event: &ProgramSequencePatternEvent) -> String {
        self.content
            .track_of_event(event)
            .map(|t| t.name.clone())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Sticky buns
    // -----------------------------------------------------------------------

    /// The event's bun: this segment's, else the lineage's, else a fresh one
    /// sized to the event's tones and persisted as meta. `None` when sticky
    /// buns are disabled or the event is unknown.
    pub fn sticky_bun(&mut self, event_id: ProgramSequencePatternEventId) -> Result<Option<StickyBun>> {
        if !self.config.sticky_bun_enabled {
            return Ok(None);
        }
        let key = StickyBun::meta_key_for(&event_id.to_string());
        let stored = self
            .meta(&key)
            .or_else(|| self.retrospective.previous_meta(&key).cloned());
        if let Some(meta) = stored {
            match serde_json::from_str::<StickyBun>(&meta.value) {
                Ok(bun) => return Ok(Some(bun)),
                Err(e) => self.add_error_message(format!("Failed to deserialize {key}: {e}"))?,
            }
        }

        let Some(event) = self.content.event(event_id) else {
            self.add_error_message(format!("Failed to get event {event_id} for sticky bun"))?;
            return Ok(None);
        };
        let bun = StickyBun::new(event_id.to_string(), event.tones.split(',').count(), self.rng);
        match serde_json::to_string(&bun) {
            Ok(json) => {
                self.put_meta(&bun.meta_key(), json)?;
            }
            Err(e) => self.add_error_message(format!("Failed to serialize {key}: {e}"))?,
        }
        Ok(Some(bun))
    }

    // -----------------------------------------------------------------------
    // Time
    // -----------------------------------------------------------------------

    pub fn total_segment_micros(&self) -> Result<i64> {
        self.segment()?
            .duration_micros
            .ok_or_else(|| FabricationError::content(format!("segment {} has no duration", self.segment_id)))
    }

    fn describe_choice(&self, choice: &SegmentChoice) -> String {
        let mut parts = Vec::new();
        if let Some(program) = choice.program_id.and_then(|id| self.content.program(id)) {
            parts.push(format!("program={}", program.name));
        }
        if let Some(instrument) = choice.instrument_id.and_then(|id| self.content.instrument(id)) {
            parts.push(format!("instrument={}", instrument.name));
        }
        parts.join(", ")
    }
}

/// Microseconds from segment start to `position` beats at `tempo`.
pub fn segment_micros_at_position(tempo: f64, position: f64) -> i64 {
    if tempo <= 0.0 {
        return 0;
    }
    (MICROS_PER_MINUTE / tempo * position) as i64
}

/// `{ship key or "chain-{id}"}-{begin}`.
pub fn storage_key(chain: &Chain, begin_at_chain_micros: i64) -> String {
    let prefix = if chain.ship_key.is_empty() {
        format!("chain-{}", chain.id)
    } else {
        chain.ship_key.clone()
    };
    format!("{prefix}-{begin_at_chain_micros}")
}

fn preferred_audio_key(parent: &str, ident: &str) -> String {
    format!("{parent}__{ident}")
}

/// Playable notes of a voicing.
pub fn voicing_notes(voicing: &SegmentChordVoicing) -> Vec<Note> {
    voicing.notes.split(',').filter_map(Note::parse).collect()
}

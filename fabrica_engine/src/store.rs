// In-memory segment store for one chain.
//
// Records are partitioned first by segment id and then by record id, so every
// read of "the picks of segment 12" touches only that segment's partition and
// deleting a segment drops all of its records in one step. Segments
// themselves live in a `BTreeMap` keyed by `SegmentId`, which is also the
// chain's ordering.
//
// The store owns the record-id allocator and a logical clock used for
// `created_at_micros`/`updated_at_micros`; both are per-instance state, never
// globals, so independent stores (tests, parallel chains) never interfere.
//
// **Critical constraint: state machine.** `update_segment` is the only way to
// change an existing segment. It validates, checks the state transition
// against the table below, refuses to move a segment to another chain, bumps
// `updated_at_micros` and then overwrites:
//
//   Planned  -> Planned, Crafting
//   Crafting -> Crafting, Crafted, Failed, Planned
//   Crafted  -> Crafted, Crafting
//   Failed   -> Failed
//
// The store performs no locking. One store belongs to one chain and one
// fabrication pass at a time; callers that fabricate chains concurrently give
// each chain its own store or serialize access themselves.

use crate::content::ProgramType;
use crate::entities::*;
use crate::error::{FabricationError, Result};
use crate::ids::*;
use crate::meme::to_meme;
use std::collections::BTreeMap;

/// Every record belonging to one segment.
#[derive(Debug, Clone, Default)]
pub struct SegmentPartition {
    choices: BTreeMap<ChoiceId, SegmentChoice>,
    arrangements: BTreeMap<ArrangementId, SegmentChoiceArrangement>,
    picks: BTreeMap<PickId, SegmentChoiceArrangementPick>,
    chords: BTreeMap<SegmentChordId, SegmentChord>,
    voicings: BTreeMap<VoicingId, SegmentChordVoicing>,
    memes: BTreeMap<MemeId, SegmentMeme>,
    messages: BTreeMap<MessageId, SegmentMessage>,
    metas: BTreeMap<MetaId, SegmentMeta>,
}

/// A record stored in a segment partition.
pub trait SegmentEntity: Clone {
    type Id: Ord + Copy;

    fn id(&self) -> Self::Id;
    fn segment_id(&self) -> SegmentId;
    /// Raw id; 0 means "not yet allocated".
    fn raw_id(&self) -> u64;
    fn assign_id(&mut self, raw: u64);
    fn table(partition: &SegmentPartition) -> &BTreeMap<Self::Id, Self>;
    fn table_mut(partition: &mut SegmentPartition) -> &mut BTreeMap<Self::Id, Self>;

    /// Check and normalize before commit.
    fn validate(&mut self) -> Result<()> {
        Ok(())
    }
}

macro_rules! segment_entity {
    ($ty:ty, $id:ident, $field:ident) => {
        segment_entity!($ty, $id, $field, |_e: &mut $ty| Ok(()));
    };
    ($ty:ty, $id:ident, $field:ident, $validate:expr) => {
        impl SegmentEntity for $ty {
            type Id = $id;

            fn id(&self) -> $id {
                self.id
            }

            fn segment_id(&self) -> SegmentId {
                self.segment_id
            }

            fn raw_id(&self) -> u64 {
                self.id.0
            }

            fn assign_id(&mut self, raw: u64) {
                self.id = $id(raw);
            }

            fn table(partition: &SegmentPartition) -> &BTreeMap<$id, Self> {
                &partition.$field
            }

            fn table_mut(partition: &mut SegmentPartition) -> &mut BTreeMap<$id, Self> {
                &mut partition.$field
            }

            fn validate(&mut self) -> Result<()> {
                let check: fn(&mut $ty) -> Result<()> = $validate;
                check(self)
            }
        }
    };
}

segment_entity!(SegmentChoice, ChoiceId, choices, |e: &mut SegmentChoice| e.check_deltas());
segment_entity!(SegmentChoiceArrangement, ArrangementId, arrangements);
segment_entity!(SegmentChoiceArrangementPick, PickId, picks, |e: &mut SegmentChoiceArrangementPick| {
    if e.length_micros.is_some_and(|l| l < 0) {
        return Err(FabricationError::Validation(format!(
            "pick {} has negative length",
            e.id
        )));
    }
    Ok(())
});
segment_entity!(SegmentChord, SegmentChordId, chords);
segment_entity!(SegmentChordVoicing, VoicingId, voicings);
segment_entity!(SegmentMeme, MemeId, memes, |e: &mut SegmentMeme| {
    e.name = to_meme(&e.name);
    Ok(())
});
segment_entity!(SegmentMessage, MessageId, messages);
segment_entity!(SegmentMeta, MetaId, metas);

#[derive(Debug, Clone, Default)]
pub struct SegmentStore {
    chain: Option<Chain>,
    segments: BTreeMap<SegmentId, Segment>,
    partitions: BTreeMap<SegmentId, SegmentPartition>,
    next_record_id: u64,
    clock: u64,
}

impl SegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next record id, starting at 1.
    pub fn next_record_id(&mut self) -> u64 {
        self.next_record_id += 1;
        self.next_record_id
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    // -----------------------------------------------------------------------
    // Chain
    // -----------------------------------------------------------------------

    pub fn put_chain(&mut self, chain: Chain) {
        self.chain = Some(chain);
    }

    pub fn read_chain(&self) -> Result<&Chain> {
        self.chain.as_ref().ok_or(FabricationError::NoChain)
    }

    pub fn set_chain_state(&mut self, state: ChainState) -> Result<()> {
        let chain = self.chain.as_mut().ok_or(FabricationError::NoChain)?;
        chain.state = state;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Segments
    // -----------------------------------------------------------------------

    /// Create or replace a segment without transition checks. Used when a
    /// segment is first planned.
    pub fn put_segment(&mut self, mut segment: Segment) -> Result<Segment> {
        segment.validate()?;
        let now = self.tick();
        if segment.created_at_micros == 0 {
            segment.created_at_micros = now;
        }
        segment.updated_at_micros = now;
        self.partitions.entry(segment.id).or_default();
        self.segments.insert(segment.id, segment.clone());
        Ok(segment)
    }

    /// The only mutation path for an existing segment.
    pub fn update_segment(&mut self, mut segment: Segment) -> Result<Segment> {
        segment.validate()?;
        if let Some(existing) = self.segments.get(&segment.id) {
            protect_transition(existing.state, segment.state)?;
            if segment.chain_id != existing.chain_id {
                return Err(FabricationError::ChainIdChange);
            }
            segment.created_at_micros = existing.created_at_micros;
        }
        segment.updated_at_micros = self.tick();
        self.partitions.entry(segment.id).or_default();
        self.segments.insert(segment.id, segment.clone());
        Ok(segment)
    }

    pub fn read_segment(&self, id: SegmentId) -> Result<&Segment> {
        self.segments.get(&id).ok_or(FabricationError::NoSegment(id.0))
    }

    pub fn has_segment(&self, id: SegmentId) -> bool {
        self.segments.contains_key(&id)
    }

    /// All segments in id order.
    pub fn read_all_segments(&self) -> Vec<&Segment> {
        self.segments.values().collect()
    }

    pub fn read_segment_last(&self) -> Option<&Segment> {
        self.segments.values().next_back()
    }

    /// Id of the last segment, 0 for an empty chain.
    pub fn read_last_segment_id(&self) -> SegmentId {
        self.segments
            .keys()
            .next_back()
            .copied()
            .unwrap_or(SegmentId(0))
    }

    pub fn read_segment_at_chain_micros(&self, chain_micros: i64) -> Option<&Segment> {
        self.segments
            .values()
            .filter(|s| s.contains_chain_micros(chain_micros))
            .next_back()
    }

    pub fn read_all_segments_spanning(&self, from: i64, to: i64) -> Vec<&Segment> {
        self.segments
            .values()
            .filter(|s| s.is_spanning(from, to))
            .collect()
    }

    pub fn get_segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn delete_segment(&mut self, id: SegmentId) {
        self.segments.remove(&id);
        self.partitions.remove(&id);
    }

    /// Delete every segment with an id lower than `id`.
    pub fn delete_segments_before(&mut self, id: SegmentId) {
        self.segments.retain(|k, _| *k >= id);
        self.partitions.retain(|k, _| *k >= id);
    }

    /// Delete every segment with an id higher than `id`.
    pub fn delete_segments_after(&mut self, id: SegmentId) {
        self.segments.retain(|k, _| *k <= id);
        self.partitions.retain(|k, _| *k <= id);
    }

    /// Drop the chain and every segment.
    pub fn clear(&mut self) {
        self.chain = None;
        self.segments.clear();
        self.partitions.clear();
    }

    // -----------------------------------------------------------------------
    // Partitioned records
    // -----------------------------------------------------------------------

    /// Validate and store a record, allocating an id when it has none. The
    /// owning segment must exist.
    pub fn put<T: SegmentEntity>(&mut self, mut entity: T) -> Result<T> {
        entity.validate()?;
        if entity.raw_id() == 0 {
            let raw = self.next_record_id();
            entity.assign_id(raw);
        }
        let segment_id = entity.segment_id();
        if !self.segments.contains_key(&segment_id) {
            return Err(FabricationError::NoSegment(segment_id.0));
        }
        let partition = self.partitions.entry(segment_id).or_default();
        T::table_mut(partition).insert(entity.id(), entity.clone());
        Ok(entity)
    }

    pub fn read<T: SegmentEntity>(&self, segment_id: SegmentId, id: T::Id) -> Option<&T> {
        self.partitions
            .get(&segment_id)
            .and_then(|p| T::table(p).get(&id))
    }

    /// Records of one kind for a segment, in id (insertion) order.
    pub fn read_all<T: SegmentEntity>(&self, segment_id: SegmentId) -> Vec<&T> {
        self.partitions
            .get(&segment_id)
            .map(|p| T::table(p).values().collect())
            .unwrap_or_default()
    }

    pub fn delete<T: SegmentEntity>(&mut self, segment_id: SegmentId, id: T::Id) {
        if let Some(p) = self.partitions.get_mut(&segment_id) {
            T::table_mut(p).remove(&id);
        }
    }

    pub fn delete_all<T: SegmentEntity>(&mut self, segment_id: SegmentId) {
        if let Some(p) = self.partitions.get_mut(&segment_id) {
            T::table_mut(p).clear();
        }
    }

    /// The first choice of a segment for a given program type.
    pub fn read_choice(&self, segment_id: SegmentId, program_type: ProgramType) -> Option<&SegmentChoice> {
        self.read_all::<SegmentChoice>(segment_id)
            .into_iter()
            .find(|c| c.program_type == Some(program_type))
    }

    pub fn read_ordered_segment_chords(&self, segment_id: SegmentId) -> Vec<&SegmentChord> {
        let mut chords = self.read_all::<SegmentChord>(segment_id);
        chords.sort_by(|a, b| a.position.total_cmp(&b.position));
        chords
    }
}

fn protect_transition(from: SegmentState, to: SegmentState) -> Result<()> {
    use SegmentState::*;
    let allowed: &[SegmentState] = match from {
        Planned => &[Planned, Crafting],
        Crafting => &[Crafting, Crafted, Failed, Planned],
        Crafted => &[Crafted, Crafting],
        Failed => &[Failed],
    };
    if allowed.contains(&to) {
        return Ok(());
    }
    Err(FabricationError::Transition {
        to,
        allowed: allowed
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(","),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Chain {
        Chain {
            id: ChainId(7),
            name: "test".into(),
            template_id: None,
            template_config: String::new(),
            ship_key: "ship".into(),
            state: ChainState::Fabricate,
        }
    }

    fn segment(id: u32, begin: i64, duration: Option<i64>) -> Segment {
        Segment {
            id: SegmentId(id),
            chain_id: ChainId(7),
            segment_type: SegmentType::Pending,
            state: SegmentState::Planned,
            delta: 0,
            total: 16,
            tempo: 120.0,
            key: "C".into(),
            intensity: 0.5,
            begin_at_chain_micros: begin,
            duration_micros: duration,
            storage_key: String::new(),
            created_at_micros: 0,
            updated_at_micros: 0,
        }
    }

    fn with_state(mut s: Segment, state: SegmentState) -> Segment {
        s.state = state;
        s
    }

    #[test]
    fn planned_to_crafted_is_rejected() {
        let mut store = SegmentStore::new();
        store.put_segment(segment(0, 0, None)).unwrap();
        let err = store
            .update_segment(with_state(segment(0, 0, None), SegmentState::Crafted))
            .unwrap_err();
        assert_eq!(err.to_string(), "transition to Crafted not in allowed (Planned,Crafting)");
        assert!(err.is_fatal());
    }

    #[test]
    fn planned_crafting_crafted_then_recraft() {
        let mut store = SegmentStore::new();
        store.put_segment(segment(0, 0, None)).unwrap();
        for state in [SegmentState::Crafting, SegmentState::Crafted, SegmentState::Crafting] {
            store.update_segment(with_state(segment(0, 0, None), state)).unwrap();
        }
        assert_eq!(store.read_segment(SegmentId(0)).unwrap().state, SegmentState::Crafting);
    }

    #[test]
    fn failed_is_terminal() {
        let mut store = SegmentStore::new();
        store.put_segment(with_state(segment(0, 0, None), SegmentState::Failed)).unwrap();
        assert!(store
            .update_segment(with_state(segment(0, 0, None), SegmentState::Crafting))
            .is_err());
        assert!(store
            .update_segment(with_state(segment(0, 0, None), SegmentState::Failed))
            .is_ok());
    }

    #[test]
    fn update_rejects_chain_change_and_bumps_clock() {
        let mut store = SegmentStore::new();
        let created = store.put_segment(segment(0, 0, None)).unwrap();
        let mut moved = segment(0, 0, None);
        moved.chain_id = ChainId(8);
        assert!(matches!(
            store.update_segment(moved),
            Err(FabricationError::ChainIdChange)
        ));
        let updated = store.update_segment(segment(0, 0, Some(5))).unwrap();
        assert!(updated.updated_at_micros > created.updated_at_micros);
        assert_eq!(updated.created_at_micros, created.created_at_micros);
    }

    #[test]
    fn records_are_partitioned_and_ids_allocated() {
        let mut store = SegmentStore::new();
        store.put_chain(chain());
        store.put_segment(segment(0, 0, None)).unwrap();
        store.put_segment(segment(1, 0, None)).unwrap();
        let a = store
            .put(SegmentMeme {
                id: MemeId(0),
                segment_id: SegmentId(0),
                name: "red!".into(),
            })
            .unwrap();
        let b = store
            .put(SegmentMeme {
                id: MemeId(0),
                segment_id: SegmentId(1),
                name: "Blue".into(),
            })
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.name, "RED");
        assert_eq!(store.read_all::<SegmentMeme>(SegmentId(0)).len(), 1);
        assert_eq!(store.read::<SegmentMeme>(SegmentId(1), b.id).unwrap().name, "BLUE");
        assert!(store.read::<SegmentMeme>(SegmentId(0), b.id).is_none());
        assert!(store
            .put(SegmentMeme {
                id: MemeId(0),
                segment_id: SegmentId(9),
                name: "X".into(),
            })
            .is_err());
    }

    #[test]
    fn invalid_choice_is_refused() {
        let mut store = SegmentStore::new();
        store.put_segment(segment(0, 0, None)).unwrap();
        let mut choice = SegmentChoice::new(SegmentId(0));
        choice.delta_in = 10;
        choice.delta_out = 5;
        assert!(matches!(store.put(choice), Err(FabricationError::Validation(_))));
    }

    #[test]
    fn retention_trimming_drops_partitions() {
        let mut store = SegmentStore::new();
        for id in 0..5 {
            store.put_segment(segment(id, id as i64 * 100, Some(100))).unwrap();
            store
                .put(SegmentMessage {
                    id: MessageId(0),
                    segment_id: SegmentId(id),
                    message_type: SegmentMessageType::Info,
                    body: format!("seg {id}"),
                })
                .unwrap();
        }
        store.delete_segments_before(SegmentId(2));
        store.delete_segments_after(SegmentId(3));
        let ids: Vec<u32> = store.read_all_segments().iter().map(|s| s.id.0).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(store.read_all::<SegmentMessage>(SegmentId(0)).is_empty());
        assert!(store.read_all::<SegmentMessage>(SegmentId(4)).is_empty());
        assert_eq!(store.read_all::<SegmentMessage>(SegmentId(3)).len(), 1);
        assert_eq!(store.read_last_segment_id(), SegmentId(3));
    }

    #[test]
    fn temporal_queries() {
        let mut store = SegmentStore::new();
        store.put_segment(segment(0, 0, Some(1_000))).unwrap();
        store.put_segment(segment(1, 1_000, Some(1_000))).unwrap();
        store.put_segment(segment(2, 2_000, None)).unwrap();
        assert_eq!(store.read_segment_at_chain_micros(1_000).unwrap().id, SegmentId(1));
        assert_eq!(store.read_segment_at_chain_micros(999_999).unwrap().id, SegmentId(2));
        let spanning: Vec<u32> = store
            .read_all_segments_spanning(500, 1_500)
            .iter()
            .map(|s| s.id.0)
            .collect();
        assert_eq!(spanning, vec![0, 1]);
        assert_eq!(store.get_segment_count(), 3);
        store.delete_segment(SegmentId(1));
        assert!(store.read_segment(SegmentId(1)).is_err());
        store.clear();
        assert!(store.is_empty());
        assert!(matches!(store.read_chain(), Err(FabricationError::NoChain)));
    }

    #[test]
    fn ordered_chords_and_choice_by_type() {
        let mut store = SegmentStore::new();
        store.put_segment(segment(0, 0, None)).unwrap();
        for (name, position) in [("G", 8.0), ("C", 0.0), ("F", 4.0)] {
            store
                .put(SegmentChord {
                    id: SegmentChordId(0),
                    segment_id: SegmentId(0),
                    name: name.into(),
                    position,
                })
                .unwrap();
        }
        let names: Vec<&str> = store
            .read_ordered_segment_chords(SegmentId(0))
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["C", "F", "G"]);

        let mut main = SegmentChoice::new(SegmentId(0));
        main.program_type = Some(ProgramType::Main);
        store.put(main).unwrap();
        assert!(store.read_choice(SegmentId(0), ProgramType::Main).is_some());
        assert!(store.read_choice(SegmentId(0), ProgramType::Macro).is_none());
    }
}

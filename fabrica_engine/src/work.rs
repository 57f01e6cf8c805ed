// Chain driver: plans segments one after another and runs the craft
// pipeline over each.
//
// `ChainWork` owns the chain's `SegmentStore` and random generator and
// borrows the read-only `ContentStore`. Each `fabricate_next` call appends
// one segment directly after the last (begin = previous begin + previous
// duration), walks it Planned -> Crafting, runs every `CraftStage` in order
// and finishes at Crafted.
//
// Error policy per stage:
// - a recoverable error from Beat, Detail, Background or Transition becomes
//   an error message on the segment and the remaining stages still run;
// - any error from Macro/Main is escalated, since a segment without tempo,
//   length or harmony cannot be played or followed;
// - a fatal error marks the segment Failed and the chain Failed, and is
//   returned. A failed chain refuses further work until it is rebuilt.
//
// **Critical constraint:** the store is not synchronized. One `ChainWork`
// per chain; callers that fabricate chains in parallel give each its own.
//
// See also: `craft/mod.rs` for the pipeline, `store.rs` for the state
// transition table.

use crate::content::ContentStore;
use crate::craft::CraftStage;
use crate::entities::*;
use crate::error::{FabricationError, Result};
use crate::fabricator::{Fabricator, FabricatorOverrides};
use crate::ids::*;
use crate::store::SegmentStore;
use fabrica_prng::FabRng;
use std::collections::BTreeSet;
use tracing::{info, warn};

pub struct ChainWork<'c> {
    store: SegmentStore,
    content: &'c ContentStore,
    rng: FabRng,
}

impl<'c> ChainWork<'c> {
    pub fn new(chain: Chain, content: &'c ContentStore, seed: u64) -> Self {
        let mut store = SegmentStore::new();
        store.put_chain(chain);
        ChainWork {
            store,
            content,
            rng: FabRng::new(seed),
        }
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SegmentStore {
        &mut self.store
    }

    // -----------------------------------------------------------------------
    // Planning
    // -----------------------------------------------------------------------

    /// Segment 0 of `chain_id`, at the start of the chain.
    pub fn build_segment_initial(chain_id: ChainId) -> Segment {
        Segment {
            id: SegmentId(0),
            chain_id,
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

    /// The segment directly after `last`. Fatal while `last` has no
    /// duration, since the new segment would have no start time.
    pub fn build_segment_following(last: &Segment) -> Result<Segment> {
        let end = last.end_at_chain_micros().ok_or_else(|| {
            FabricationError::fatal(format!("segment {} has no duration to follow", last.id))
        })?;
        Ok(Segment {
            id: SegmentId(last.id.0 + 1),
            delta: last.delta,
            begin_at_chain_micros: end,
            ..Self::build_segment_initial(last.chain_id)
        })
    }

    // -----------------------------------------------------------------------
    // Fabrication
    // -----------------------------------------------------------------------

    /// Plan and craft the next segment of the chain.
    pub fn fabricate_next(&mut self, overrides: FabricatorOverrides) -> Result<Segment> {
        let chain = self.store.read_chain()?.clone();
        if chain.state == ChainState::Failed {
            return Err(FabricationError::fatal(format!("chain {} has failed", chain.id)));
        }
        let planned = match self.store.read_segment_last() {
            Some(last) => Self::build_segment_following(last)?,
            None => Self::build_segment_initial(chain.id),
        };
        let segment_id = planned.id;
        self.store.put_segment(planned)?;
        self.set_segment_state(segment_id, SegmentState::Crafting)?;

        match self.craft(segment_id, overrides) {
            Ok(()) => {
                let segment = self.set_segment_state(segment_id, SegmentState::Crafted)?;
                info!(
                    chain_id = chain.id.0,
                    segment_id = segment_id.0,
                    segment_type = ?segment.segment_type,
                    begin = segment.begin_at_chain_micros,
                    duration = ?segment.duration_micros,
                    "segment crafted"
                );
                Ok(segment)
            }
            Err(e) => {
                warn!(chain_id = chain.id.0, segment_id = segment_id.0, error = %e, "fabrication failed");
                if self.store.has_segment(segment_id) {
                    self.set_segment_state(segment_id, SegmentState::Failed)?;
                }
                self.store.set_chain_state(ChainState::Failed)?;
                Err(e)
            }
        }
    }

    fn craft(&mut self, segment_id: SegmentId, overrides: FabricatorOverrides) -> Result<()> {
        let mut fab = Fabricator::new(&mut self.store, self.content, &mut self.rng, segment_id, overrides)?;
        for stage in CraftStage::PIPELINE {
            match stage.run(&mut fab) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if stage == CraftStage::MacroMain => {
                    return Err(FabricationError::fatal(format!("{} stage: {e}", stage.name())));
                }
                Err(e) => fab.add_error_message(format!("{} stage failed: {e}", stage.name()))?,
            }
        }
        Ok(())
    }

    fn set_segment_state(&mut self, segment_id: SegmentId, state: SegmentState) -> Result<Segment> {
        let mut segment = self.store.read_segment(segment_id)?.clone();
        segment.state = state;
        self.store.update_segment(segment)
    }

    /// Fabricate until the chain reaches `chain_micros`. Returns the new
    /// segments.
    pub fn fabricate_until(&mut self, chain_micros: i64) -> Result<Vec<Segment>> {
        let mut made = Vec::new();
        loop {
            if let Some(last) = self.store.read_segment_last()
                && last.end_at_chain_micros().unwrap_or(last.begin_at_chain_micros) >= chain_micros
            {
                return Ok(made);
            }
            let segment = self.fabricate_next(FabricatorOverrides::default())?;
            if segment.duration_micros.unwrap_or(0) <= 0 {
                return Err(FabricationError::fatal(format!(
                    "segment {} has no length; chain cannot advance",
                    segment.id
                )));
            }
            made.push(segment);
        }
    }

    /// Delete every segment before the one playing at `keep_from_micros`.
    /// Returns how many were removed.
    pub fn cleanup(&mut self, keep_from_micros: i64) -> usize {
        let Some(keep) = self
            .store
            .read_segment_at_chain_micros(keep_from_micros)
            .map(|s| s.id)
        else {
            return 0;
        };
        let before = self.store.get_segment_count();
        self.store.delete_segments_before(keep);
        let removed = before - self.store.get_segment_count();
        if removed > 0 {
            info!(keep_from = keep.0, removed, "cleaned up segments");
        }
        removed
    }

    /// Drop everything after `current` and fabricate its successor again
    /// with overrides. A macro override starts a new macro cycle.
    pub fn rewrite_following(
        &mut self,
        current: SegmentId,
        macro_program: Option<ProgramId>,
        memes: Option<BTreeSet<String>>,
    ) -> Result<Segment> {
        self.store.read_segment(current)?;
        self.store.delete_segments_after(current);
        let overrides = FabricatorOverrides {
            segment_type: macro_program.map(|_| SegmentType::NextMacro),
            macro_program,
            memes,
        };
        self.fabricate_next(overrides)
    }

    /// Shorten the last segment to `total` beats and `duration_micros`.
    /// Picks starting at or past the new end are removed, the rest clipped.
    pub fn cutoff_last_segment(&mut self, total: u32, duration_micros: i64) -> Result<Segment> {
        let mut segment = self
            .store
            .read_segment_last()
            .cloned()
            .ok_or_else(|| FabricationError::fatal("no segment to cut off"))?;
        segment.total = total;
        segment.duration_micros = Some(duration_micros);
        let segment = self.store.update_segment(segment)?;

        let picks: Vec<SegmentChoiceArrangementPick> = self
            .store
            .read_all::<SegmentChoiceArrangementPick>(segment.id)
            .into_iter()
            .cloned()
            .collect();
        for mut pick in picks {
            let start = pick.start_at_segment_micros;
            if start >= duration_micros {
                self.store
                    .delete::<SegmentChoiceArrangementPick>(segment.id, pick.id);
                continue;
            }
            let limit = duration_micros - start;
            if pick.length_micros.is_none_or(|length| length > limit) {
                pick.length_micros = Some(limit);
                self.store.put(pick)?;
            }
        }
        Ok(segment)
    }
}

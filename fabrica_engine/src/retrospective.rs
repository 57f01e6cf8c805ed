// Read-only view of a segment's history within its main-program lineage.
//
// Craft stages continue what came before: the same beat instrument keeps
// playing through a Continue segment, a persistent instrument reuses the same
// samples, a sticky bun rolled three segments ago is honored today. They ask
// the `Retrospective` rather than the store, so they only ever see the
// segments that belong to the current lineage.
//
// The lineage is the previous segment plus every earlier segment, walking
// backwards, whose Main choice used the same program as the previous
// segment's. The walk stops at the first segment with a different (or no)
// main program.
//
// Records are cloned out of the store at load time, so the view stays valid
// while the Fabricator mutates the current segment.

use crate::content::ProgramType;
use crate::entities::*;
use crate::error::{FabricationError, Result};
use crate::ids::*;
use crate::store::SegmentStore;
use rustc_hash::FxHashMap;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct Retrospective {
    /// Newest first.
    segments: Vec<Segment>,
    /// Grouped by segment, newest segment first.
    choices: Vec<SegmentChoice>,
    arrangements: Vec<SegmentChoiceArrangement>,
    picks: Vec<SegmentChoiceArrangementPick>,
    metas: Vec<SegmentMeta>,
}

impl Retrospective {
    /// Build the history for `segment_id`. The first segment of a chain has
    /// none. A missing predecessor or a predecessor without a Main choice
    /// is fatal.
    pub fn load(store: &SegmentStore, segment_id: SegmentId) -> Result<Self> {
        if segment_id.is_first() {
            return Ok(Self::default());
        }
        let previous_id = SegmentId(segment_id.0 - 1);
        let previous = store.read_segment(previous_id)?;
        let main_program_id = store
            .read_choice(previous_id, ProgramType::Main)
            .and_then(|c| c.program_id)
            .ok_or_else(|| {
                FabricationError::fatal(format!(
                    "retrospective sees no main choice in segment {previous_id}"
                ))
            })?;

        let mut retro = Retrospective {
            segments: vec![previous.clone()],
            ..Default::default()
        };
        let mut cursor = previous_id.0;
        while cursor > 0 {
            let id = SegmentId(cursor - 1);
            let same_lineage = store
                .read_choice(id, ProgramType::Main)
                .and_then(|c| c.program_id)
                == Some(main_program_id);
            match store.read_segment(id) {
                Ok(segment) if same_lineage => retro.segments.push(segment.clone()),
                _ => break,
            }
            cursor -= 1;
        }

        for segment in &retro.segments {
            retro
                .choices
                .extend(store.read_all::<SegmentChoice>(segment.id).into_iter().cloned());
            retro.arrangements.extend(
                store
                    .read_all::<SegmentChoiceArrangement>(segment.id)
                    .into_iter()
                    .cloned(),
            );
            retro.picks.extend(
                store
                    .read_all::<SegmentChoiceArrangementPick>(segment.id)
                    .into_iter()
                    .cloned(),
            );
            retro
                .metas
                .extend(store.read_all::<SegmentMeta>(segment.id).into_iter().cloned());
        }
        debug!(
            segment_id = segment_id.0,
            lineage = retro.segments.len(),
            choices = retro.choices.len(),
            "loaded retrospective"
        );
        Ok(retro)
    }

    pub fn previous_segment(&self) -> Option<&Segment> {
        self.segments.first()
    }

    /// Lineage segments, newest first.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Every choice in the lineage, newest segment first.
    pub fn choices(&self) -> &[SegmentChoice] {
        &self.choices
    }

    /// Choices of the immediately previous segment.
    pub fn previous_choices(&self) -> Vec<&SegmentChoice> {
        match self.previous_segment() {
            Some(previous) => self
                .choices
                .iter()
                .filter(|c| c.segment_id == previous.id)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn previous_choice_of_type(&self, program_type: ProgramType) -> Option<&SegmentChoice> {
        self.previous_choices()
            .into_iter()
            .find(|c| c.program_type == Some(program_type))
    }

    pub fn picks(&self) -> &[SegmentChoiceArrangementPick] {
        &self.picks
    }

    /// Picks, across the lineage, whose choice used `instrument_id`.
    pub fn previous_picks_for_instrument(
        &self,
        instrument_id: InstrumentId,
    ) -> Vec<&SegmentChoiceArrangementPick> {
        let choice_instruments: FxHashMap<ChoiceId, Option<InstrumentId>> = self
            .choices
            .iter()
            .map(|c| (c.id, c.instrument_id))
            .collect();
        let arrangement_instruments: FxHashMap<ArrangementId, Option<InstrumentId>> = self
            .arrangements
            .iter()
            .map(|a| {
                let instrument = choice_instruments
                    .get(&a.segment_choice_id)
                    .copied()
                    .flatten();
                (a.id, instrument)
            })
            .collect();
        self.picks
            .iter()
            .filter(|p| {
                arrangement_instruments
                    .get(&p.segment_choice_arrangement_id)
                    .copied()
                    .flatten()
                    == Some(instrument_id)
            })
            .collect()
    }

    /// Instrument of the choice that owns `pick`, if it is in the lineage.
    pub fn instrument_of_pick(&self, pick: &SegmentChoiceArrangementPick) -> Option<InstrumentId> {
        let arrangement = self
            .arrangements
            .iter()
            .find(|a| a.id == pick.segment_choice_arrangement_id)?;
        self.choices
            .iter()
            .find(|c| c.id == arrangement.segment_choice_id)
            .and_then(|c| c.instrument_id)
    }

    /// Newest value stored under `key` anywhere in the lineage.
    pub fn previous_meta(&self, key: &str) -> Option<&SegmentMeta> {
        self.metas.iter().find(|m| m.key == key)
    }
}

// Delta arcs: staggered layer entrances across a main program.
//
// A segment's `delta` is its position in beats along the running main
// program. Each layer (a beat voice, a detail instrument type) gets a
// `delta_in`: the delta at which it starts sounding. Layers enter one after
// another as the program plays on, which builds intensity over several
// segments. `delta_out` is always unbounded here: once a layer is in it stays
// until the program itself changes.
//
// Planning happens when a new main program starts (Initial, NextMain,
// NextMacro). Continue segments inherit each layer's window from the most
// recent matching choice in the lineage. A disabled template, or a segment
// still Pending, leaves every layer unbounded.
//
// Entry points are snapped to bar subsections. The first entry is shifted
// back by `incoming` double-subsections so that roughly that many layers are
// already in when the program starts.
//
// See also: `craft/beat.rs` and `craft/detail.rs` (the callers),
// `fabrica_music::Bar` for the subsection size.

use crate::entities::{DELTA_UNLIMITED, SegmentChoice, SegmentType};
use fabrica_music::Bar;
use fabrica_prng::FabRng;
use std::collections::BTreeMap;

/// Planned windows per layer. Layers without an entry are unbounded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaArcs {
    ins: BTreeMap<String, i32>,
    outs: BTreeMap<String, i32>,
    prioritized: Vec<String>,
}

impl DeltaArcs {
    pub fn delta_in(&self, layer: &str) -> i32 {
        self.ins.get(layer).copied().unwrap_or(DELTA_UNLIMITED)
    }

    pub fn delta_out(&self, layer: &str) -> i32 {
        self.outs.get(layer).copied().unwrap_or(DELTA_UNLIMITED)
    }

    /// Layers that matched a prioritization token, in entry order.
    pub fn prioritized(&self) -> &[String] {
        &self.prioritized
    }
}

/// Everything the planner needs to know about the segment being crafted.
#[derive(Debug, Clone)]
pub struct DeltaArcPlan<'a> {
    pub enabled: bool,
    pub segment_type: SegmentType,
    /// Segment length in beats.
    pub total: u32,
    pub bar_beats: u32,
    pub layers: &'a [String],
    /// Case-insensitive substrings of layer names that enter first.
    pub prioritize: &'a [String],
    /// Layers that should already be in when the program starts.
    pub incoming: u32,
}

/// Plan delta windows. `history` is the lineage's choices, newest first;
/// `layer_of` maps a choice to its layer name, or `None` for choices that
/// do not take part.
pub fn precompute(
    plan: &DeltaArcPlan<'_>,
    history: &[SegmentChoice],
    layer_of: impl Fn(&SegmentChoice) -> Option<String>,
    rng: &mut FabRng,
) -> DeltaArcs {
    let mut arcs = DeltaArcs::default();
    if !plan.enabled {
        for layer in plan.layers {
            arcs.ins.insert(layer.clone(), DELTA_UNLIMITED);
            arcs.outs.insert(layer.clone(), DELTA_UNLIMITED);
        }
        return arcs;
    }

    match plan.segment_type {
        SegmentType::Pending => {}

        SegmentType::Initial | SegmentType::NextMain | SegmentType::NextMacro => {
            let unit = Bar::of(plan.bar_beats).subsection_beats(plan.total).max(1) as i64;
            let tokens: Vec<String> = plan.prioritize.iter().map(|t| t.to_lowercase()).collect();
            let (mut primary, mut secondary): (Vec<String>, Vec<String>) =
                plan.layers.iter().cloned().partition(|layer| {
                    let name = layer.to_lowercase();
                    tokens.iter().any(|t| name.contains(t.as_str()))
                });
            rng.shuffle(&mut primary);
            rng.shuffle(&mut secondary);
            arcs.prioritized = primary.clone();

            let mut ordered = primary;
            ordered.extend(secondary);
            // The concatenated order is shuffled once more, so prioritization
            // only survives as a grouping input to the draw.
            rng.shuffle(&mut ordered);

            let first = rng.range_u64(0, (unit * 4) as u64) as i64 - unit * 2 * plan.incoming as i64;
            let mut delta = round_to_nearest(unit, first);
            for layer in ordered {
                let delta_in = if delta > 0 {
                    i32::try_from(delta).unwrap_or(i32::MAX)
                } else {
                    DELTA_UNLIMITED
                };
                arcs.ins.insert(layer.clone(), delta_in);
                arcs.outs.insert(layer, DELTA_UNLIMITED);
                delta += round_to_nearest(unit, rng.range_u64(0, (unit * 5) as u64) as i64);
            }
        }

        SegmentType::Continue => {
            for layer in plan.layers {
                let inherited = history
                    .iter()
                    .find(|c| layer_of(c).as_deref() == Some(layer.as_str()));
                if let Some(choice) = inherited {
                    arcs.ins.insert(layer.clone(), choice.delta_in);
                    arcs.outs.insert(layer.clone(), choice.delta_out);
                }
            }
        }
    }
    arcs
}

/// `value` rounded to the nearest multiple of `unit`.
fn round_to_nearest(unit: i64, value: i64) -> i64 {
    if unit <= 0 {
        return value;
    }
    ((value as f64 / unit as f64).round() as i64) * unit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SegmentId;

    fn layers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn plan<'a>(
        enabled: bool,
        segment_type: SegmentType,
        layers: &'a [String],
        prioritize: &'a [String],
    ) -> DeltaArcPlan<'a> {
        DeltaArcPlan {
            enabled,
            segment_type,
            total: 32,
            bar_beats: 4,
            layers,
            prioritize,
            incoming: 1,
        }
    }

    #[test]
    fn disabled_leaves_every_layer_unbounded() {
        let names = layers(&["Kick", "Snare", "Hat"]);
        let mut history = vec![SegmentChoice::new(SegmentId(0))];
        history[0].delta_in = 64;
        for seed in 0..20 {
            for segment_type in [SegmentType::Initial, SegmentType::Continue, SegmentType::NextMacro] {
                let arcs = precompute(
                    &plan(false, segment_type, &names, &[]),
                    &history,
                    |_| Some("Kick".into()),
                    &mut FabRng::new(seed),
                );
                for name in &names {
                    assert_eq!(arcs.delta_in(name), DELTA_UNLIMITED);
                    assert_eq!(arcs.delta_out(name), DELTA_UNLIMITED);
                }
            }
        }
    }

    #[test]
    fn new_program_staggers_entries_on_subsection_grid() {
        let names = layers(&["Kick", "Snare", "Hat", "Ride", "Tom"]);
        for seed in 0..50 {
            let arcs = precompute(
                &plan(true, SegmentType::NextMain, &names, &[]),
                &[],
                |_| None,
                &mut FabRng::new(seed),
            );
            let bounded: Vec<i32> = names
                .iter()
                .map(|n| arcs.delta_in(n))
                .filter(|d| *d != DELTA_UNLIMITED)
                .collect();
            for d in &bounded {
                assert!(*d > 0);
                assert_eq!(d % 16, 0, "delta {d} off the 16-beat grid");
            }
            for name in &names {
                assert_eq!(arcs.delta_out(name), DELTA_UNLIMITED);
            }
        }
    }

    #[test]
    fn continue_inherits_newest_matching_window() {
        let names = layers(&["Kick", "Snare"]);
        let mut newest = SegmentChoice::new(SegmentId(2));
        newest.delta_in = 48;
        newest.delta_out = DELTA_UNLIMITED;
        let mut older = SegmentChoice::new(SegmentId(1));
        older.delta_in = 16;
        let history = vec![newest, older];
        let arcs = precompute(
            &plan(true, SegmentType::Continue, &names, &[]),
            &history,
            |_| Some("Kick".into()),
            &mut FabRng::new(1),
        );
        assert_eq!(arcs.delta_in("Kick"), 48);
        assert_eq!(arcs.delta_out("Kick"), DELTA_UNLIMITED);
        assert_eq!(arcs.delta_in("Snare"), DELTA_UNLIMITED);
    }

    #[test]
    fn prioritized_layers_are_reported() {
        let names = layers(&["Big Kick", "Snare", "kick 2"]);
        let tokens = layers(&["KICK"]);
        let arcs = precompute(
            &plan(true, SegmentType::Initial, &names, &tokens),
            &[],
            |_| None,
            &mut FabRng::new(9),
        );
        let mut prioritized = arcs.prioritized().to_vec();
        prioritized.sort();
        assert_eq!(prioritized, layers(&["Big Kick", "kick 2"]));
    }

    #[test]
    fn pending_plans_nothing() {
        let names = layers(&["Kick"]);
        let arcs = precompute(
            &plan(true, SegmentType::Pending, &names, &[]),
            &[],
            |_| None,
            &mut FabRng::new(1),
        );
        assert_eq!(arcs, DeltaArcs::default());
    }

    #[test]
    fn rounding() {
        assert_eq!(round_to_nearest(16, 23), 16);
        assert_eq!(round_to_nearest(16, 24), 32);
        assert_eq!(round_to_nearest(16, -20), -16);
        assert_eq!(round_to_nearest(0, 5), 5);
    }
}

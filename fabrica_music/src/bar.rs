// Bar arithmetic.
//
// Delta arcs and transition hits are snapped to "subsections" of a segment: a
// power-of-two number of bars that divides the segment evenly and is at most
// half of it. A 16-beat segment in 4/4 (four bars) subdivides into 8-beat
// halves; 32 beats (eight bars) into 16-beat halves; a single bar is its own
// subsection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub beats: u32,
}

impl Bar {
    pub fn of(beats: u32) -> Self {
        Bar { beats }
    }

    /// Beats in one subsection of a `total_beats` span. Falls back to the
    /// whole span when it is shorter than two bars or the bar is empty.
    pub fn subsection_beats(&self, total_beats: u32) -> u32 {
        if self.beats == 0 {
            return total_beats;
        }
        let bars = total_beats / self.beats;
        if bars < 2 {
            return total_beats;
        }
        let mut sub = 1;
        while bars % (sub * 2) == 0 && sub * 2 <= bars / 2 {
            sub *= 2;
        }
        sub * self.beats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsections_of_common_lengths() {
        let bar = Bar::of(4);
        assert_eq!(bar.subsection_beats(16), 8);
        assert_eq!(bar.subsection_beats(32), 16);
        assert_eq!(bar.subsection_beats(8), 4);
        assert_eq!(bar.subsection_beats(4), 4);
        assert_eq!(bar.subsection_beats(24), 4 * 2);
        assert_eq!(bar.subsection_beats(12), 4);
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(Bar::of(0).subsection_beats(16), 16);
        assert_eq!(Bar::of(4).subsection_beats(2), 2);
        assert_eq!(Bar::of(3).subsection_beats(12), 6);
    }
}

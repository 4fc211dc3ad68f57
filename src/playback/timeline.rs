//! One logical timeline over consecutive segments.
//!
//! Positions are either global (milliseconds from the start of the first
//! segment) or local (`(segment index, offset in that segment)`). Segments
//! whose duration could not be probed count as zero length.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    durations: Vec<u64>,
}

impl Timeline {
    pub fn new(durations: Vec<u64>) -> Self {
        Self { durations }
    }

    pub fn len(&self) -> usize {
        self.durations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }

    pub fn total_ms(&self) -> u64 {
        self.durations.iter().sum()
    }

    /// Global position of `offset_ms` into segment `index`.
    ///
    /// The offset is clamped to the segment's length when it is known.
    pub fn global_position(&self, index: usize, offset_ms: u64) -> u64 {
        let index = index.min(self.durations.len());
        let before: u64 = self.durations[..index].iter().sum();
        let offset = match self.durations.get(index) {
            Some(&d) if d > 0 => offset_ms.min(d),
            _ => offset_ms,
        };
        before + offset
    }

    /// Translate a global position into `(segment, offset)`.
    ///
    /// Negative positions clamp to the start of segment 0; positions at or
    /// past the end clamp to the end of the last segment.
    pub fn locate(&self, global_ms: i64) -> (usize, u64) {
        let Some(last) = self.durations.len().checked_sub(1) else {
            return (0, 0);
        };
        let target = global_ms.clamp(0, self.total_ms() as i64) as u64;

        let mut start = 0u64;
        for (index, &duration) in self.durations.iter().enumerate() {
            if target < start + duration {
                return (index, target - start);
            }
            start += duration;
        }
        (last, self.durations[last])
    }

    /// Move `delta_ms` from `(index, offset_ms)` along the timeline.
    ///
    /// A zero delta returns the position unchanged.
    pub fn seek_relative(&self, index: usize, offset_ms: u64, delta_ms: i64) -> (usize, u64) {
        if delta_ms == 0 {
            return (index, offset_ms);
        }
        let here = self.global_position(index, offset_ms) as i64;
        self.locate(here.saturating_add(delta_ms))
    }
}

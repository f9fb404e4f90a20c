//! Frame-difference motion analysis.
//!
//! The motion level of frame `i` is the mean absolute grayscale difference
//! between frames `i-1` and `i` (0–255 scale); frame 0 has level 0.0, so the
//! level index equals the frame index.  Levels are turned into a per-frame
//! motion mask, and the mask into the frame window worth keeping.

/// Consecutive quiet frames that end an active segment.
pub const SEGMENT_END_QUIET_FRAMES: usize = 5;

/// Mean absolute difference of two equally sized grayscale frames.
pub fn frame_motion_level(prev: &[u8], cur: &[u8]) -> f64 {
    let n = prev.len().min(cur.len());
    if n == 0 {
        return 0.0;
    }
    let sum: u64 = prev
        .iter()
        .zip(cur)
        .map(|(&a, &b)| u64::from(a.abs_diff(b)))
        .sum();
    sum as f64 / n as f64
}

/// Turns a stream of grayscale frames into motion levels, keeping only the
/// previous frame in memory.
pub struct MotionLevels<I> {
    frames: I,
    prev: Option<Vec<u8>>,
}

impl<I: Iterator<Item = Vec<u8>>> MotionLevels<I> {
    pub fn new(frames: I) -> Self {
        Self { frames, prev: None }
    }
}

impl<I: Iterator<Item = Vec<u8>>> Iterator for MotionLevels<I> {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        let frame = self.frames.next()?;
        let level = match &self.prev {
            Some(prev) => frame_motion_level(prev, &frame),
            None => 0.0,
        };
        self.prev = Some(frame);
        Some(level)
    }
}

/// Mark the frames that belong to motion segments.
///
/// A segment starts at a run of at least `min_frames` consecutive levels
/// `>= threshold`.  Inside a segment a quiet frame only counts towards
/// ending it; the segment ends after [`SEGMENT_END_QUIET_FRAMES`] quiet
/// frames in a row or at the end of the sequence.  Quiet frames between two
/// motion frames of the same segment are marked, the quiet tail is not.
/// Scanning resumes after the frame that ended the segment.
pub fn motion_mask(levels: &[f64], threshold: f64, min_frames: usize) -> Vec<bool> {
    let n = levels.len();
    let mut mask = vec![false; n];
    let min_frames = min_frames.max(1);
    let active = |i: usize| levels[i] >= threshold;

    let mut i = 0;
    while i < n {
        let run = (i..n).take_while(|&k| active(k)).count();
        if run < min_frames {
            i += 1;
            continue;
        }

        let mut last_motion = i;
        let mut quiet = 0;
        let mut j = i;
        while j < n {
            if active(j) {
                last_motion = j;
                quiet = 0;
            } else {
                quiet += 1;
                if quiet >= SEGMENT_END_QUIET_FRAMES {
                    break;
                }
            }
            j += 1;
        }

        mask[i..=last_motion].iter_mut().for_each(|m| *m = true);
        i = j + 1;
    }
    mask
}

/// Frame range `[start, end]` strictly between the motionless prefix and
/// suffix of `mask`.  `None` when there is nothing worth keeping.
pub fn trim_window(mask: &[bool]) -> Option<(usize, usize)> {
    let prefix = mask.iter().take_while(|m| !**m).count();
    if prefix == mask.len() {
        return None;
    }
    let suffix = mask.iter().rev().take_while(|m| !**m).count();
    let start = prefix;
    let end = mask.len() - 1 - suffix;
    (start < end).then_some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marked(mask: &[bool]) -> Vec<usize> {
        mask.iter()
            .enumerate()
            .filter(|(_, m)| **m)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_two_segments() {
        let levels = [0., 0., 2., 2., 2., 2., 0., 0., 0., 0., 0., 2., 2., 2., 0., 0.];
        let mask = motion_mask(&levels, 1.0, 3);
        assert_eq!(marked(&mask), vec![2, 3, 4, 5, 11, 12, 13]);
        assert_eq!(trim_window(&mask), Some((2, 13)));
    }

    #[test]
    fn test_short_burst_does_not_start_segment() {
        let levels = [0., 2., 2., 0., 0., 0.];
        let mask = motion_mask(&levels, 1.0, 3);
        assert!(mask.iter().all(|m| !m));
        assert_eq!(trim_window(&mask), None);
    }

    #[test]
    fn test_dip_shorter_than_five_is_bridged() {
        // 4 quiet frames inside the segment, then motion again
        let levels = [0., 3., 3., 3., 0., 0., 0., 0., 3., 0., 0.];
        let mask = motion_mask(&levels, 1.0, 3);
        assert_eq!(marked(&mask), (1..=8).collect::<Vec<_>>());
    }

    #[test]
    fn test_five_quiet_frames_end_segment() {
        // exactly 5 quiet frames end the segment; the single frame after is
        // not enough to restart one
        let levels = [3., 3., 3., 0., 0., 0., 0., 0., 3., 0.];
        let mask = motion_mask(&levels, 1.0, 3);
        assert_eq!(marked(&mask), vec![0, 1, 2]);
    }

    /// Every on/off level pattern up to 12 frames, checked against the
    /// segment rules, including segments that reach the end of the clip.
    #[test]
    fn test_segment_rules_exhaustive() {
        const MIN: usize = 3;
        for n in 1..=12usize {
            for bits in 0u32..(1 << n) {
                let on = |i: usize| bits & (1 << i) != 0;
                let levels: Vec<f64> = (0..n).map(|i| if on(i) { 2.0 } else { 0.0 }).collect();
                let mask = motion_mask(&levels, 1.0, MIN);

                // any frame inside a long enough burst is kept
                for i in 0..n {
                    let burst_start = (0..=i).rev().take_while(|&k| on(k)).last();
                    if let Some(s) = burst_start {
                        if (s..n).take_while(|&k| on(k)).count() >= MIN {
                            assert!(mask[i], "{levels:?}: frame {i} in a burst not marked");
                        }
                    }
                }

                let mut a = 0;
                while a < n {
                    if !mask[a] {
                        a += 1;
                        continue;
                    }
                    let b = (a..n).take_while(|&k| mask[k]).last().unwrap_or(a);
                    // segments start on a burst and end on motion
                    assert!((a..a + MIN).all(|k| k < n && on(k)), "{levels:?}: bad start {a}");
                    assert!(on(b), "{levels:?}: segment ends on a quiet frame {b}");
                    // no ending gap inside, and the tail after it is quiet
                    let mut quiet = 0;
                    for k in a..=b {
                        quiet = if on(k) { 0 } else { quiet + 1 };
                        assert!(quiet < SEGMENT_END_QUIET_FRAMES, "{levels:?}: gap bridged");
                    }
                    let tail_end = (b + SEGMENT_END_QUIET_FRAMES).min(n - 1);
                    assert!((b + 1..=tail_end).all(|k| !on(k)), "{levels:?}: cut short at {b}");
                    a = b + 1;
                }
            }
        }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mask = motion_mask(&[1.0, 1.0, 1.0], 1.0, 3);
        assert_eq!(mask, vec![true, true, true]);
        assert_eq!(trim_window(&mask), Some((0, 2)));
    }

    #[test]
    fn test_window_edge_cases() {
        assert_eq!(trim_window(&[]), None);
        assert_eq!(trim_window(&[false, true, false]), None);
        assert_eq!(trim_window(&[true, true]), Some((0, 1)));
    }

    #[test]
    fn test_motion_levels() {
        let frames = vec![vec![0u8, 0, 0, 0], vec![10, 10, 0, 0], vec![10, 10, 0, 0]];
        let levels: Vec<f64> = MotionLevels::new(frames.into_iter()).collect();
        assert_eq!(levels, vec![0.0, 5.0, 0.0]);
    }

    #[test]
    fn test_frame_motion_level() {
        assert_eq!(frame_motion_level(&[255, 0], &[0, 255]), 255.0);
        assert_eq!(frame_motion_level(&[], &[]), 0.0);
    }
}

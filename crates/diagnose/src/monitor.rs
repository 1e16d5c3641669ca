use framebus::{Frame, FrameShape};
use std::fmt;
use std::time::Duration;

/// Mean absolute pixel difference above which two samples count as different frames.
pub const CHANGE_THRESHOLD: f64 = 5.0;

const NULL_LIMIT: usize = 5;
const REPEAT_LIMIT: usize = 20;
const MIN_FPS: f64 = 5.0;
/// Low frame rate is only judged after this much observation time.
const MIN_FPS_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    First,
    Changed(f64),
    Same(f64),
    Null,
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sample::First => write!(f, "FIRST"),
            Sample::Changed(diff) => write!(f, "CHANGED diff={diff:.2}"),
            Sample::Same(diff) => write!(f, "SAME    diff={diff:.2}"),
            Sample::Null => write!(f, "NULL"),
        }
    }
}

/// Mean absolute difference per byte, or `None` when the shapes differ.
pub fn mean_abs_diff(a: &Frame, b: &Frame) -> Option<f64> {
    if a.dim() != b.dim() || a.is_empty() {
        return None;
    }
    let total: u64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| x.abs_diff(y) as u64)
        .sum();
    Some(total as f64 / a.len() as f64)
}

/// Classifies successive `force_read` results from one buffer.
#[derive(Default)]
pub struct Monitor {
    last: Option<Frame>,
    changes: usize,
    nulls: usize,
    repeats: usize,
}

impl Monitor {
    pub fn observe(&mut self, frame: Option<Frame>) -> Sample {
        let Some(frame) = frame else {
            self.nulls += 1;
            return Sample::Null;
        };

        let Some(last) = &self.last else {
            self.changes += 1;
            self.last = Some(frame);
            return Sample::First;
        };

        match mean_abs_diff(last, &frame) {
            Some(diff) if diff <= CHANGE_THRESHOLD => {
                self.repeats += 1;
                Sample::Same(diff)
            }
            diff => {
                // A shape change is a change regardless of pixel content
                let diff = diff.unwrap_or(f64::INFINITY);
                self.changes += 1;
                self.last = Some(frame);
                Sample::Changed(diff)
            }
        }
    }

    pub fn last_shape(&self) -> Option<FrameShape> {
        self.last.as_ref().map(FrameShape::of)
    }

    pub fn summary(&self, elapsed: Duration) -> MonitorSummary {
        let secs = elapsed.as_secs_f64();
        MonitorSummary {
            elapsed,
            changes: self.changes,
            nulls: self.nulls,
            repeats: self.repeats,
            fps: if secs > 0.0 {
                self.changes as f64 / secs
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorSummary {
    pub elapsed: Duration,
    pub changes: usize,
    pub nulls: usize,
    pub repeats: usize,
    /// Distinct frames observed per second.
    pub fps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Issue {
    NullFrames(usize),
    RepeatedFrames(usize),
    LowFps(f64),
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Issue::NullFrames(n) => write!(f, "{n} null reads: the writer may have stopped or never started"),
            Issue::RepeatedFrames(n) => write!(f, "{n} repeated frames: the writer is not updating often enough"),
            Issue::LowFps(fps) => write!(f, "low frame rate ({fps:.1} fps): the writer may be overloaded"),
        }
    }
}

impl MonitorSummary {
    pub fn issues(&self) -> Vec<Issue> {
        let mut issues = Vec::new();
        if self.nulls > NULL_LIMIT {
            issues.push(Issue::NullFrames(self.nulls));
        }
        if self.repeats > REPEAT_LIMIT {
            issues.push(Issue::RepeatedFrames(self.repeats));
        }
        if self.fps < MIN_FPS && self.elapsed > MIN_FPS_WINDOW {
            issues.push(Issue::LowFps(self.fps));
        }
        issues
    }

    pub fn is_healthy(&self) -> bool {
        self.issues().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(value: u8) -> Frame {
        Frame::from_elem((4, 4, 3), value)
    }

    #[test]
    fn test_mean_abs_diff() {
        assert_eq!(mean_abs_diff(&uniform(10), &uniform(10)), Some(0.0));
        assert_eq!(mean_abs_diff(&uniform(10), &uniform(30)), Some(20.0));
        assert_eq!(mean_abs_diff(&uniform(30), &uniform(10)), Some(20.0));
        assert_eq!(mean_abs_diff(&uniform(0), &Frame::zeros((2, 2, 3))), None);
    }

    #[test]
    fn test_classifies_samples() {
        let mut monitor = Monitor::default();

        assert_eq!(monitor.observe(None), Sample::Null);
        assert_eq!(monitor.observe(Some(uniform(100))), Sample::First);
        assert_eq!(monitor.observe(Some(uniform(103))), Sample::Same(3.0));
        assert_eq!(monitor.observe(Some(uniform(120))), Sample::Changed(20.0));
        // Compared against the last changed frame, not the last sample
        assert_eq!(monitor.observe(Some(uniform(124))), Sample::Same(4.0));
        assert_eq!(monitor.last_shape(), Some(FrameShape::rgb(4, 4)));

        let summary = monitor.summary(Duration::from_secs(1));
        assert_eq!(summary.changes, 2);
        assert_eq!(summary.nulls, 1);
        assert_eq!(summary.repeats, 2);
        assert_eq!(summary.fps, 2.0);
    }

    #[test]
    fn test_shape_change_counts_as_change() {
        let mut monitor = Monitor::default();
        monitor.observe(Some(uniform(0)));
        assert!(matches!(
            monitor.observe(Some(Frame::zeros((2, 2, 3)))),
            Sample::Changed(_)
        ));
    }

    #[test]
    fn test_stalled_writer_is_reported() {
        let mut monitor = Monitor::default();
        for _ in 0..30 {
            monitor.observe(Some(uniform(50)));
        }
        let summary = monitor.summary(Duration::from_secs(10));
        assert!(!summary.is_healthy());
        assert!(summary.issues().contains(&Issue::RepeatedFrames(29)));
        assert!(matches!(summary.issues().last(), Some(Issue::LowFps(_))));
    }

    #[test]
    fn test_missing_writer_is_reported() {
        let mut monitor = Monitor::default();
        for _ in 0..6 {
            monitor.observe(None);
        }
        assert_eq!(
            monitor.summary(Duration::from_secs(1)).issues(),
            vec![Issue::NullFrames(6)]
        );
    }

    #[test]
    fn test_live_writer_is_healthy() {
        let mut monitor = Monitor::default();
        for i in 0..100u8 {
            monitor.observe(Some(uniform(i.wrapping_mul(10))));
        }
        assert!(monitor.summary(Duration::from_secs(10)).is_healthy());
    }
}

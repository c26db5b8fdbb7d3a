//! Per-channel velocity change detection.

use crate::models::{RadarFrame, VelocityChange, CHANNELS};

/// Stateful detector comparing each frame against the last published
/// velocities. Single-writer: only the acquisition loop feeds it; diagnostic
/// reads of the last velocities go through the acquisition lock.
pub struct ChangeDetector {
    last_velocities: [f64; CHANNELS],
    min_change: f64,
}

impl ChangeDetector {
    pub fn new(min_change: f64) -> Self {
        Self {
            last_velocities: [0.0; CHANNELS],
            min_change,
        }
    }

    /// Emits one event per channel whose delta reaches the threshold, then
    /// adopts the frame's velocities as the new baseline for every channel.
    pub fn detect(&mut self, frame: &RadarFrame) -> Vec<VelocityChange> {
        let mut changes = Vec::new();

        for i in 0..CHANNELS {
            let delta = frame.velocities[i] - self.last_velocities[i];
            if delta.abs() >= self.min_change {
                changes.push(VelocityChange {
                    index: i,
                    old_value: self.last_velocities[i],
                    new_value: frame.velocities[i],
                    change_value: delta,
                    timestamp: frame.timestamp,
                });
            }
        }

        self.last_velocities = frame.velocities;
        changes
    }

    pub fn last_velocities(&self) -> [f64; CHANNELS] {
        self.last_velocities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_velocities(velocities: [f64; CHANNELS]) -> RadarFrame {
        RadarFrame {
            velocities,
            ..RadarFrame::new()
        }
    }

    #[test]
    fn emits_exactly_the_channels_over_threshold() {
        let mut detector = ChangeDetector::new(0.01);
        let first = detector.detect(&frame_with_velocities([0.0; 7]));
        assert!(first.is_empty());

        let changes =
            detector.detect(&frame_with_velocities([0.005, 0.020, 0.0, 0.0, 0.0, 0.0, 0.0]));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].index, 1);
        assert_eq!(changes[0].old_value, 0.0);
        assert_eq!(changes[0].new_value, 0.020);
        assert!((changes[0].change_value - 0.020).abs() < 1e-12);
    }

    #[test]
    fn threshold_is_inclusive() {
        let mut detector = ChangeDetector::new(0.01);
        let changes = detector.detect(&frame_with_velocities([0.01, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]));
        assert_eq!(changes.len(), 1);

        let changes =
            detector.detect(&frame_with_velocities([0.01, 0.00999, 0.0, 0.0, 0.0, 0.0, 0.0]));
        assert!(changes.is_empty(), "sub-threshold delta must not emit");
    }

    #[test]
    fn baseline_moves_even_for_unchanged_channels() {
        let mut detector = ChangeDetector::new(0.01);
        detector.detect(&frame_with_velocities([0.004, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]));
        // 0.004 was below threshold but is still the new baseline
        assert_eq!(detector.last_velocities()[0], 0.004);

        let changes =
            detector.detect(&frame_with_velocities([0.012, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]));
        assert_eq!(changes.len(), 1);
        assert!((changes[0].change_value - 0.008).abs() < 1e-12);
        assert_eq!(changes[0].old_value, 0.004);
    }

    #[test]
    fn every_emitted_event_matches_the_frame() {
        let mut detector = ChangeDetector::new(0.01);
        let sequences: [[f64; CHANNELS]; 4] = [
            [0.0, 0.1, -0.1, 0.0, 0.25, 0.0, 0.009],
            [0.0, 0.1, -0.1, 0.0, 0.25, 0.0, 0.009],
            [0.5, -0.5, 0.0, 0.02, 0.25, 0.3, -0.009],
            [0.0; CHANNELS],
        ];

        let mut previous = [0.0; CHANNELS];
        for velocities in sequences {
            let frame = frame_with_velocities(velocities);
            let changes = detector.detect(&frame);
            for i in 0..CHANNELS {
                let delta = velocities[i] - previous[i];
                let emitted = changes.iter().find(|c| c.index == i);
                if delta.abs() >= 0.01 {
                    let event = emitted.expect("change over threshold must emit");
                    assert_eq!(event.new_value, velocities[i]);
                    assert_eq!(event.timestamp, frame.timestamp);
                } else {
                    assert!(emitted.is_none(), "channel {i} under threshold emitted");
                }
            }
            previous = velocities;
        }
    }
}

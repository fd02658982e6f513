use std::time::Duration;

use chatstorm::{
    executor::{RampingSchedule, Stage},
    workloads,
};

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[test]
fn ramps_are_monotonic_within_each_stage() {
    for name in workloads::NAMES {
        let schedule = workloads::by_name(name).unwrap().workload.schedule();
        let mut offset = Duration::ZERO;
        let mut from = 0u32;
        for (i, stage) in schedule.stages().iter().enumerate() {
            let mut last = schedule.vus_at(offset);
            let steps = stage.duration.as_millis() as u64 / 100;
            for step in 1..steps {
                let now = schedule.vus_at(offset + millis(step * 100));
                if stage.target >= from {
                    assert!(now >= last, "{name} stage {i} dips at step {step}");
                } else {
                    assert!(now <= last, "{name} stage {i} rises at step {step}");
                }
                assert!(now as u32 <= schedule.max_target());
                last = now;
            }
            offset += stage.duration;
            from = stage.target;
        }
    }
}

#[test]
fn stage_boundaries_hit_their_targets() {
    let schedule = RampingSchedule::new(
        5,
        vec![
            Stage::new(Duration::from_secs(3), 30),
            Stage::new(Duration::ZERO, 100),
            Stage::new(Duration::from_secs(2), 7),
        ],
    );
    assert_eq!(schedule.vus_at(Duration::ZERO), 5);
    assert_eq!(schedule.vus_at(Duration::from_secs(3)), 100);
    assert_eq!(schedule.vus_at(Duration::from_secs(5)), 7);
    assert_eq!(schedule.vus_at(Duration::from_secs(500)), 7);
    assert_eq!(schedule.stage_at(Duration::from_secs(3)), Some(2));
    assert_eq!(schedule.stage_at(Duration::from_secs(5)), None);
}

#[test]
fn fractional_targets_never_round_up() {
    // 1000 VUs over 10s is one VU per 10ms
    let schedule = RampingSchedule::new(0, vec![Stage::new(Duration::from_secs(10), 1000)]);
    for ms in (0..10_000).step_by(7) {
        let exact = schedule.target_at(millis(ms));
        let whole = schedule.vus_at(millis(ms));
        assert!(whole as f64 <= exact + 1e-6);
        assert!(exact - (whole as f64) < 1.0);
    }
}

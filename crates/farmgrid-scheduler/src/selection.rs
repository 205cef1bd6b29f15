//! Selection weights and the weighted lottery.

use farm_core::config::SchedulerConfig;
use rand::Rng;

use crate::job::Job;
use crate::rates::CapabilityRates;

/// Floor for a job's priority so zero-priority jobs still trickle out.
pub const PRIORITY_FLOOR: f64 = 1e-3;

/// Offset keeping an idle project's weight finite.
const PROJECT_WORK_OFFSET: f64 = 0.1;

/// Relative chance of `job` being drawn within its project.
///
/// Starts from the job priority; each required capability divides it by
/// that capability's rate so rare-capability jobs are not starved. Then:
/// once a frame has finished, slow jobs are throttled by their mean render
/// time relative to `min_render_time`; a job with nothing finished and
/// nothing in flight is boosted so the first frame comes back quickly; a
/// job with frames in flight but none finished is damped by
/// `unknown_render_time`.
pub fn job_weight(job: &Job, rates: &CapabilityRates, config: &SchedulerConfig) -> f64 {
    let mut weight = job.priority.max(PRIORITY_FLOOR);
    for capability in &job.requires {
        weight /= rates.divisor(capability);
    }

    if job.rendered_count != 0 {
        let min = config.min_render_time.max(f64::MIN_POSITIVE);
        weight /= job.mean_render_time.max(min) / min;
    } else if job.working.is_empty() {
        weight *= config.first_frame_boost;
    } else if config.unknown_render_time > 0.0 {
        weight /= config.unknown_render_time;
    }
    weight
}

/// Relative chance of a project being drawn: its priority, divided by how
/// much of its work is already in flight.
pub fn project_weight(priority: f64, working: usize) -> f64 {
    priority.max(0.0) / (PROJECT_WORK_OFFSET + working as f64)
}

/// Draw one item with probability proportional to its weight. Returns
/// `None` for an empty slice; if every weight is zero the first item wins.
pub fn weighted_pick<'a, T, R>(rng: &mut R, items: &'a [(T, f64)]) -> Option<&'a T>
where
    R: Rng,
{
    let total: f64 = items.iter().map(|(_, w)| w.max(0.0)).sum();
    if items.is_empty() {
        return None;
    }
    if total <= 0.0 || !total.is_finite() {
        return items.first().map(|(item, _)| item);
    }

    let mut remaining = rng.gen_range(0.0..1.0) * total;
    for (item, weight) in items {
        if *weight <= 0.0 {
            continue;
        }
        remaining -= weight;
        if remaining <= 0.0 {
            return Some(item);
        }
    }
    // Rounding left a sliver; the last item absorbs it.
    items.last().map(|(item, _)| item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::WorkItem;
    use farm_core::FrameSpec;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn job(priority: f64) -> Job {
        Job {
            priority,
            todo: vec![1, 2, 3],
            first: 1,
            last: 3,
            ..Job::default()
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            min_render_time: 10.0,
            unknown_render_time: 4.0,
            first_frame_boost: 1024.0,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn fresh_job_is_boosted() {
        let rates = CapabilityRates::new(64.0);
        assert_eq!(job_weight(&job(2.0), &rates, &config()), 2048.0);
    }

    #[test]
    fn in_flight_job_without_results_is_damped() {
        let rates = CapabilityRates::new(64.0);
        let mut j = job(2.0);
        j.working.push(WorkItem {
            frame: FrameSpec::Single(1),
            node: "a".into(),
            last_seen: 0.0,
        });
        assert_eq!(job_weight(&j, &rates, &config()), 0.5);
    }

    #[test]
    fn slow_jobs_are_throttled_fast_ones_are_not() {
        let rates = CapabilityRates::new(64.0);
        let mut slow = job(1.0);
        slow.rendered_count = 3;
        slow.mean_render_time = 40.0;
        assert_eq!(job_weight(&slow, &rates, &config()), 0.25);

        let mut fast = job(1.0);
        fast.rendered_count = 3;
        fast.mean_render_time = 2.0;
        assert_eq!(job_weight(&fast, &rates, &config()), 1.0);
    }

    #[test]
    fn zero_priority_is_floored() {
        let rates = CapabilityRates::new(64.0);
        let mut j = job(0.0);
        j.rendered_count = 1;
        j.mean_render_time = 1.0;
        assert_eq!(job_weight(&j, &rates, &config()), PRIORITY_FLOOR);
    }

    #[test]
    fn rare_capability_raises_weight() {
        let mut rates = CapabilityRates::new(8.0);
        for i in 0..500 {
            if i % 10 == 0 {
                rates.report(["gpu", "cpu"]);
            } else {
                rates.report(["cpu"]);
            }
        }
        let mut gpu = job(1.0);
        gpu.requires.insert("gpu".into());
        let mut cpu = job(1.0);
        cpu.requires.insert("cpu".into());

        let config = config();
        assert!(job_weight(&gpu, &rates, &config) > 3.0 * job_weight(&cpu, &rates, &config));
    }

    #[test]
    fn busy_project_weighs_less() {
        assert_eq!(project_weight(1.0, 0), 10.0);
        assert!(project_weight(1.0, 4) < project_weight(1.0, 1));
        assert!(project_weight(2.0, 4) > project_weight(1.0, 4));
    }

    #[test]
    fn pick_is_proportional() {
        let mut rng = StdRng::seed_from_u64(7);
        let items = [("a", 1.0), ("b", 3.0)];
        let mut b = 0;
        for _ in 0..4000 {
            if *weighted_pick(&mut rng, &items).unwrap() == "b" {
                b += 1;
            }
        }
        assert!((2700..3300).contains(&b), "b drawn {b} times");
    }

    #[test]
    fn pick_edge_cases() {
        let mut rng = StdRng::seed_from_u64(1);
        let empty: [(u8, f64); 0] = [];
        assert_eq!(weighted_pick(&mut rng, &empty), None);
        assert_eq!(weighted_pick(&mut rng, &[(1, 0.0), (2, 0.0)]), Some(&1));
        for _ in 0..100 {
            assert_eq!(weighted_pick(&mut rng, &[(1, 0.0), (2, 5.0)]), Some(&2));
        }
    }
}

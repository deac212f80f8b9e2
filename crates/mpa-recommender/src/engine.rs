//! Policy grid evaluation
//!
//! A policy is a pair (replica count, per-pod CPU). Each CPU size maps to a
//! measured service rate; the pair is scored by a finite M/M/c queueing
//! model combining a normalized resource cost with a service-level penalty
//! cost. The engine walks the full 9 x 16 grid and returns the best point,
//! then decides whether the improvement over the published policy is worth
//! a re-deployment.

/// Smallest replica count on the grid
pub const POD_NUM_MIN: i64 = 1;
/// Largest replica count on the grid
pub const POD_NUM_MAX: i64 = 16;

/// Default expected per-request response time, in milliseconds
pub const DEFAULT_RESPONSE_TIME_MS: i64 = 300;

/// Price of one millicore-second of CPU
const CPU_PRICE: f64 = 0.00003334;

/// Relative score improvement required before a new policy replaces the
/// published one
const IMPROVEMENT_THRESHOLD: f64 = 0.02;

/// Scores below this are treated as "no usable published policy"
const NO_SCORE: f64 = 1e-7;

/// Weight of the resource cost in the final score; the penalty cost takes
/// the remainder
const RESOURCE_COST_RATIO: f64 = 0.5;

/// CPU sizes (millicores) and their measured service rates (requests/s)
const CPU_SERVICE_RATES: [(i64, i64); 9] = [
    (250, 6),
    (500, 12),
    (750, 20),
    (1000, 26),
    (1250, 34),
    (1500, 40),
    (1750, 46),
    (2000, 52),
    (2250, 60),
];

/// Service-score thresholds to penalty cost, walked in descending order;
/// the first threshold at or below the score wins
const PENALTY_STEPS: [(f64, f64); 6] = [
    (95.0, 1.0),
    (90.0, 0.9),
    (85.0, 0.8),
    (80.0, 0.5),
    (60.0, 0.3),
    (0.0, 0.0),
];

const RESOURCE_COST_MAX: f64 = (POD_NUM_MAX * 2250) as f64 * CPU_PRICE;
const RESOURCE_COST_MIN: f64 = (POD_NUM_MIN * 250) as f64 * CPU_PRICE;

/// n! for n in 0..=16
const FACTORIALS: [f64; 17] = [
    1.0,
    1.0,
    2.0,
    6.0,
    24.0,
    120.0,
    720.0,
    5040.0,
    40320.0,
    362880.0,
    3628800.0,
    39916800.0,
    479001600.0,
    6227020800.0,
    87178291200.0,
    1307674368000.0,
    20922789888000.0,
];

/// 1/n! for n in 0..=16
const FACTORIALS_INVERSE: [f64; 17] = [
    1.0,
    1.0,
    0.5,
    0.16666666666666666,
    0.041666666666666664,
    0.008333333333333333,
    0.001388888888888889,
    0.0001984126984126984,
    2.48015873015873e-5,
    2.7557319223985893e-6,
    2.755731922398589e-7,
    2.505210838544172e-8,
    2.08767569878681e-9,
    1.6059043836821613e-10,
    1.1470745597729725e-11,
    7.647163731819816e-13,
    4.779477332387385e-14,
];

/// The winning grid point and its score
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PolicyChoice {
    /// Final score of the policy
    pub score: f64,
    /// Replica count
    pub replicas: i64,
    /// Per-pod CPU in millicores
    pub cpu_milli: i64,
}

/// Service rate for a grid CPU size; `None` for off-grid values
pub fn service_rate_for(cpu_milli: i64) -> Option<i64> {
    CPU_SERVICE_RATES
        .iter()
        .find(|(cpu, _)| *cpu == cpu_milli)
        .map(|(_, rate)| *rate)
}

/// Walk the whole grid for the given aggregate QPS and expected response
/// time; the best-scoring point wins, ties resolve to the smallest point
pub fn recommend(qps: f64, expected_response_time_ms: i64) -> PolicyChoice {
    let mut best = PolicyChoice {
        score: 0.0,
        replicas: 0,
        cpu_milli: 0,
    };

    for (cpu_milli, service_rate) in CPU_SERVICE_RATES {
        let wait_time_ms = expected_response_time_ms as f64 - 1.0 / service_rate as f64;
        for replicas in POD_NUM_MIN..=POD_NUM_MAX {
            let intensity = qps / (replicas * service_rate) as f64;
            let score =
                evaluate_policy(cpu_milli, replicas, service_rate, qps, wait_time_ms, intensity);
            if score > best.score {
                best = PolicyChoice {
                    score,
                    replicas,
                    cpu_milli,
                };
            }
        }
    }

    tracing::debug!(
        score = best.score,
        replicas = best.replicas,
        cpu_milli = best.cpu_milli,
        qps,
        "grid search finished"
    );
    best
}

/// Score an arbitrary (cpu, replicas) pair at the given QPS; off-grid CPU
/// sizes and non-positive replica counts score zero
pub fn score_policy(cpu_milli: i64, replicas: i64, qps: f64, expected_response_time_ms: i64) -> f64 {
    let Some(service_rate) = service_rate_for(cpu_milli) else {
        return 0.0;
    };
    if !(POD_NUM_MIN..=POD_NUM_MAX).contains(&replicas) {
        return 0.0;
    }
    let wait_time_ms = expected_response_time_ms as f64 - 1.0 / service_rate as f64;
    let intensity = qps / (replicas * service_rate) as f64;
    evaluate_policy(cpu_milli, replicas, service_rate, qps, wait_time_ms, intensity)
}

/// Publish when there is no usable old score, or the new score improves on
/// it by more than the threshold
pub fn should_publish(new_score: f64, old_score: f64) -> bool {
    old_score < NO_SCORE || (new_score - old_score) / old_score > IMPROVEMENT_THRESHOLD
}

fn evaluate_policy(
    cpu_milli: i64,
    replicas: i64,
    service_rate: i64,
    qps: f64,
    wait_time_ms: f64,
    intensity: f64,
) -> f64 {
    // The queue grows without bound at or past saturation
    if intensity >= 1.0 {
        tracing::trace!(
            cpu_milli,
            replicas,
            qps,
            service_rate,
            "policy saturates the queue, rejected"
        );
        return 0.0;
    }

    let service_score = queue_score(service_rate, replicas, qps, wait_time_ms, intensity);
    let resource = resource_cost(cpu_milli, replicas);
    let penalty = penalty_cost(service_score);
    resource * RESOURCE_COST_RATIO + penalty * (1.0 - RESOURCE_COST_RATIO)
}

/// Finite M/M/c evaluation: empty-system probability, mean queue length,
/// then the service score used for the penalty lookup
fn queue_score(service_rate: i64, replicas: i64, qps: f64, wait_time_ms: f64, intensity: f64) -> f64 {
    let offered_load = qps / service_rate as f64;
    let n = replicas as usize;

    let p0 = {
        let mut sum = 0.0;
        for i in 0..n {
            sum += FACTORIALS_INVERSE[i] * offered_load.powi(i as i32);
        }
        sum += FACTORIALS_INVERSE[n] * (1.0 / (1.0 - intensity)) * offered_load.powi(n as i32);
        1.0 / sum
    };

    let queue_length = (replicas as f64 * intensity).powi(n as i32) * intensity
        / (FACTORIALS[n] * (1.0 - intensity) * (1.0 - intensity))
        * p0;

    (1.0 - ((wait_time_ms / 1000.0) * (qps - (replicas * service_rate) as f64)).exp())
        * (100.0 * queue_length)
}

/// Normalized resource cost: cheapest grid point scores 1, the most
/// expensive scores 0
fn resource_cost(cpu_milli: i64, replicas: i64) -> f64 {
    let cost = (replicas * cpu_milli) as f64 * CPU_PRICE;
    (RESOURCE_COST_MAX - cost) / (RESOURCE_COST_MAX - RESOURCE_COST_MIN)
}

/// Step-table lookup: the first threshold at or below the service score
/// wins; scores below every threshold fall back to the full penalty
fn penalty_cost(service_score: f64) -> f64 {
    for (threshold, cost) in PENALTY_STEPS {
        if service_score >= threshold {
            return cost;
        }
    }
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_rate_table_is_complete() {
        for cpu in [250, 500, 750, 1000, 1250, 1500, 1750, 2000, 2250] {
            assert!(service_rate_for(cpu).is_some());
        }
        assert_eq!(service_rate_for(1000), Some(26));
        assert_eq!(service_rate_for(300), None);
    }

    /// Story: three pods at 60 req/s each. A single pod cannot absorb
    /// 180 req/s at any grid size, so the winner must spread the load and
    /// keep the queue finite.
    #[test]
    fn story_scale_up_beats_a_single_big_pod() {
        let qps = 180.0;
        let best = recommend(qps, DEFAULT_RESPONSE_TIME_MS);

        assert!(best.score > 0.0);
        let rate = service_rate_for(best.cpu_milli).unwrap();
        let intensity = qps / (best.replicas * rate) as f64;
        assert!(intensity < 1.0);

        // The biggest single pod (2250m serves 60 req/s) saturates
        assert_eq!(score_policy(2250, 1, qps, DEFAULT_RESPONSE_TIME_MS), 0.0);
    }

    /// Story: a policy whose queue blows up is never selected. 500 req/s
    /// against one 1000m pod (26 req/s) gives an intensity around 19.
    #[test]
    fn story_saturated_policy_scores_zero() {
        assert_eq!(score_policy(1000, 1, 500.0, DEFAULT_RESPONSE_TIME_MS), 0.0);
    }

    /// Story: a 1.2% improvement is not worth a re-deployment; the old
    /// policy stays published.
    #[test]
    fn story_marginal_improvement_is_skipped() {
        assert!(!should_publish(0.83, 0.82));
        assert!(should_publish(0.85, 0.82));
        assert!(should_publish(0.5, 0.0));
        assert!(should_publish(0.5, 1e-8));
    }

    #[test]
    fn winner_stays_on_the_grid() {
        for qps in [1.0, 10.0, 55.5, 180.0, 400.0, 900.0] {
            let best = recommend(qps, DEFAULT_RESPONSE_TIME_MS);
            if best.score > 0.0 {
                assert!((POD_NUM_MIN..=POD_NUM_MAX).contains(&best.replicas), "qps {qps}");
                assert!(service_rate_for(best.cpu_milli).is_some(), "qps {qps}");
                let rate = service_rate_for(best.cpu_milli).unwrap();
                assert!(qps / ((best.replicas * rate) as f64) < 1.0, "qps {qps}");
            }
        }
    }

    #[test]
    fn impossible_load_yields_no_policy() {
        // Even the full grid (16 x 2250m = 960 req/s) saturates
        let best = recommend(2000.0, DEFAULT_RESPONSE_TIME_MS);
        assert_eq!(best.score, 0.0);
        assert_eq!(best.replicas, 0);
    }

    #[test]
    fn off_grid_published_policy_scores_zero() {
        assert_eq!(score_policy(300, 4, 100.0, DEFAULT_RESPONSE_TIME_MS), 0.0);
        assert_eq!(score_policy(1500, 0, 100.0, DEFAULT_RESPONSE_TIME_MS), 0.0);
        assert_eq!(score_policy(1500, 17, 100.0, DEFAULT_RESPONSE_TIME_MS), 0.0);
    }

    #[test]
    fn penalty_steps_walk_descending_thresholds() {
        assert_eq!(penalty_cost(99.0), 1.0);
        assert_eq!(penalty_cost(95.0), 1.0);
        assert_eq!(penalty_cost(92.0), 0.9);
        assert_eq!(penalty_cost(85.0), 0.8);
        assert_eq!(penalty_cost(81.0), 0.5);
        assert_eq!(penalty_cost(60.0), 0.3);
        assert_eq!(penalty_cost(12.0), 0.0);
        // Below every threshold: full penalty
        assert_eq!(penalty_cost(-3.0), 1.0);
    }

    #[test]
    fn resource_cost_is_normalized() {
        assert!((resource_cost(250, 1) - 1.0).abs() < 1e-9);
        assert!(resource_cost(2250, 16).abs() < 1e-9);
        let mid = resource_cost(1000, 4);
        assert!(mid > 0.0 && mid < 1.0);
    }

    #[test]
    fn factorial_tables_agree() {
        for i in 0..=16 {
            assert!((FACTORIALS[i] * FACTORIALS_INVERSE[i] - 1.0).abs() < 1e-9, "n={i}");
        }
    }

    #[test]
    fn recommendation_is_deterministic() {
        let a = recommend(123.0, DEFAULT_RESPONSE_TIME_MS);
        let b = recommend(123.0, DEFAULT_RESPONSE_TIME_MS);
        assert_eq!(a, b);
    }

    #[test]
    fn light_load_prefers_cheap_policies() {
        // 4 req/s fits comfortably on the smallest pod
        let best = recommend(4.0, DEFAULT_RESPONSE_TIME_MS);
        assert!(best.score > 0.0);
        assert!(best.replicas * best.cpu_milli <= 4 * 2250);
    }
}

//! User-supplied tasks and weighted selection

use std::sync::Arc;

use async_trait::async_trait;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;

/// One unit of user behavior, invoked repeatedly by every simulated user
///
/// Tasks report their own timings through a
/// [`StatsRecorder`](crate::stats::StatsRecorder) they capture at
/// construction. An error escaping `execute` is recorded as a failure by
/// the worker shell with the elapsed wall time, so user code is not
/// required to catch its own errors.
#[async_trait]
pub trait Task: Send + Sync {
    /// Task name, used in failure reports
    fn name(&self) -> &str;

    /// Selection weight; relative share of executions
    fn weight(&self) -> u64 {
        1
    }

    /// Run the task once
    async fn execute(&self) -> anyhow::Result<()>;
}

/// Weighted random selection over the registered tasks
///
/// Selection draws against a cumulative-weight table, so `pick` is O(log n)
/// and safe from any task. Zero-weight tasks are never picked unless every
/// task has zero weight, in which case selection is uniform.
pub struct WeightedSelector {
    tasks: Vec<Arc<dyn Task>>,
    index: Option<WeightedIndex<u64>>,
}

impl WeightedSelector {
    /// Build a selector over `tasks`
    ///
    /// Returns `None` when `tasks` is empty.
    pub fn new(tasks: Vec<Arc<dyn Task>>) -> Option<Self> {
        if tasks.is_empty() {
            return None;
        }
        let weights: Vec<u64> = tasks.iter().map(|task| task.weight()).collect();
        // all-zero weights fail to build an index; fall back to uniform
        let index = WeightedIndex::new(weights).ok();
        Some(Self { tasks, index })
    }

    /// Pick one task with probability proportional to its weight
    pub fn pick(&self) -> &Arc<dyn Task> {
        let mut rng = rand::rng();
        match &self.index {
            Some(index) => &self.tasks[index.sample(&mut rng)],
            None => &self.tasks[rng.random_range(0..self.tasks.len())],
        }
    }

    /// Number of registered tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the selector holds no tasks (never true for a built one)
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct NamedTask {
        name: String,
        weight: u64,
    }

    #[async_trait]
    impl Task for NamedTask {
        fn name(&self) -> &str {
            &self.name
        }

        fn weight(&self) -> u64 {
            self.weight
        }

        async fn execute(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn task(name: &str, weight: u64) -> Arc<dyn Task> {
        Arc::new(NamedTask {
            name: name.to_string(),
            weight,
        })
    }

    fn pick_counts(selector: &WeightedSelector, draws: usize) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for _ in 0..draws {
            *counts
                .entry(selector.pick().name().to_string())
                .or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_empty_task_set_rejected() {
        assert!(WeightedSelector::new(Vec::new()).is_none());
    }

    #[test]
    fn test_weighted_distribution() {
        let selector = WeightedSelector::new(vec![task("a", 2), task("b", 1)]).unwrap();
        let counts = pick_counts(&selector, 900);

        let a = counts["a"] as f64;
        let b = counts["b"] as f64;
        assert!((400.0..=800.0).contains(&a), "a drawn {a} times");
        assert!((100.0..=500.0).contains(&b), "b drawn {b} times");
        let ratio = a / b;
        assert!((1.5..=3.0).contains(&ratio), "a:b ratio was {ratio}");
    }

    #[test]
    fn test_zero_weight_tasks_skipped() {
        let selector =
            WeightedSelector::new(vec![task("live", 3), task("dead", 0)]).unwrap();
        let counts = pick_counts(&selector, 500);

        assert_eq!(counts.get("dead"), None);
        assert_eq!(counts["live"], 500);
    }

    #[test]
    fn test_all_zero_weights_uniform() {
        let selector =
            WeightedSelector::new(vec![task("a", 0), task("b", 0), task("c", 0)]).unwrap();
        let counts = pick_counts(&selector, 900);

        for name in ["a", "b", "c"] {
            let share = counts[name];
            assert!((150..=450).contains(&share), "{name} drawn {share} times");
        }
    }

    #[test]
    fn test_single_task_always_picked() {
        let selector = WeightedSelector::new(vec![task("only", 7)]).unwrap();
        for _ in 0..50 {
            assert_eq!(selector.pick().name(), "only");
        }
    }
}

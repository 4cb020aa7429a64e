//! The fixed task catalog and how dispatch picks from it.

use std::str::FromStr;

use rand::seq::SliceRandom;

/// Built-in exercises, in dispatch order for `SelectionPolicy::First`.
pub const DEFAULT_TASKS: &[&str] = &[
    "Do 10 push-ups",
    "Take a brisk 5-minute walk",
    "Do 10 lunges (5 each leg)",
    "Do 15 squats",
    "Stretch your arms and back for 2 minutes",
];

/// Task selection policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Always the first catalog entry. Predictable for automated runs.
    #[default]
    First,
    /// Uniformly random entry.
    Random,
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "first" => Ok(Self::First),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown selection policy '{other}' (expected first or random)")),
        }
    }
}

/// Catalog of dispatchable tasks.
#[derive(Debug, Clone)]
pub struct TaskCatalog {
    tasks: Vec<String>,
    policy: SelectionPolicy,
}

impl TaskCatalog {
    /// Build a catalog. An empty task list falls back to the defaults.
    pub fn new(tasks: Vec<String>, policy: SelectionPolicy) -> Self {
        let tasks = if tasks.is_empty() {
            DEFAULT_TASKS.iter().map(|t| t.to_string()).collect()
        } else {
            tasks
        };
        Self { tasks, policy }
    }

    pub fn with_policy(policy: SelectionPolicy) -> Self {
        Self::new(Vec::new(), policy)
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn tasks(&self) -> &[String] {
        &self.tasks
    }

    pub fn select(&self) -> &str {
        let task = match self.policy {
            SelectionPolicy::First => self.tasks.first(),
            SelectionPolicy::Random => self.tasks.choose(&mut rand::thread_rng()),
        };
        // `new` guarantees a non-empty list.
        task.map(String::as_str).unwrap_or(DEFAULT_TASKS[0])
    }
}

impl Default for TaskCatalog {
    fn default() -> Self {
        Self::with_policy(SelectionPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_policy_is_deterministic() {
        let catalog = TaskCatalog::with_policy(SelectionPolicy::First);
        for _ in 0..10 {
            assert_eq!(catalog.select(), "Do 10 push-ups");
        }
    }

    #[test]
    fn random_policy_stays_in_catalog() {
        let catalog = TaskCatalog::with_policy(SelectionPolicy::Random);
        for _ in 0..50 {
            let task = catalog.select();
            assert!(catalog.tasks().iter().any(|t| t == task));
        }
    }

    #[test]
    fn random_policy_eventually_varies() {
        let catalog = TaskCatalog::with_policy(SelectionPolicy::Random);
        let first = catalog.select().to_string();
        let varied = (0..200).any(|_| catalog.select() != first);
        assert!(varied);
    }

    #[test]
    fn empty_catalog_uses_defaults() {
        let catalog = TaskCatalog::new(Vec::new(), SelectionPolicy::First);
        assert_eq!(catalog.tasks().len(), DEFAULT_TASKS.len());
    }

    #[test]
    fn custom_catalog() {
        let catalog = TaskCatalog::new(vec!["Plank for 30 seconds".into()], SelectionPolicy::Random);
        assert_eq!(catalog.select(), "Plank for 30 seconds");
    }

    #[test]
    fn policy_from_str() {
        assert_eq!("RANDOM".parse::<SelectionPolicy>(), Ok(SelectionPolicy::Random));
        assert!("sometimes".parse::<SelectionPolicy>().is_err());
    }
}

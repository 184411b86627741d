//! Shared map of in-flight tasks.
//!
//! Mutated concurrently by the scheduler (insert), the message loop
//! (remove on result) and the supervisor (remove on forced resolution or
//! re-enqueue). A missing key is always a benign race, never an error.

use crate::task::Task;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<u64, Arc<Task>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<Task>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, task: Arc<Task>) {
        self.lock().insert(task.number(), task);
    }

    pub fn get(&self, number: u64) -> Option<Arc<Task>> {
        self.lock().get(&number).cloned()
    }

    pub fn remove(&self, number: u64) -> Option<Arc<Task>> {
        self.lock().remove(&number)
    }

    /// Copy of the current entries, so scans do not hold the lock while
    /// talking to workers.
    pub fn snapshot(&self) -> Vec<Arc<Task>> {
        self.lock().values().cloned().collect()
    }

    pub fn drain(&self) -> Vec<Arc<Task>> {
        self.lock().drain().map(|(_, task)| task).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskOptions;
    use std::thread;

    fn task(number: u64) -> Arc<Task> {
        Arc::new(Task::new(number, "pid", Vec::new(), TaskOptions::new()))
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = TaskRegistry::new();
        registry.insert(task(1));
        registry.insert(task(2));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(1).map(|t| t.number()), Some(1));

        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
        assert!(registry.get(1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry = TaskRegistry::new();
        for n in 0..5 {
            registry.insert(task(n));
        }
        let mut drained: Vec<u64> = registry.drain().iter().map(|t| t.number()).collect();
        drained.sort_unstable();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_insert_and_remove() {
        let registry = Arc::new(TaskRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for n in 0..100 {
                        let number = t * 1000 + n;
                        registry.insert(task(number));
                        // Every remove either finds the entry or races benignly
                        let _ = registry.remove(number);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}

//! Per-vm task queues with requeue-on-pop semantics.
//!
//! The queue structure itself is not synchronized; the coordinator guards it
//! with its scheduling mutex and blocks on the per-vm pull gate (a condvar
//! paired with that same mutex) when a queue runs dry.

use crate::util::VmKey;
use repro_core::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar};
use thiserror::Error;

/// How often a task is handed out again after it is popped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Infinite,
    Finite(u64),
}

impl Repeat {
    /// Negative repeat counts request infinite execution.
    pub fn from_flag(n: i64) -> Self {
        if n < 0 {
            Repeat::Infinite
        } else {
            Repeat::Finite(n as u64)
        }
    }
}

/// A scheduled execution of one program on one vm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub repeat: Repeat,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("tasks queue of vm {0} is empty")]
    Empty(VmKey),
    #[error("there is no such task in tasks queue")]
    NotFound,
}

#[derive(Default)]
struct VmQueue {
    tasks: VecDeque<Task>,
    gate: Arc<Condvar>,
}

/// One fifo of pending tasks per vm.
#[derive(Default)]
pub struct TasksQueue {
    queues: HashMap<VmKey, VmQueue>,
}

impl TasksQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to the vm's queue, waking a waiting consumer.
    pub fn push(&mut self, vm: VmKey, task: Task) {
        let queue = self.queues.entry(vm).or_default();
        queue.tasks.push_back(task);
        queue.gate.notify_one();
    }

    /// Push a copy of the task to every vm that already has a queue entry.
    /// Vms nothing was ever pushed to are skipped.
    pub fn push_all(&mut self, task: &Task) {
        for queue in self.queues.values_mut() {
            queue.tasks.push_back(task.clone());
            queue.gate.notify_one();
        }
    }

    /// Remove and return the head of the vm's queue. Infinite tasks and
    /// finite tasks with runs left are requeued at the tail before this
    /// returns, so such queues never drain.
    pub fn get_and_pop(&mut self, vm: VmKey) -> Result<Task, QueueError> {
        let queue = self.queues.get_mut(&vm).ok_or(QueueError::Empty(vm))?;
        let task = queue.tasks.pop_front().ok_or(QueueError::Empty(vm))?;
        match task.repeat {
            Repeat::Infinite => self.push(vm, task.clone()),
            Repeat::Finite(n) if n > 0 => self.push(
                vm,
                Task {
                    id: task.id.clone(),
                    repeat: Repeat::Finite(n - 1),
                },
            ),
            Repeat::Finite(_) => log::info!("task {} is finished", task.id),
        }
        Ok(task)
    }

    /// Pull gate of the vm; a producer's push notifies it. The caller waits
    /// on it with the scheduling mutex's guard and re-checks emptiness, so
    /// spurious wakeups are harmless.
    pub fn gate(&mut self, vm: VmKey) -> Arc<Condvar> {
        Arc::clone(&self.queues.entry(vm).or_default().gate)
    }

    pub fn is_empty(&self, vm: VmKey) -> bool {
        self.queues
            .get(&vm)
            .map(|q| q.tasks.is_empty())
            .unwrap_or(true)
    }

    pub fn len(&self, vm: VmKey) -> usize {
        self.queues.get(&vm).map(|q| q.tasks.len()).unwrap_or(0)
    }

    /// Whether any vm's queue currently holds a task with this id.
    pub fn contains(&self, task_id: &str) -> bool {
        self.queues
            .values()
            .any(|q| q.tasks.iter().any(|t| t.id == task_id))
    }

    /// Remove every occurrence of the task across all vm queues. Best
    /// effort: an execution already handed out is not cancelled.
    pub fn stop(&mut self, task_id: &str) -> Result<(), QueueError> {
        let mut stopped = false;
        for queue in self.queues.values_mut() {
            let before = queue.tasks.len();
            queue.tasks.retain(|t| t.id != task_id);
            stopped |= queue.tasks.len() != before;
        }
        if stopped {
            Ok(())
        } else {
            Err(QueueError::NotFound)
        }
    }
}

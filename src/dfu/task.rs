// Copyright © 2026 Rudis Laboratories LLC

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::image_set::TargetImage;
use super::State;

/// One step of an upgrade. Validation discovers the rest of the steps.
#[derive(Debug, Clone)]
pub(crate) enum Task {
    /// Reboot so an occupied secondary slot is cleared, then validate again.
    ResetBeforeUpload,
    Validate { attempt: u32 },
    Upload(TargetImage),
    EraseStorage,
    Test(TargetImage),
    Confirm(TargetImage),
    Reset,
    ConfirmAfterReset(TargetImage),
}

impl Task {
    /// Lower runs first.
    pub fn priority(&self) -> u8 {
        match self {
            Task::ResetBeforeUpload => 0,
            Task::Validate { .. } => 1,
            Task::Upload(_) => 2,
            Task::EraseStorage | Task::Test(_) | Task::Confirm(_) => 3,
            Task::Reset => 10,
            Task::ConfirmAfterReset(_) => 11,
        }
    }

    /// State reported to the caller while this task runs.
    pub fn state(&self) -> State {
        match self {
            Task::ResetBeforeUpload | Task::Reset => State::Reset,
            Task::Validate { .. } => State::Validate,
            Task::Upload(_) | Task::EraseStorage => State::Upload,
            Task::Test(_) => State::Test,
            Task::Confirm(_) | Task::ConfirmAfterReset(_) => State::Confirm,
        }
    }
}

struct Queued {
    priority: u8,
    order: u64,
    task: Task,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // BinaryHeap is a max-heap: reverse so the lowest (priority, order) pops first
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.order).cmp(&(self.priority, self.order))
    }
}

/// Priority queue of pending tasks; equal priorities keep insertion order.
#[derive(Default)]
pub(crate) struct TaskQueue {
    heap: BinaryHeap<Queued>,
    next_order: u64,
}

impl TaskQueue {
    pub fn push(&mut self, task: Task) {
        self.heap.push(Queued {
            priority: task.priority(),
            order: self.next_order,
            task,
        });
        self.next_order += 1;
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.heap.pop().map(|q| q.task)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn target(index: u32) -> TargetImage {
        TargetImage::new(index, 1, Arc::from(vec![0u8; 4]), vec![index as u8; 32])
    }

    #[test]
    fn pops_by_priority_then_insertion() {
        let mut queue = TaskQueue::default();
        queue.push(Task::ConfirmAfterReset(target(0)));
        queue.push(Task::Reset);
        queue.push(Task::Test(target(0)));
        queue.push(Task::Upload(target(0)));
        queue.push(Task::Upload(target(1)));
        queue.push(Task::Validate { attempt: 0 });
        queue.push(Task::EraseStorage);
        queue.push(Task::ResetBeforeUpload);
        assert_eq!(queue.len(), 8);

        let mut order = Vec::new();
        while let Some(task) = queue.pop() {
            order.push(match task {
                Task::Upload(t) => format!("upload{}", t.image_index),
                other => format!("{:?}", other.state()),
            });
        }
        assert_eq!(
            order,
            [
                "Reset", "Validate", "upload0", "upload1", "Test", "Upload", "Reset", "Confirm"
            ]
        );
    }

    #[test]
    fn clear_drops_everything() {
        let mut queue = TaskQueue::default();
        queue.push(Task::Reset);
        queue.clear();
        assert!(queue.pop().is_none());
    }
}

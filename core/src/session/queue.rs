use std::collections::VecDeque;

use crate::exec_id::ExecId;

/// One pending execution. Only the head of the queue has been transmitted.
#[derive(Debug)]
pub(crate) struct QueuedExecution<T> {
    pub(crate) exec_id: ExecId,
    pub(crate) command: String,
    pub(crate) cancelled: bool,
    /// Completion state; taken once the execution is finalized.
    pub(crate) payload: Option<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EnqueueOutcome {
    /// Queue was empty; the command must be transmitted now.
    Transmit(String),
    /// Held behind `position` earlier entries.
    Held { position: usize },
}

#[derive(Debug)]
pub(crate) struct Advance<T> {
    pub(crate) finished: QueuedExecution<T>,
    /// Cancelled entries removed without transmission.
    pub(crate) skipped: Vec<QueuedExecution<T>>,
    /// The new head and the command to transmit for it.
    pub(crate) next: Option<(ExecId, String)>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CancelPosition {
    Head,
    Queued { position: usize },
    Absent,
}

/// Strict FIFO of executions targeting one session.
#[derive(Debug)]
pub(crate) struct ExecQueue<T> {
    entries: VecDeque<QueuedExecution<T>>,
}

impl<T> Default for ExecQueue<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<T> ExecQueue<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn head(&self) -> Option<&QueuedExecution<T>> {
        self.entries.front()
    }

    #[cfg(test)]
    pub(crate) fn ids(&self) -> Vec<ExecId> {
        self.entries.iter().map(|entry| entry.exec_id).collect()
    }

    pub(crate) fn enqueue(&mut self, exec_id: ExecId, command: String, payload: T) -> EnqueueOutcome {
        let was_empty = self.entries.is_empty();
        let outcome = if was_empty {
            EnqueueOutcome::Transmit(command.clone())
        } else {
            EnqueueOutcome::Held {
                position: self.entries.len(),
            }
        };
        self.entries.push_back(QueuedExecution {
            exec_id,
            command,
            cancelled: false,
            payload: Some(payload),
        });
        outcome
    }

    /// Locates `exec_id`. Non-head entries are flagged cancelled and their
    /// payload is returned so the caller can finalize them right away.
    pub(crate) fn cancel(&mut self, exec_id: ExecId) -> (CancelPosition, Option<T>) {
        let Some(position) = self
            .entries
            .iter()
            .position(|entry| entry.exec_id == exec_id)
        else {
            return (CancelPosition::Absent, None);
        };
        if position == 0 {
            return (CancelPosition::Head, None);
        }
        let entry = &mut self.entries[position];
        if entry.cancelled {
            return (CancelPosition::Queued { position }, None);
        }
        entry.cancelled = true;
        (CancelPosition::Queued { position }, entry.payload.take())
    }

    /// Removes the head (which must be `exec_id`), skips cancelled entries
    /// behind it and returns the next command to transmit.
    pub(crate) fn dequeue(&mut self, exec_id: ExecId) -> Option<Advance<T>> {
        if self.entries.front().map(|entry| entry.exec_id) != Some(exec_id) {
            return None;
        }
        let finished = self.entries.pop_front()?;
        let mut skipped = Vec::new();
        while self.entries.front().is_some_and(|entry| entry.cancelled) {
            if let Some(entry) = self.entries.pop_front() {
                skipped.push(entry);
            }
        }
        let next = self
            .entries
            .front()
            .map(|entry| (entry.exec_id, entry.command.clone()));
        Some(Advance {
            finished,
            skipped,
            next,
        })
    }

    /// Empties the queue, head first.
    pub(crate) fn drain(&mut self) -> Vec<QueuedExecution<T>> {
        self.entries.drain(..).collect()
    }
}

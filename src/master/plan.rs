use crate::protocol::{Payload, TaskName, WorkItem};

/// Everything the coordinator needs to run one distributed phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhasePlan {
    pub task: TaskName,
    /// Lanes per servant.
    pub lanes: usize,
    /// Items are enqueued one wave at a time; a wave starts only once the
    /// previous one has fully completed.
    pub waves: Vec<Vec<WorkItem>>,
    /// Progress reports each item sends when it succeeds.
    pub progress_per_item: usize,
}

impl PhasePlan {
    pub fn new(task: TaskName, lanes: usize, items: Vec<WorkItem>) -> Self {
        Self::in_waves(task, lanes, vec![items])
    }

    pub fn in_waves(task: TaskName, lanes: usize, waves: Vec<Vec<WorkItem>>) -> Self {
        Self {
            task,
            lanes: lanes.max(1),
            waves: waves.into_iter().filter(|wave| !wave.is_empty()).collect(),
            progress_per_item: 1,
        }
    }

    pub fn progress_per_item(mut self, progress: usize) -> Self {
        self.progress_per_item = progress.max(1);
        self
    }

    pub fn item_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    /// Progress plus error reports that complete the phase.
    pub fn target(&self) -> usize {
        self.item_count() * self.progress_per_item
    }
}

/// What a phase ended with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOutcome {
    pub succeeded: bool,
    /// Progress and error reports received.
    pub completed: usize,
    pub errors: usize,
    /// Payloads of the progress reports, in arrival order.
    pub payloads: Vec<Payload>,
}

impl PhaseOutcome {
    /// A phase with nothing to do.
    pub fn empty() -> Self {
        Self {
            succeeded: true,
            ..Self::default()
        }
    }
}

/// Lifecycle of a job from offer submission to completion.
///
/// Transitions:
///
/// * queued -> assigned (scheduler dispatches to a worker)
/// * assigned -> answered (worker returns an SDP answer)
/// * answered -> done (worker reports completion)
/// * any non-terminal -> stopping (teardown requested)
/// * stopping -> done (worker confirms teardown)
/// * assigned | answered -> queued (worker disconnected or replied busy;
///   the job re-enters the queue at the head)
///
/// `Done` is terminal: jobs are removed from the registry on that transition,
/// so it is never observed on a stored job.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Assigned,
    Answered,
    Stopping,
    Done,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        use JobState::*;

        match self {
            Queued => "queued",
            Assigned => "assigned",
            Answered => "answered",
            Stopping => "stopping",
            Done => "done",
        }
    }

    /// True for states a worker still has to act on. Jobs in `Stopping` are
    /// excluded: the teardown signal is already on its way.
    pub fn is_live(&self) -> bool {
        !matches!(self, JobState::Stopping | JobState::Done)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

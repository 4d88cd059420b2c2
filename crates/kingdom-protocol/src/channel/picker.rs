use std::collections::VecDeque;

/// How a channel's drain loop chooses the next message to publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PickPolicy {
    /// Oldest first, one per cycle.
    #[default]
    ProcessAll,
    /// Keep only the newest message; everything older is dropped.
    DiscardOld,
    /// Keep only the oldest message; everything newer is dropped.
    DiscardNew,
}

impl PickPolicy {
    /// Take the next item from `queue` according to the policy.
    pub fn pick<T>(self, queue: &mut VecDeque<T>) -> Option<T> {
        match self {
            PickPolicy::ProcessAll => queue.pop_front(),
            PickPolicy::DiscardOld => {
                let newest = queue.pop_back();
                queue.clear();
                newest
            }
            PickPolicy::DiscardNew => {
                let oldest = queue.pop_front();
                queue.clear();
                oldest
            }
        }
    }
}

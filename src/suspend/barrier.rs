//! Partition barrier
//!
//! Every partition publishes its state after each completed batch and
//! eventually arrives as finished, arrested or failed. The controller waits
//! here until all partitions have arrived, or takes the latest published
//! states when it is forced to checkpoint before that.

use crate::engine::PartitionState;
use crate::error::{RatchetError, Result};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotStatus {
    Running,
    Arrested,
    Finished,
    Failed(String),
}

#[derive(Debug)]
struct Slot {
    status: SlotStatus,
    latest: PartitionState,
}

/// States of all partitions at one moment.
#[derive(Debug, Clone)]
pub struct BarrierSnapshot {
    pub states: Vec<PartitionState>,
    pub statuses: Vec<SlotStatus>,
}

impl BarrierSnapshot {
    pub fn all_arrived(&self) -> bool {
        self.statuses.iter().all(|s| *s != SlotStatus::Running)
    }

    pub fn count(&self, status: &SlotStatus) -> usize {
        self.statuses.iter().filter(|s| *s == status).count()
    }

    pub fn failure(&self) -> Option<(usize, &str)> {
        self.statuses.iter().enumerate().find_map(|(idx, s)| match s {
            SlotStatus::Failed(message) => Some((idx, message.as_str())),
            _ => None,
        })
    }
}

pub struct PartitionBarrier {
    slots: Mutex<Vec<Slot>>,
    notify: Notify,
}

impl PartitionBarrier {
    pub fn new(states: &[PartitionState]) -> Self {
        let slots = states
            .iter()
            .map(|state| Slot {
                status: if state.finished {
                    SlotStatus::Finished
                } else {
                    SlotStatus::Running
                },
                latest: state.clone(),
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            notify: Notify::new(),
        }
    }

    fn slots(&self) -> Result<MutexGuard<'_, Vec<Slot>>> {
        self.slots
            .lock()
            .map_err(|_| RatchetError::Execution("partition barrier lock poisoned".to_string()))
    }

    fn update(&self, index: usize, status: SlotStatus, state: Option<PartitionState>) {
        if let Ok(mut slots) = self.slots() {
            if let Some(slot) = slots.get_mut(index) {
                slot.status = status;
                if let Some(state) = state {
                    slot.latest = state;
                }
            }
        }
        self.notify.notify_one();
    }

    /// Record progress after a completed batch.
    pub fn publish(&self, state: &PartitionState) {
        if let Ok(mut slots) = self.slots() {
            if let Some(slot) = slots.get_mut(state.index) {
                slot.latest = state.clone();
            }
        }
    }

    pub fn arrive_finished(&self, state: PartitionState) {
        self.update(state.index, SlotStatus::Finished, Some(state));
    }

    pub fn arrive_arrested(&self, state: PartitionState) {
        self.update(state.index, SlotStatus::Arrested, Some(state));
    }

    pub fn fail(&self, index: usize, message: String) {
        self.update(index, SlotStatus::Failed(message), None);
    }

    /// Wake the waiting controller without an arrival.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub fn snapshot(&self) -> Result<BarrierSnapshot> {
        let slots = self.slots()?;
        Ok(BarrierSnapshot {
            states: slots.iter().map(|s| s.latest.clone()).collect(),
            statuses: slots.iter().map(|s| s.status.clone()).collect(),
        })
    }

    /// Wait for the next arrival or wake-up; returns false if `deadline` passed first.
    pub async fn wait(&self, deadline: Option<Instant>) -> bool {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_ok(),
            None => {
                self.notify.notified().await;
                true
            }
        }
    }
}

//! Device selection strategies for a scheduling pass

use cohort_core::PlacementPolicy;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use crate::ledger::DeviceLedger;

/// Order in which devices are offered to the scheduler during one pass
///
/// A rejected device is never offered again in the same pass.
pub trait DeviceRotation: Send {
    /// Device to try next; `None` once every device has been rejected
    fn candidate(&self) -> Option<u32>;

    /// The candidate took a job; `ledger` already reflects the reservation
    fn assigned(&mut self, device: u32, ledger: &DeviceLedger);

    /// The candidate lacks capacity for the rest of the pass
    fn reject(&mut self, device: u32);
}

/// Build the rotation for a placement policy
pub fn rotation_for(
    policy: PlacementPolicy,
    devices: &[u32],
    ledger: &DeviceLedger,
) -> Box<dyn DeviceRotation> {
    match policy {
        PlacementPolicy::RoundRobin => Box::new(RoundRobin::new(devices)),
        PlacementPolicy::MostFree => Box::new(MostFree::new(devices, ledger)),
    }
}

/// Rotate through devices so consecutive jobs land on different devices
pub struct RoundRobin {
    queue: VecDeque<u32>,
}

impl RoundRobin {
    pub fn new(devices: &[u32]) -> Self {
        Self {
            queue: devices.iter().copied().collect(),
        }
    }
}

impl DeviceRotation for RoundRobin {
    fn candidate(&self) -> Option<u32> {
        self.queue.front().copied()
    }

    fn assigned(&mut self, device: u32, _ledger: &DeviceLedger) {
        if let Some(pos) = self.queue.iter().position(|d| *d == device) {
            self.queue.remove(pos);
            self.queue.push_back(device);
        }
    }

    fn reject(&mut self, device: u32) {
        self.queue.retain(|d| *d != device);
    }
}

/// Priority queue keyed by remaining free memory, lowest index on ties
pub struct MostFree {
    heap: BinaryHeap<(u64, Reverse<u32>)>,
}

impl MostFree {
    pub fn new(devices: &[u32], ledger: &DeviceLedger) -> Self {
        Self {
            heap: devices
                .iter()
                .map(|d| (ledger.free(*d).unwrap_or(0), Reverse(*d)))
                .collect(),
        }
    }
}

impl DeviceRotation for MostFree {
    fn candidate(&self) -> Option<u32> {
        self.heap.peek().map(|(_, Reverse(d))| *d)
    }

    fn assigned(&mut self, device: u32, ledger: &DeviceLedger) {
        self.heap.retain(|(_, Reverse(d))| *d != device);
        self.heap
            .push((ledger.free(device).unwrap_or(0), Reverse(device)));
    }

    fn reject(&mut self, device: u32) {
        self.heap.retain(|(_, Reverse(d))| *d != device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_rotates() {
        let ledger = DeviceLedger::new([(0, 10), (1, 10), (2, 10)]);
        let mut rotation = RoundRobin::new(&[0, 1, 2]);
        let mut order = Vec::new();
        for _ in 0..5 {
            let device = rotation.candidate().unwrap();
            order.push(device);
            rotation.assigned(device, &ledger);
        }
        assert_eq!(order, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_round_robin_reject_is_final() {
        let ledger = DeviceLedger::new([(0, 10), (1, 10)]);
        let mut rotation = RoundRobin::new(&[0, 1]);
        rotation.reject(0);
        assert_eq!(rotation.candidate(), Some(1));
        rotation.assigned(1, &ledger);
        assert_eq!(rotation.candidate(), Some(1));
        rotation.reject(1);
        assert_eq!(rotation.candidate(), None);
    }

    #[test]
    fn test_most_free_follows_ledger() {
        let mut ledger = DeviceLedger::new([(0, 10), (1, 25), (2, 25)]);
        let mut rotation = MostFree::new(&[0, 1, 2], &ledger);
        assert_eq!(rotation.candidate(), Some(1));

        ledger.reserve(1, 10).unwrap();
        rotation.assigned(1, &ledger);
        assert_eq!(rotation.candidate(), Some(2));

        ledger.reserve(2, 10).unwrap();
        rotation.assigned(2, &ledger);
        assert_eq!(rotation.candidate(), Some(1));

        rotation.reject(1);
        assert_eq!(rotation.candidate(), Some(2));
    }

    #[test]
    fn test_rotation_for_policy() {
        let ledger = DeviceLedger::new([(0, 1), (1, 5)]);
        assert_eq!(
            rotation_for(PlacementPolicy::RoundRobin, &[0, 1], &ledger).candidate(),
            Some(0)
        );
        assert_eq!(
            rotation_for(PlacementPolicy::MostFree, &[0, 1], &ledger).candidate(),
            Some(1)
        );
    }
}

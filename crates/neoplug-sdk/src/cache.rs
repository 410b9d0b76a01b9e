//! In-memory cache of the most recent readings per device.

use std::collections::VecDeque;

use dashmap::DashMap;
use uuid::Uuid;

use crate::reading::Reading;

/// Ring of the N most-recent readings for each device.
///
/// The map is sharded, so writers for different devices do not contend; a
/// single device's ring is only ever touched under its shard lock.
pub struct ReadingCache {
    rings: DashMap<Uuid, VecDeque<Reading>>,
    capacity: usize,
}

impl ReadingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a reading to its device's ring, evicting the oldest entry when
    /// the ring is full.
    pub fn add(&self, reading: Reading) {
        let mut ring = self.rings.entry(reading.device).or_default();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(reading);
    }

    /// All cached readings for a device, oldest first.
    pub fn readings(&self, device: &Uuid) -> Vec<Reading> {
        self.rings
            .get(device)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The most recent reading per output for a device.
    pub fn latest(&self, device: &Uuid) -> Vec<Reading> {
        let Some(ring) = self.rings.get(device) else {
            return Vec::new();
        };
        let mut latest: Vec<Reading> = Vec::new();
        for reading in ring.iter() {
            match latest.iter_mut().find(|r| r.output == reading.output) {
                Some(slot) => *slot = reading.clone(),
                None => latest.push(reading.clone()),
            }
        }
        latest
    }

    /// Number of devices with cached readings.
    pub fn device_count(&self) -> usize {
        self.rings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Value;

    fn reading(device: Uuid, output: &str, value: f64) -> Reading {
        let mut r = Reading::new(output, value);
        r.device = device;
        r
    }

    #[test]
    fn test_ring_eviction() {
        let cache = ReadingCache::new(3);
        let device = Uuid::new_v4();
        for i in 0..5 {
            cache.add(reading(device, "temperature", i as f64));
        }

        let cached = cache.readings(&device);
        assert_eq!(cached.len(), 3);
        assert_eq!(cached[0].value, Value::Float(2.0));
        assert_eq!(cached[2].value, Value::Float(4.0));
    }

    #[test]
    fn test_latest_per_output() {
        let cache = ReadingCache::new(10);
        let device = Uuid::new_v4();
        cache.add(reading(device, "temperature", 20.0));
        cache.add(reading(device, "humidity", 40.0));
        cache.add(reading(device, "temperature", 21.0));

        let latest = cache.latest(&device);
        assert_eq!(latest.len(), 2);
        let temp = latest.iter().find(|r| r.output == "temperature").unwrap();
        assert_eq!(temp.value, Value::Float(21.0));
    }

    #[test]
    fn test_devices_are_independent() {
        let cache = ReadingCache::new(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        cache.add(reading(a, "temperature", 1.0));
        cache.add(reading(b, "temperature", 2.0));

        assert_eq!(cache.device_count(), 2);
        assert_eq!(cache.readings(&a).len(), 1);
        assert_eq!(cache.readings(&b).len(), 1);
        assert!(cache.readings(&Uuid::new_v4()).is_empty());
    }
}

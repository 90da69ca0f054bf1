use std::time::{Duration, Instant};

use crate::plate::{PlateCandidate, Quad};

/// Last accepted plate, kept for overlay continuity between recognitions.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedDetection {
    pub geometry: Quad,
    pub plate: String,
    pub confidence: f32,
    pub captured_at: Instant,
}

/// Single-entry detection cache with a time-to-live.
///
/// Expired entries are not cleared; they are ignored until replaced.
#[derive(Debug)]
pub struct DetectionCache {
    entry: Option<CachedDetection>,
    ttl: Duration,
}

impl DetectionCache {
    pub fn new(ttl: Duration) -> Self {
        Self { entry: None, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Overwrite the entry with a freshly accepted candidate.
    pub fn store(&mut self, candidate: &PlateCandidate, now: Instant) {
        self.entry = Some(CachedDetection {
            geometry: candidate.geometry,
            plate: candidate.plate.clone(),
            confidence: candidate.confidence,
            captured_at: now,
        });
    }

    /// The entry if `now - captured_at <= ttl`.
    pub fn current(&self, now: Instant) -> Option<&CachedDetection> {
        self.entry
            .as_ref()
            .filter(|entry| now.saturating_duration_since(entry.captured_at) <= self.ttl)
    }

    /// The entry regardless of age.
    pub fn last(&self) -> Option<&CachedDetection> {
        self.entry.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(plate: &str) -> PlateCandidate {
        PlateCandidate {
            geometry: Quad::from_rect(1.0, 2.0, 30.0, 10.0),
            plate: plate.to_string(),
            confidence: 0.8,
        }
    }

    #[test]
    fn empty_cache_has_nothing() {
        let cache = DetectionCache::new(Duration::from_millis(1500));
        assert!(cache.current(Instant::now()).is_none());
    }

    #[test]
    fn entry_valid_up_to_and_including_ttl() {
        let t0 = Instant::now();
        let mut cache = DetectionCache::new(Duration::from_millis(1500));
        cache.store(&candidate("1234ABC"), t0);

        assert!(cache.current(t0 + Duration::from_millis(1500)).is_some());
        assert!(cache.current(t0 + Duration::from_millis(1501)).is_none());
        // Stale, but retained.
        assert_eq!(cache.last().map(|e| e.plate.as_str()), Some("1234ABC"));
    }

    #[test]
    fn store_replaces_previous_entry() {
        let t0 = Instant::now();
        let mut cache = DetectionCache::new(Duration::from_secs(1));
        cache.store(&candidate("1111AAA"), t0);
        cache.store(&candidate("2222BBB"), t0 + Duration::from_secs(5));

        let entry = cache
            .current(t0 + Duration::from_secs(5))
            .expect("fresh entry");
        assert_eq!(entry.plate, "2222BBB");
        assert_eq!(entry.captured_at, t0 + Duration::from_secs(5));
    }
}

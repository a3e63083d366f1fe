//! Persistence seam for decoded data.
//!
//! The session never touches storage itself; callers hand fetched records and
//! streamed samples to a [`SampleStore`].  Both tables are keyed by timestamp
//! and an insert replaces any row with the same key, which makes overlapping
//! history fetches idempotent.

use std::collections::BTreeMap;
use std::convert::Infallible;

use chrono::NaiveDateTime;

use crate::types::{ActivityRecord, HeartBeatSample};

pub trait SampleStore {
    type Error: std::error::Error + Send + Sync + 'static;

    fn insert_activity_records(&mut self, records: &[ActivityRecord]) -> Result<(), Self::Error>;
    /// Timestamp of the newest stored activity record.
    fn last_activity_timestamp(&self) -> Result<Option<NaiveDateTime>, Self::Error>;
    /// All activity records, oldest first.
    fn all_activity_records(&self) -> Result<Vec<ActivityRecord>, Self::Error>;
    fn delete_all_activity_records(&mut self) -> Result<(), Self::Error>;

    fn insert_heart_beats(&mut self, samples: &[HeartBeatSample]) -> Result<(), Self::Error>;
    /// Timestamp of the newest stored heart-beat sample.
    fn last_heart_beat_timestamp(&self) -> Result<Option<NaiveDateTime>, Self::Error>;
    /// All heart-beat samples, oldest first.
    fn all_heart_beats(&self) -> Result<Vec<HeartBeatSample>, Self::Error>;
    fn delete_all_heart_beats(&mut self) -> Result<(), Self::Error>;
}

/// In-process store backed by two ordered maps.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    activity: BTreeMap<NaiveDateTime, ActivityRecord>,
    heart_beats: BTreeMap<NaiveDateTime, HeartBeatSample>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SampleStore for MemoryStore {
    type Error = Infallible;

    fn insert_activity_records(&mut self, records: &[ActivityRecord]) -> Result<(), Infallible> {
        self.activity.extend(records.iter().map(|r| (r.time, *r)));
        Ok(())
    }

    fn last_activity_timestamp(&self) -> Result<Option<NaiveDateTime>, Infallible> {
        Ok(self.activity.keys().next_back().copied())
    }

    fn all_activity_records(&self) -> Result<Vec<ActivityRecord>, Infallible> {
        Ok(self.activity.values().copied().collect())
    }

    fn delete_all_activity_records(&mut self) -> Result<(), Infallible> {
        self.activity.clear();
        Ok(())
    }

    fn insert_heart_beats(&mut self, samples: &[HeartBeatSample]) -> Result<(), Infallible> {
        self.heart_beats.extend(samples.iter().map(|s| (s.time, *s)));
        Ok(())
    }

    fn last_heart_beat_timestamp(&self) -> Result<Option<NaiveDateTime>, Infallible> {
        Ok(self.heart_beats.keys().next_back().copied())
    }

    fn all_heart_beats(&self) -> Result<Vec<HeartBeatSample>, Infallible> {
        Ok(self.heart_beats.values().copied().collect())
    }

    fn delete_all_heart_beats(&mut self) -> Result<(), Infallible> {
        self.heart_beats.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn minute(m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 5, 1)
            .unwrap()
            .and_hms_opt(0, m, 0)
            .unwrap()
    }

    fn record(m: u32, steps: u8) -> ActivityRecord {
        ActivityRecord {
            time: minute(m),
            steps,
            heart_rate: 70,
        }
    }

    #[test]
    fn test_activity_insert_replaces_same_timestamp() {
        let mut store = MemoryStore::new();
        store
            .insert_activity_records(&[record(3, 10), record(1, 5)])
            .unwrap();
        store.insert_activity_records(&[record(3, 42)]).unwrap();

        let all = store.all_activity_records().unwrap();
        assert_eq!(all, vec![record(1, 5), record(3, 42)]);
        assert_eq!(store.last_activity_timestamp().unwrap(), Some(minute(3)));
    }

    #[test]
    fn test_empty_store_has_no_last_timestamp() {
        let store = MemoryStore::new();
        assert_eq!(store.last_activity_timestamp().unwrap(), None);
        assert_eq!(store.last_heart_beat_timestamp().unwrap(), None);
    }

    #[test]
    fn test_heart_beats_and_delete_all() {
        let mut store = MemoryStore::new();
        let samples = [
            HeartBeatSample { time: minute(2), bpm: 80 },
            HeartBeatSample { time: minute(1), bpm: 75 },
        ];
        store.insert_heart_beats(&samples).unwrap();
        store.insert_activity_records(&[record(0, 1)]).unwrap();
        assert_eq!(store.last_heart_beat_timestamp().unwrap(), Some(minute(2)));
        assert_eq!(store.all_heart_beats().unwrap()[0].bpm, 75);

        store.delete_all_heart_beats().unwrap();
        assert!(store.all_heart_beats().unwrap().is_empty());
        // The other table is untouched.
        assert_eq!(store.all_activity_records().unwrap().len(), 1);
        store.delete_all_activity_records().unwrap();
        assert!(store.all_activity_records().unwrap().is_empty());
    }
}

//! Append-only per-variable sample history
//!
//! Samples are stored in bus arrival order, which is not necessarily
//! timestamp order. Lookups use a first-match policy: walk from the oldest
//! sample and stop at the first one newer than the query time; the sample
//! before it is the answer. Streams that happen to be time-ordered (tracked
//! on append) answer the same question with a binary search.

use shared::Sample;
use std::collections::BTreeMap;

/// Why a lookup produced no sample. Never fatal; the caller skips its frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistoryMiss {
    UnknownStream,
    EmptyStream,
    BeforeFirstSample { first: f64 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryStream {
    samples: Vec<Sample>,
    time_ordered: bool,
}

impl HistoryStream {
    fn from_samples(samples: Vec<Sample>) -> Self {
        let time_ordered = samples
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp);
        Self {
            samples,
            time_ordered,
        }
    }

    fn push(&mut self, sample: Sample) {
        match self.samples.last() {
            None => self.time_ordered = true,
            Some(last) => self.time_ordered &= last.timestamp <= sample.timestamp,
        }
        self.samples.push(sample);
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn is_time_ordered(&self) -> bool {
        self.time_ordered
    }

    fn latest_at_or_before(&self, time: f64) -> Result<&Sample, HistoryMiss> {
        let first = self.samples.first().ok_or(HistoryMiss::EmptyStream)?;

        // Index of the first sample newer than `time`
        let boundary = if self.time_ordered {
            self.samples.partition_point(|sample| sample.timestamp <= time)
        } else {
            self.samples
                .iter()
                .position(|sample| sample.timestamp > time)
                .unwrap_or(self.samples.len())
        };

        match boundary {
            0 => Err(HistoryMiss::BeforeFirstSample {
                first: first.timestamp,
            }),
            index => Ok(&self.samples[index - 1]),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryStore {
    streams: BTreeMap<String, HistoryStream>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: &str, sample: Sample) {
        match self.streams.get_mut(name) {
            Some(stream) => stream.push(sample),
            None => {
                let mut stream = HistoryStream::default();
                stream.push(sample);
                self.streams.insert(name.to_string(), stream);
            }
        }
    }

    /// Latest sample of `name` whose timestamp is at or before `time`.
    ///
    /// O(n) for streams that arrived out of time order, O(log n) otherwise.
    pub fn latest_at_or_before(&self, name: &str, time: f64) -> Result<&Sample, HistoryMiss> {
        self.streams
            .get(name)
            .ok_or(HistoryMiss::UnknownStream)?
            .latest_at_or_before(time)
    }

    pub fn stream(&self, name: &str) -> Option<&HistoryStream> {
        self.streams.get(name)
    }

    pub fn len(&self, name: &str) -> usize {
        self.streams.get(name).map_or(0, |stream| stream.samples.len())
    }

    /// Greatest timestamp recorded for `name`.
    pub fn last_timestamp(&self, name: &str) -> Option<f64> {
        self.streams
            .get(name)?
            .samples
            .iter()
            .map(|sample| sample.timestamp)
            .reduce(f64::max)
    }

    pub fn to_streams(&self) -> BTreeMap<String, Vec<Sample>> {
        self.streams
            .iter()
            .map(|(name, stream)| (name.clone(), stream.samples.clone()))
            .collect()
    }

    pub fn from_streams(streams: BTreeMap<String, Vec<Sample>>) -> Self {
        Self {
            streams: streams
                .into_iter()
                .map(|(name, samples)| (name, HistoryStream::from_samples(samples)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::Payload;

    fn sample(timestamp: f64) -> Sample {
        Sample {
            timestamp,
            payload: Payload::Other(json!({ "t": timestamp })),
        }
    }

    fn store_with(name: &str, times: &[f64]) -> HistoryStore {
        let mut store = HistoryStore::new();
        for &t in times {
            store.append(name, sample(t));
        }
        store
    }

    #[test]
    fn lookup_picks_latest_sample_not_after_query() {
        let store = store_with("X", &[1.0, 3.0, 5.0]);

        assert_eq!(store.latest_at_or_before("X", 4.0).unwrap().timestamp, 3.0);
        assert_eq!(store.latest_at_or_before("X", 5.0).unwrap().timestamp, 5.0);
        assert_eq!(store.latest_at_or_before("X", 99.0).unwrap().timestamp, 5.0);
        assert_eq!(
            store.latest_at_or_before("X", 0.5),
            Err(HistoryMiss::BeforeFirstSample { first: 1.0 })
        );
    }

    #[test]
    fn lookup_reports_unknown_and_empty_streams() {
        let store =
            HistoryStore::from_streams(BTreeMap::from([("empty".to_string(), Vec::new())]));

        assert_eq!(store.len("empty"), 0);
        assert_eq!(store.latest_at_or_before("missing", 1.0), Err(HistoryMiss::UnknownStream));
        assert_eq!(store.latest_at_or_before("empty", 1.0), Err(HistoryMiss::EmptyStream));
    }

    #[test]
    fn sorted_lookup_matches_greatest_timestamp_at_or_before() {
        let times: Vec<f64> = (0..50).map(|i| i as f64 * 0.25).collect();
        let store = store_with("Varvgs", &times);
        assert!(store.stream("Varvgs").unwrap().is_time_ordered());

        for step in 0..60 {
            let query = step as f64 * 0.21;
            let expected = times.iter().copied().filter(|&t| t <= query).reduce(f64::max);
            let found = store.latest_at_or_before("Varvgs", query).ok().map(|s| s.timestamp);
            assert_eq!(found, expected, "query {query}");
        }
    }

    #[test]
    fn duplicate_timestamps_resolve_to_last_arrival() {
        let mut store = HistoryStore::new();
        store.append("X", sample(1.0));
        store.append(
            "X",
            Sample {
                timestamp: 1.0,
                payload: Payload::Other(json!("second")),
            },
        );

        let found = store.latest_at_or_before("X", 1.0).unwrap();
        assert_eq!(found.payload, Payload::Other(json!("second")));
    }

    #[test]
    fn unordered_stream_uses_first_match_scan() {
        let store = store_with("X", &[1.0, 4.0, 2.0, 6.0]);
        assert!(!store.stream("X").unwrap().is_time_ordered());

        // Stops at 4.0, the first sample newer than 3.0
        assert_eq!(store.latest_at_or_before("X", 3.0).unwrap().timestamp, 1.0);
        assert_eq!(store.latest_at_or_before("X", 5.0).unwrap().timestamp, 2.0);
    }

    #[test]
    fn append_never_reorders() {
        let store = store_with("X", &[3.0, 1.0, 2.0]);
        let times: Vec<f64> =
            store.stream("X").unwrap().samples().iter().map(|s| s.timestamp).collect();
        assert_eq!(times, vec![3.0, 1.0, 2.0]);
        assert_eq!(store.len("X"), 3);
        assert_eq!(store.last_timestamp("X"), Some(3.0));
    }

    #[test]
    fn restored_streams_recompute_ordering() {
        let saved = store_with("X", &[1.0, 0.5]);
        let restored = HistoryStore::from_streams(saved.to_streams());
        assert_eq!(restored, saved);
        assert!(!restored.stream("X").unwrap().is_time_ordered());
    }
}

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, warn};

use super::decode::decode_tx;
use super::messages::RawTx;
use crate::config::PanelConfig;
use crate::errors::{PanelError, Result, SchemaError};
use crate::types::Event;

const MAX_SAMPLED_ERRORS: usize = 16;

/// One raw indexer record keyed by its source offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub offset: u64,
    pub payload: String,
}

impl RawRecord {
    pub fn new(offset: u64, payload: impl Into<String>) -> Self {
        Self {
            offset,
            payload: payload.into(),
        }
    }
}

/// Counters kept while normalizing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizeStats {
    pub processed: u64,
    pub skipped: u64,
    pub ignored: u64,
    pub out_of_window: u64,
    pub emitted: u64,
    #[serde(skip)]
    pub sampled_errors: Vec<(u64, SchemaError)>,
}

impl NormalizeStats {
    pub fn skip_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.skipped as f64 / self.processed as f64
        }
    }

    pub(crate) fn record_skip(&mut self, offset: u64, err: SchemaError) {
        self.skipped += 1;
        debug!(offset, error = %err, "skipping record");
        if self.sampled_errors.len() < MAX_SAMPLED_ERRORS {
            self.sampled_errors.push((offset, err));
        }
    }

    /// Abort once enough records were seen and too many of them failed.
    pub fn check_skip_rate(&self, config: &PanelConfig) -> Result<()> {
        if self.processed < config.min_records_for_skip_check {
            return Ok(());
        }
        let rate = self.skip_rate();
        if rate > config.max_skip_rate {
            warn!(
                skipped = self.skipped,
                processed = self.processed,
                rate,
                "skip rate above sanity threshold"
            );
            return Err(PanelError::SkipRateExceeded {
                skipped: self.skipped,
                processed: self.processed,
                rate,
                max_rate: config.max_skip_rate,
            });
        }
        Ok(())
    }
}

/// Lazy normalizer over raw records.
///
/// Yields events in source order. `checkpoint()` is the offset of the last record
/// whose events have all been yielded, so a new stream built with
/// `resume_after(checkpoint)` picks up without duplicating events.
pub struct EventStream<'a, I> {
    source: I,
    config: &'a PanelConfig,
    resume_after: Option<u64>,
    pending: VecDeque<Event>,
    pending_offset: Option<u64>,
    checkpoint: Option<u64>,
    stats: NormalizeStats,
    finished: bool,
}

impl<'a, I> EventStream<'a, I>
where
    I: Iterator<Item = RawRecord>,
{
    pub fn new(source: impl IntoIterator<IntoIter = I>, config: &'a PanelConfig) -> Self {
        Self {
            source: source.into_iter(),
            config,
            resume_after: None,
            pending: VecDeque::new(),
            pending_offset: None,
            checkpoint: None,
            stats: NormalizeStats::default(),
            finished: false,
        }
    }

    /// Skip every record at or below `offset`.
    pub fn resume_after(mut self, offset: u64) -> Self {
        self.resume_after = Some(offset);
        self.checkpoint = Some(offset);
        self
    }

    pub fn checkpoint(&self) -> Option<u64> {
        self.checkpoint
    }

    pub fn stats(&self) -> &NormalizeStats {
        &self.stats
    }

    pub fn into_stats(self) -> NormalizeStats {
        self.stats
    }

    /// Drain the stream, failing if the skip rate trips.
    pub fn collect_events(mut self) -> Result<(Vec<Event>, NormalizeStats)> {
        let mut events = Vec::new();
        for item in self.by_ref() {
            events.push(item?);
        }
        self.stats.check_skip_rate(self.config)?;
        Ok((events, self.stats))
    }

    fn in_window(&self, event: &Event) -> bool {
        event.hour >= self.config.history_start && event.hour <= self.config.window_end
    }

    fn process(&mut self, record: RawRecord) {
        self.stats.processed += 1;
        let decoded = serde_json::from_str::<RawTx>(&record.payload)
            .map_err(|err| SchemaError::MalformedPayload(err.to_string()))
            .and_then(|tx| decode_tx(&tx, record.offset, self.config));
        match decoded {
            Err(err) => self.stats.record_skip(record.offset, err),
            Ok(events) if events.is_empty() => self.stats.ignored += 1,
            Ok(events) => {
                for event in events {
                    if self.in_window(&event) {
                        self.pending.push_back(event);
                    } else {
                        self.stats.out_of_window += 1;
                    }
                }
            }
        }
        self.pending_offset = Some(record.offset);
    }
}

impl<'a, I> Iterator for EventStream<'a, I>
where
    I: Iterator<Item = RawRecord>,
{
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                self.stats.emitted += 1;
                if self.pending.is_empty() {
                    self.checkpoint = self.pending_offset;
                }
                return Some(Ok(event));
            }
            if self.pending_offset.is_some() {
                self.checkpoint = self.pending_offset;
            }
            if self.finished {
                return None;
            }

            let Some(record) = self.source.next() else {
                self.finished = true;
                return None;
            };
            if self
                .resume_after
                .is_some_and(|resume| record.offset <= resume)
            {
                continue;
            }
            self.process(record);
            if let Err(err) = self.stats.check_skip_rate(self.config) {
                self.finished = true;
                self.pending.clear();
                return Some(Err(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::decode::fixtures::{deposit_tx, redeem_tx};

    fn records(config: &PanelConfig) -> Vec<RawRecord> {
        vec![
            RawRecord::new(1, deposit_tx(config, "terra1a", "2022-05-01T10:15:00Z", 5_000_000)),
            RawRecord::new(2, "{not json"),
            RawRecord::new(
                3,
                redeem_tx(config, "terra1a", "2022-05-09T11:00:00Z", 1_000_000, Some(1_200_000)),
            ),
            RawRecord::new(4, deposit_tx(config, "terra1b", "2021-01-01T00:00:00Z", 1_000_000)),
        ]
    }

    #[test]
    fn test_malformed_record_is_counted_not_emitted() {
        let config = PanelConfig::default();
        let (events, stats) = EventStream::new(records(&config), &config)
            .collect_events()
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.offset != 2));
        assert_eq!(stats.processed, 4);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.out_of_window, 1);
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.sampled_errors[0].0, 2);
    }

    #[test]
    fn test_resume_from_checkpoint() {
        let config = PanelConfig::default();
        let mut stream = EventStream::new(records(&config), &config);
        let first = stream.next().unwrap().unwrap();
        assert_eq!(first.offset, 1);
        let checkpoint = stream.checkpoint().unwrap();
        assert_eq!(checkpoint, 1);

        let (rest, _) = EventStream::new(records(&config), &config)
            .resume_after(checkpoint)
            .collect_events()
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].offset, 3);
    }

    #[test]
    fn test_skip_rate_aborts() {
        let config = PanelConfig {
            min_records_for_skip_check: 4,
            max_skip_rate: 0.2,
            ..PanelConfig::default()
        };
        let garbage: Vec<_> = (0..10).map(|i| RawRecord::new(i, "garbage")).collect();
        let result = EventStream::new(garbage, &config).collect_events();
        assert!(matches!(
            result,
            Err(PanelError::SkipRateExceeded { processed: 4, .. })
        ));
    }
}

//! In-memory event log shared by every node of a fake cluster.
//!
//! One global log holds every event in commit order; streams index into it.
//! Positions in `$all` are `(n, n)` for the n-th event, counting from 1.

use std::collections::HashMap;

use cairn_client::filter::{Filter, FilterExpression, FilterTarget};
use cairn_client::operation::{
    ReadAllOutcome, ReadDirection, ReadEventOutcome, ReadStreamOutcome, WriteOutcome,
};
use cairn_types::{
    CurrentVersion, EventData, EventNumber, ExpectedVersion, Position, RecordedEvent,
    ResolvedEvent, Timestamp,
};
use regex::Regex;

#[derive(Debug, Default)]
struct StreamData {
    /// Indices into the global log, in event-number order.
    events: Vec<usize>,
    /// Events below this number were soft-deleted.
    truncate_before: u64,
    hard_deleted: bool,
}

impl StreamData {
    fn last_number(&self) -> Option<EventNumber> {
        (self.events.len() as u64)
            .checked_sub(1)
            .map(EventNumber::new)
    }

    fn current_version(&self) -> CurrentVersion {
        self.last_number()
            .map_or(CurrentVersion::NoStream, CurrentVersion::Revision)
    }

    fn is_visible(&self) -> bool {
        !self.hard_deleted && (self.events.len() as u64) > self.truncate_before
    }
}

/// The events of a fake cluster.
#[derive(Debug, Default)]
pub struct EventStore {
    log: Vec<RecordedEvent>,
    streams: HashMap<String, StreamData>,
}

fn position_of(index: usize) -> Position {
    let n = index as i64 + 1;
    Position::new(n, n)
}

fn index_of(position: Position) -> usize {
    position.commit.max(1) as usize - 1
}

/// Whether `event` passes `filter`. A pattern that does not compile
/// matches nothing.
pub fn matches_filter(filter: &Filter, event: &RecordedEvent) -> bool {
    let subject = match filter.target() {
        FilterTarget::StreamId => &event.stream_id,
        FilterTarget::EventType => &event.event_type,
    };
    match filter.expression() {
        FilterExpression::Prefix(prefixes) => prefixes.iter().any(|p| subject.starts_with(p)),
        FilterExpression::Regex(pattern) => {
            Regex::new(pattern).is_ok_and(|re| re.is_match(subject))
        }
    }
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events in `$all`.
    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Commit position of the last event, 0 for an empty log.
    pub fn last_commit_position(&self) -> i64 {
        self.log.len() as i64
    }

    pub fn last_event_number(&self, stream: &str) -> Option<EventNumber> {
        self.streams.get(stream).and_then(StreamData::last_number)
    }

    pub fn current_version(&self, stream: &str) -> CurrentVersion {
        self.streams
            .get(stream)
            .map_or(CurrentVersion::NoStream, StreamData::current_version)
    }

    /// Number the next event appended to `stream` will get.
    pub fn next_event_number(&self, stream: &str) -> u64 {
        self.streams.get(stream).map_or(0, |s| s.events.len() as u64)
    }

    pub fn resolved(&self, index: usize) -> Option<ResolvedEvent> {
        self.log
            .get(index)
            .map(|event| ResolvedEvent::from_event(event.clone(), Some(position_of(index))))
    }

    /// A live event of `stream` by number, skipping deleted ones.
    pub fn stream_event(&self, stream: &str, number: u64) -> Option<ResolvedEvent> {
        let data = self.streams.get(stream)?;
        if data.hard_deleted || number < data.truncate_before {
            return None;
        }
        let index = *data.events.get(number as usize)?;
        self.resolved(index)
    }

    fn check_expected(expected: ExpectedVersion, current: CurrentVersion) -> bool {
        match (expected, current) {
            (ExpectedVersion::Any, _)
            | (ExpectedVersion::NoStream, CurrentVersion::NoStream)
            | (ExpectedVersion::StreamExists, CurrentVersion::Revision(_)) => true,
            (ExpectedVersion::Exact(expected), CurrentVersion::Revision(current)) => {
                expected == current
            }
            _ => false,
        }
    }

    /// Appends `events`; returns the outcome and the log indices written.
    pub fn append(
        &mut self,
        stream: &str,
        expected: ExpectedVersion,
        events: &[EventData],
    ) -> (WriteOutcome, Vec<usize>) {
        let data = self.streams.entry(stream.to_string()).or_default();
        if data.hard_deleted {
            return (WriteOutcome::StreamDeleted, Vec::new());
        }
        let current = data.current_version();
        if !Self::check_expected(expected, current) {
            return (WriteOutcome::WrongExpectedVersion { current }, Vec::new());
        }

        let mut written = Vec::with_capacity(events.len());
        for event in events {
            let index = self.log.len();
            self.log.push(RecordedEvent {
                stream_id: stream.to_string(),
                event_id: event.event_id,
                event_number: EventNumber::new(data.events.len() as u64),
                event_type: event.event_type.clone(),
                is_json: event.is_json,
                data: event.data.clone(),
                metadata: event.metadata.clone(),
                created: Timestamp::now(),
            });
            data.events.push(index);
            written.push(index);
        }

        let position = written.last().map(|&i| position_of(i));
        (
            WriteOutcome::Success {
                next_expected_version: data.current_version(),
                position,
            },
            written,
        )
    }

    pub fn delete(&mut self, stream: &str, expected: ExpectedVersion, hard: bool) -> WriteOutcome {
        let data = self.streams.entry(stream.to_string()).or_default();
        if data.hard_deleted {
            return WriteOutcome::StreamDeleted;
        }
        let current = data.current_version();
        if !Self::check_expected(expected, current) {
            return WriteOutcome::WrongExpectedVersion { current };
        }
        if hard {
            data.hard_deleted = true;
        } else {
            data.truncate_before = data.events.len() as u64;
        }
        WriteOutcome::Success {
            next_expected_version: CurrentVersion::Unknown,
            position: (!self.log.is_empty()).then(|| position_of(self.log.len() - 1)),
        }
    }

    pub fn read_event(&self, stream: &str, number: Option<EventNumber>) -> ReadEventOutcome {
        let Some(data) = self.streams.get(stream) else {
            return ReadEventOutcome::NoStream;
        };
        if data.hard_deleted {
            return ReadEventOutcome::StreamDeleted;
        }
        if !data.is_visible() {
            return ReadEventOutcome::NoStream;
        }
        let number = match number {
            Some(number) => number.as_u64(),
            None => data.events.len() as u64 - 1,
        };
        match self.stream_event(stream, number) {
            Some(event) => ReadEventOutcome::Success(event),
            None => ReadEventOutcome::NotFound,
        }
    }

    pub fn read_stream(
        &self,
        stream: &str,
        from: Option<EventNumber>,
        max_count: u32,
        direction: ReadDirection,
    ) -> ReadStreamOutcome {
        let Some(data) = self.streams.get(stream) else {
            return ReadStreamOutcome::NoStream;
        };
        if data.hard_deleted {
            return ReadStreamOutcome::StreamDeleted;
        }
        if !data.is_visible() {
            return ReadStreamOutcome::NoStream;
        }

        let len = data.events.len() as u64;
        let first = data.truncate_before;
        let last = len - 1;
        let max = u64::from(max_count);

        match direction {
            ReadDirection::Forward => {
                let start = from.map_or(first, |n| n.as_u64()).max(first);
                let end = start.saturating_add(max).min(len);
                let events = (start..end)
                    .filter_map(|n| self.stream_event(stream, n))
                    .collect();
                ReadStreamOutcome::Success {
                    events,
                    next_event_number: Some(EventNumber::new(end.max(start))),
                    last_event_number: Some(EventNumber::new(last)),
                    is_end_of_stream: end > last,
                }
            }
            ReadDirection::Backward => {
                let start = from.map_or(last, |n| n.as_u64()).min(last);
                if start < first {
                    return ReadStreamOutcome::Success {
                        events: Vec::new(),
                        next_event_number: None,
                        last_event_number: Some(EventNumber::new(last)),
                        is_end_of_stream: true,
                    };
                }
                let lowest = start.saturating_sub(max.saturating_sub(1)).max(first);
                let events = (lowest..=start)
                    .rev()
                    .filter_map(|n| self.stream_event(stream, n))
                    .collect();
                let reached_first = lowest == first;
                ReadStreamOutcome::Success {
                    events,
                    next_event_number: (!reached_first).then(|| EventNumber::new(lowest - 1)),
                    last_event_number: Some(EventNumber::new(last)),
                    is_end_of_stream: reached_first,
                }
            }
        }
    }

    fn is_readable(&self, event: &RecordedEvent) -> bool {
        self.streams.get(&event.stream_id).is_some_and(|data| {
            !data.hard_deleted && event.event_number.as_u64() >= data.truncate_before
        })
    }

    /// Reads `$all`. A filter scans at most `max_search_window` events.
    pub fn read_all(
        &self,
        position: Position,
        max_count: u32,
        direction: ReadDirection,
        filter: Option<&Filter>,
        max_search_window: Option<u32>,
    ) -> ReadAllOutcome {
        let max = max_count as usize;
        let window = max_search_window.map_or(usize::MAX, |w| w as usize);
        let keep = |event: &RecordedEvent| {
            self.is_readable(event) && filter.is_none_or(|f| matches_filter(f, event))
        };

        match direction {
            ReadDirection::Forward => {
                let start = index_of(position).min(self.log.len());
                let mut events = Vec::new();
                let mut next = start;
                while next < self.log.len() && events.len() < max && next - start < window {
                    if keep(&self.log[next]) {
                        events.extend(self.resolved(next));
                    }
                    next += 1;
                }
                ReadAllOutcome::Success {
                    events,
                    position,
                    next_position: position_of(next),
                    is_end_of_stream: next >= self.log.len(),
                }
            }
            ReadDirection::Backward => {
                let mut cursor = if position.is_end() {
                    self.log.len()
                } else {
                    index_of(position).min(self.log.len())
                };
                let mut events = Vec::new();
                let mut scanned = 0;
                while cursor > 0 && events.len() < max && scanned < window {
                    cursor -= 1;
                    scanned += 1;
                    if keep(&self.log[cursor]) {
                        events.extend(self.resolved(cursor));
                    }
                }
                ReadAllOutcome::Success {
                    events,
                    position,
                    next_position: position_of(cursor),
                    is_end_of_stream: cursor == 0,
                }
            }
        }
    }
}

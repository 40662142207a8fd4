//! Typed operation results.
//!
//! Built from a reply that inspection already accepted, so the only failure
//! left is a reply of the wrong shape.

use bytes::Bytes;
use cairn_types::{CurrentVersion, EventNumber, Position, ResolvedEvent};

use crate::error::{ClientError, ClientResult};
use crate::operation::{
    OperationKind, ReadAllOutcome, ReadDirection, ReadEventOutcome, ReadStreamOutcome, Reply,
    WriteOutcome,
};

fn unexpected(kind: OperationKind, reply: &Reply) -> ClientError {
    ClientError::Protocol(format!("unexpected reply to {kind}: {reply:?}"))
}

/// Outcome of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Expected version for the next append to the same stream.
    pub next_expected_version: CurrentVersion,
    pub log_position: Option<Position>,
}

impl WriteResult {
    pub(crate) fn from_reply(reply: Reply) -> ClientResult<Self> {
        match reply {
            Reply::Write(WriteOutcome::Success {
                next_expected_version,
                position,
            }) => Ok(Self {
                next_expected_version,
                log_position: position,
            }),
            other => Err(unexpected(OperationKind::AppendToStream, &other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalWriteStatus {
    Succeeded,
    VersionMismatch,
    StreamDeleted,
}

/// Outcome of a conditional append. Only `Succeeded` carries a version and
/// position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionalWriteResult {
    pub status: ConditionalWriteStatus,
    pub next_expected_version: Option<CurrentVersion>,
    pub log_position: Option<Position>,
}

impl ConditionalWriteResult {
    pub(crate) fn from_reply(reply: Reply) -> ClientResult<Self> {
        let status_only = |status| Self {
            status,
            next_expected_version: None,
            log_position: None,
        };
        match reply {
            Reply::Write(WriteOutcome::Success {
                next_expected_version,
                position,
            }) => Ok(Self {
                status: ConditionalWriteStatus::Succeeded,
                next_expected_version: Some(next_expected_version),
                log_position: position,
            }),
            Reply::Write(WriteOutcome::WrongExpectedVersion { .. }) => {
                Ok(status_only(ConditionalWriteStatus::VersionMismatch))
            }
            Reply::Write(WriteOutcome::StreamDeleted) => {
                Ok(status_only(ConditionalWriteStatus::StreamDeleted))
            }
            other => Err(unexpected(OperationKind::ConditionalAppendToStream, &other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub log_position: Option<Position>,
}

impl DeleteResult {
    pub(crate) fn from_reply(reply: Reply) -> ClientResult<Self> {
        match reply {
            Reply::Delete(WriteOutcome::Success { position, .. }) => Ok(Self {
                log_position: position,
            }),
            other => Err(unexpected(OperationKind::DeleteStream, &other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReadStatus {
    Success,
    NotFound,
    NoStream,
    StreamDeleted,
}

/// Result of reading a single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReadResult {
    pub status: EventReadStatus,
    pub stream: String,
    /// The requested number; `None` when the last event was requested.
    pub event_number: Option<EventNumber>,
    pub event: Option<ResolvedEvent>,
}

impl EventReadResult {
    pub(crate) fn from_reply(
        stream: String,
        event_number: Option<EventNumber>,
        reply: Reply,
    ) -> ClientResult<Self> {
        let (status, event) = match reply {
            Reply::ReadEvent(ReadEventOutcome::Success(event)) => {
                (EventReadStatus::Success, Some(event))
            }
            Reply::ReadEvent(ReadEventOutcome::NotFound) => (EventReadStatus::NotFound, None),
            Reply::ReadEvent(ReadEventOutcome::NoStream) => (EventReadStatus::NoStream, None),
            Reply::ReadEvent(ReadEventOutcome::StreamDeleted) => {
                (EventReadStatus::StreamDeleted, None)
            }
            other => return Err(unexpected(OperationKind::ReadEvent, &other)),
        };
        Ok(Self {
            status,
            stream,
            event_number,
            event,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceReadStatus {
    Success,
    StreamNotFound,
    StreamDeleted,
}

/// A page of events from one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventsSlice {
    pub status: SliceReadStatus,
    pub stream: String,
    pub from_event_number: Option<EventNumber>,
    pub direction: ReadDirection,
    pub events: Vec<ResolvedEvent>,
    /// Where the next page starts; `None` once a backward read has passed
    /// the first event.
    pub next_event_number: Option<EventNumber>,
    pub last_event_number: Option<EventNumber>,
    pub is_end_of_stream: bool,
}

impl StreamEventsSlice {
    pub(crate) fn from_reply(
        stream: String,
        from_event_number: Option<EventNumber>,
        direction: ReadDirection,
        reply: Reply,
    ) -> ClientResult<Self> {
        let (status, events, next_event_number, last_event_number, is_end_of_stream) = match reply
        {
            Reply::ReadStream(ReadStreamOutcome::Success {
                events,
                next_event_number,
                last_event_number,
                is_end_of_stream,
            }) => (
                SliceReadStatus::Success,
                events,
                next_event_number,
                last_event_number,
                is_end_of_stream,
            ),
            Reply::ReadStream(ReadStreamOutcome::NoStream) => {
                (SliceReadStatus::StreamNotFound, Vec::new(), None, None, true)
            }
            Reply::ReadStream(ReadStreamOutcome::StreamDeleted) => {
                (SliceReadStatus::StreamDeleted, Vec::new(), None, None, true)
            }
            other => {
                let kind = match direction {
                    ReadDirection::Forward => OperationKind::ReadStreamEventsForward,
                    ReadDirection::Backward => OperationKind::ReadStreamEventsBackward,
                };
                return Err(unexpected(kind, &other));
            }
        };
        Ok(Self {
            status,
            stream,
            from_event_number,
            direction,
            events,
            next_event_number,
            last_event_number,
            is_end_of_stream,
        })
    }
}

/// A page of events from `$all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllEventsSlice {
    pub direction: ReadDirection,
    pub from_position: Position,
    pub next_position: Position,
    pub events: Vec<ResolvedEvent>,
    pub is_end_of_stream: bool,
}

impl AllEventsSlice {
    pub(crate) fn from_reply(direction: ReadDirection, reply: Reply) -> ClientResult<Self> {
        match reply {
            Reply::ReadAll(ReadAllOutcome::Success {
                events,
                position,
                next_position,
                is_end_of_stream,
            }) => Ok(Self {
                direction,
                from_position: position,
                next_position,
                events,
                is_end_of_stream,
            }),
            other => Err(unexpected(
                match direction {
                    ReadDirection::Forward => OperationKind::ReadAllEventsForward,
                    ReadDirection::Backward => OperationKind::ReadAllEventsBackward,
                },
                &other,
            )),
        }
    }
}

/// Raw metadata of a stream, read from its metastream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawStreamMetadataResult {
    pub stream: String,
    pub is_stream_deleted: bool,
    pub metastream_version: CurrentVersion,
    /// Empty when no metadata was ever set.
    pub metadata: Bytes,
}

impl RawStreamMetadataResult {
    pub(crate) fn from_metastream_read(stream: String, read: EventReadResult) -> Self {
        let (is_stream_deleted, metastream_version, metadata) = match (read.status, read.event) {
            (EventReadStatus::Success, Some(event)) => {
                let recorded = event.original_event();
                (
                    false,
                    CurrentVersion::Revision(recorded.event_number),
                    recorded.data.clone(),
                )
            }
            (EventReadStatus::StreamDeleted, _) => (true, CurrentVersion::Unknown, Bytes::new()),
            _ => (false, CurrentVersion::NoStream, Bytes::new()),
        };
        Self {
            stream,
            is_stream_deleted,
            metastream_version,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_types::{RecordedEvent, Timestamp};
    use uuid::Uuid;

    fn metadata_event(number: u64, data: &'static str) -> ResolvedEvent {
        ResolvedEvent::from_event(
            RecordedEvent {
                stream_id: "$$orders".to_string(),
                event_id: Uuid::new_v4(),
                event_number: EventNumber::new(number),
                event_type: cairn_types::METADATA_EVENT_TYPE.to_string(),
                is_json: true,
                data: Bytes::from_static(data.as_bytes()),
                metadata: Bytes::new(),
                created: Timestamp::EPOCH,
            },
            None,
        )
    }

    #[test]
    fn test_conditional_statuses() {
        let mismatch = ConditionalWriteResult::from_reply(Reply::Write(
            WriteOutcome::WrongExpectedVersion {
                current: CurrentVersion::NoStream,
            },
        ))
        .unwrap();
        assert_eq!(mismatch.status, ConditionalWriteStatus::VersionMismatch);
        assert_eq!(mismatch.next_expected_version, None);

        let ok = ConditionalWriteResult::from_reply(Reply::Write(WriteOutcome::Success {
            next_expected_version: CurrentVersion::Revision(EventNumber::new(0)),
            position: Some(Position::new(10, 10)),
        }))
        .unwrap();
        assert_eq!(ok.status, ConditionalWriteStatus::Succeeded);
    }

    #[test]
    fn test_missing_stream_slice() {
        let slice = StreamEventsSlice::from_reply(
            "orders".to_string(),
            Some(EventNumber::ZERO),
            ReadDirection::Forward,
            Reply::ReadStream(ReadStreamOutcome::NoStream),
        )
        .unwrap();
        assert_eq!(slice.status, SliceReadStatus::StreamNotFound);
        assert!(slice.events.is_empty());
        assert!(slice.is_end_of_stream);
    }

    #[test]
    fn test_wrong_shape_is_protocol_error() {
        let err = WriteResult::from_reply(Reply::Delete(WriteOutcome::StreamDeleted)).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn test_metadata_from_metastream() {
        let read = EventReadResult::from_reply(
            "$$orders".to_string(),
            None,
            Reply::ReadEvent(ReadEventOutcome::Success(metadata_event(3, r#"{"$maxCount":5}"#))),
        )
        .unwrap();
        let meta = RawStreamMetadataResult::from_metastream_read("orders".to_string(), read);
        assert!(!meta.is_stream_deleted);
        assert_eq!(
            meta.metastream_version,
            CurrentVersion::Revision(EventNumber::new(3))
        );
        assert_eq!(&meta.metadata[..], br#"{"$maxCount":5}"#);

        let missing = EventReadResult::from_reply(
            "$$orders".to_string(),
            None,
            Reply::ReadEvent(ReadEventOutcome::NoStream),
        )
        .unwrap();
        let meta = RawStreamMetadataResult::from_metastream_read("orders".to_string(), missing);
        assert_eq!(meta.metastream_version, CurrentVersion::NoStream);
        assert!(meta.metadata.is_empty());
    }
}

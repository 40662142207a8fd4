//! # cairn-types: Core types for `cairn`
//!
//! This crate contains the value types shared by the configuration layer and
//! the client engine:
//! - Log coordinates ([`Position`], [`EventNumber`])
//! - Optimistic concurrency ([`ExpectedVersion`], [`CurrentVersion`])
//! - Events ([`EventData`], [`RecordedEvent`], [`ResolvedEvent`])
//! - Temporal types ([`Timestamp`])
//! - Cluster topology ([`Endpoint`], [`NodeEndpoints`], [`MemberRole`],
//!   [`ClusterMember`], [`NodePreference`])
//! - Identity ([`Credentials`])
//! - Stream naming helpers ([`ALL_STREAM`], [`metastream_of`])

use std::{
    fmt::{Debug, Display},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Stream naming
// ============================================================================

/// Name under which the global, all-streams log is addressed.
pub const ALL_STREAM: &str = "$all";

/// Prefix that turns a stream name into the name of its metadata stream.
pub const METASTREAM_PREFIX: &str = "$$";

/// Event type written to a metadata stream when stream metadata is set.
pub const METADATA_EVENT_TYPE: &str = "$metadata";

/// Returns the metadata stream for `stream`.
///
/// ```
/// # use cairn_types::metastream_of;
/// assert_eq!(metastream_of("orders"), "$$orders");
/// ```
pub fn metastream_of(stream: &str) -> String {
    format!("{METASTREAM_PREFIX}{stream}")
}

/// Returns true when `stream` names a metadata stream.
pub fn is_metastream(stream: &str) -> bool {
    stream.starts_with(METASTREAM_PREFIX)
}

// ============================================================================
// Log coordinates - All Copy
// ============================================================================

/// Zero-based index of an event within a single stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct EventNumber(u64);

impl EventNumber {
    pub const ZERO: EventNumber = EventNumber(0);

    pub fn new(number: u64) -> Self {
        Self(number)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// The event number directly after this one.
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The event number directly before this one, if any.
    pub fn previous(self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }
}

impl Display for EventNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EventNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<EventNumber> for u64 {
    fn from(number: EventNumber) -> Self {
        number.0
    }
}

/// A position in the global `$all` log.
///
/// Positions are ordered by commit position first and prepare position
/// second. [`Position::END`] is a request sentinel ("read backwards from the
/// head") and never appears on a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub commit: i64,
    pub prepare: i64,
}

impl Position {
    /// The beginning of the log.
    pub const START: Position = Position {
        commit: 0,
        prepare: 0,
    };

    /// The end of the log.
    pub const END: Position = Position {
        commit: -1,
        prepare: -1,
    };

    pub fn new(commit: i64, prepare: i64) -> Self {
        Self { commit, prepare }
    }

    pub fn is_end(&self) -> bool {
        *self == Self::END
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.commit, self.prepare)
    }
}

// ============================================================================
// Optimistic concurrency
// ============================================================================

/// Precondition on the current revision of a stream, checked by the server
/// when writing or deleting.
///
/// On the wire the non-exact variants are negative sentinels: `Any = -2`,
/// `NoStream = -1`, `StreamExists = -4`. `-3` and anything below `-4` are
/// rejected by [`ExpectedVersion::from_wire`]. Exact revisions above
/// `i64::MAX` have no encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Write regardless of the stream's state.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream must exist, at any revision.
    StreamExists,
    /// The stream's last event number must equal this value.
    Exact(EventNumber),
}

impl ExpectedVersion {
    pub const ANY_WIRE: i64 = -2;
    pub const NO_STREAM_WIRE: i64 = -1;
    pub const STREAM_EXISTS_WIRE: i64 = -4;

    pub fn exact(number: u64) -> Self {
        Self::Exact(EventNumber::new(number))
    }

    /// Returns the wire encoding of this expectation.
    pub fn to_wire(self) -> Result<i64, TypeError> {
        match self {
            Self::Any => Ok(Self::ANY_WIRE),
            Self::NoStream => Ok(Self::NO_STREAM_WIRE),
            Self::StreamExists => Ok(Self::STREAM_EXISTS_WIRE),
            Self::Exact(number) => i64::try_from(number.as_u64())
                .map_err(|_| TypeError::ExpectedVersionOutOfRange(number.as_u64())),
        }
    }

    /// Decodes a wire value.
    pub fn from_wire(value: i64) -> Result<Self, TypeError> {
        match value {
            Self::ANY_WIRE => Ok(Self::Any),
            Self::NO_STREAM_WIRE => Ok(Self::NoStream),
            Self::STREAM_EXISTS_WIRE => Ok(Self::StreamExists),
            n if n >= 0 => Ok(Self::Exact(EventNumber::new(n as u64))),
            other => Err(TypeError::InvalidExpectedVersion(other)),
        }
    }
}

impl TryFrom<i64> for ExpectedVersion {
    type Error = TypeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::from_wire(value)
    }
}

impl Display for ExpectedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::NoStream => write!(f, "no stream"),
            Self::StreamExists => write!(f, "stream exists"),
            Self::Exact(number) => write!(f, "{number}"),
        }
    }
}

/// The revision a stream was actually at, as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CurrentVersion {
    /// The stream has no events.
    NoStream,
    /// Number of the stream's last event.
    Revision(EventNumber),
    /// The server did not say.
    Unknown,
}

impl CurrentVersion {
    /// The expectation that would succeed against this revision.
    pub fn as_expected(self) -> ExpectedVersion {
        match self {
            Self::NoStream => ExpectedVersion::NoStream,
            Self::Revision(number) => ExpectedVersion::Exact(number),
            Self::Unknown => ExpectedVersion::Any,
        }
    }

    /// Decodes a wire value, where `-1` means the stream does not exist.
    pub fn from_wire(value: Option<i64>) -> Self {
        match value {
            Some(n) if n >= 0 => Self::Revision(EventNumber::new(n as u64)),
            Some(-1) => Self::NoStream,
            _ => Self::Unknown,
        }
    }
}

impl Display for CurrentVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoStream => write!(f, "no stream"),
            Self::Revision(number) => write!(f, "{number}"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

// ============================================================================
// Timestamp - Copy (8-byte value)
// ============================================================================

/// Wall-clock timestamp with nanosecond precision since Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Current wall-clock time. A clock set before the epoch reads as
    /// [`Timestamp::EPOCH`].
    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(Self::EPOCH, |d| Self(d.as_nanos() as u64))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.0 / 1_000_000_000;
        let nanos = self.0 % 1_000_000_000;
        write!(f, "{secs}.{nanos:09}")
    }
}

impl From<u64> for Timestamp {
    fn from(nanos: u64) -> Self {
        Self(nanos)
    }
}

// ============================================================================
// Events
// ============================================================================

/// An event the client wants to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData {
    pub event_id: Uuid,
    pub event_type: String,
    pub is_json: bool,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl EventData {
    /// A JSON event with a fresh random id.
    pub fn json(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(event_type, true, data)
    }

    /// A binary event with a fresh random id.
    pub fn binary(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(event_type, false, data)
    }

    fn new(event_type: impl Into<String>, is_json: bool, data: impl Into<Bytes>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json,
            data: data.into(),
            metadata: Bytes::new(),
        }
    }

    pub fn with_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }
}

/// An event as stored by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub stream_id: String,
    pub event_id: Uuid,
    pub event_number: EventNumber,
    pub event_type: String,
    pub is_json: bool,
    pub data: Bytes,
    pub metadata: Bytes,
    pub created: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Resolution {
    Event(RecordedEvent),
    Link {
        link: RecordedEvent,
        target: Option<RecordedEvent>,
    },
}

/// An event as delivered by reads and subscriptions.
///
/// When the server resolved a link event, both the link and the event it
/// points at are carried. The *original* event is the one that actually
/// lives in the stream being read: the link if there is one, the event
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEvent {
    resolution: Resolution,
    original_position: Option<Position>,
}

impl ResolvedEvent {
    /// A plain event, not reached through a link.
    pub fn from_event(event: RecordedEvent, position: Option<Position>) -> Self {
        Self {
            resolution: Resolution::Event(event),
            original_position: position,
        }
    }

    /// A link event. `target` is `None` when the linked event no longer
    /// exists or link resolution was not requested.
    pub fn from_link(
        link: RecordedEvent,
        target: Option<RecordedEvent>,
        position: Option<Position>,
    ) -> Self {
        Self {
            resolution: Resolution::Link { link, target },
            original_position: position,
        }
    }

    /// The resolved event, if available.
    pub fn event(&self) -> Option<&RecordedEvent> {
        match &self.resolution {
            Resolution::Event(event) => Some(event),
            Resolution::Link { target, .. } => target.as_ref(),
        }
    }

    /// The link event, if this event was reached through one.
    pub fn link(&self) -> Option<&RecordedEvent> {
        match &self.resolution {
            Resolution::Event(_) => None,
            Resolution::Link { link, .. } => Some(link),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self.resolution,
            Resolution::Link {
                target: Some(_),
                ..
            }
        )
    }

    /// The link if present, otherwise the event.
    pub fn original_event(&self) -> &RecordedEvent {
        match &self.resolution {
            Resolution::Event(event) => event,
            Resolution::Link { link, .. } => link,
        }
    }

    pub fn original_stream_id(&self) -> &str {
        &self.original_event().stream_id
    }

    pub fn original_event_number(&self) -> EventNumber {
        self.original_event().event_number
    }

    /// Position in `$all`; only present for events read from `$all` or
    /// pushed by a subscription.
    pub fn original_position(&self) -> Option<Position> {
        self.original_position
    }
}

// ============================================================================
// Cluster topology
// ============================================================================

/// A `host:port` network address. The host may be a DNS name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host[:port]`, falling back to `default_port` when the port is
    /// omitted.
    pub fn parse_with_default_port(input: &str, default_port: u16) -> Result<Self, TypeError> {
        let input = input.trim();
        let (host, port) = split_host_port(input)?;
        let port = match port {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| TypeError::InvalidEndpoint(input.to_string()))?,
            None => default_port,
        };
        Ok(Self::new(host, port))
    }
}

/// Splits `host:port`, `[v6]:port`, `host` and `[v6]`.
fn split_host_port(input: &str) -> Result<(&str, Option<&str>), TypeError> {
    let invalid = || TypeError::InvalidEndpoint(input.to_string());

    if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        return match tail {
            "" => Ok((host, None)),
            t => t
                .strip_prefix(':')
                .map(|port| (host, Some(port)))
                .ok_or_else(invalid),
        };
    }

    let (host, port) = match input.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, Some(port)),
        Some(_) => return Err(invalid()),
        None => (input, None),
    };
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host, port))
}

impl FromStr for Endpoint {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = split_host_port(s.trim())?;
        let port = port
            .ok_or_else(|| TypeError::InvalidEndpoint(s.to_string()))?
            .parse::<u16>()
            .map_err(|_| TypeError::InvalidEndpoint(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The addresses a cluster node listens on.
///
/// At least one of the plain and secure TCP endpoints is always present.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawNodeEndpoints", into = "RawNodeEndpoints")]
pub struct NodeEndpoints {
    tcp: TcpEndpoints,
    http: Option<Endpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TcpEndpoints {
    Plain(Endpoint),
    Secure(Endpoint),
    Both { plain: Endpoint, secure: Endpoint },
}

#[derive(Serialize, Deserialize)]
struct RawNodeEndpoints {
    tcp: Option<Endpoint>,
    secure_tcp: Option<Endpoint>,
    http: Option<Endpoint>,
}

impl TryFrom<RawNodeEndpoints> for NodeEndpoints {
    type Error = TypeError;

    fn try_from(raw: RawNodeEndpoints) -> Result<Self, Self::Error> {
        Self::new(raw.tcp, raw.secure_tcp, raw.http)
    }
}

impl From<NodeEndpoints> for RawNodeEndpoints {
    fn from(endpoints: NodeEndpoints) -> Self {
        Self {
            tcp: endpoints.tcp().cloned(),
            secure_tcp: endpoints.secure_tcp().cloned(),
            http: endpoints.http,
        }
    }
}

impl NodeEndpoints {
    pub fn new(
        tcp: Option<Endpoint>,
        secure_tcp: Option<Endpoint>,
        http: Option<Endpoint>,
    ) -> Result<Self, TypeError> {
        let tcp = match (tcp, secure_tcp) {
            (Some(plain), Some(secure)) => TcpEndpoints::Both { plain, secure },
            (Some(plain), None) => TcpEndpoints::Plain(plain),
            (None, Some(secure)) => TcpEndpoints::Secure(secure),
            (None, None) => return Err(TypeError::MissingTcpEndpoint),
        };
        Ok(Self { tcp, http })
    }

    /// Endpoints for a node reachable over plain TCP only.
    pub fn plain(tcp: Endpoint) -> Self {
        Self {
            tcp: TcpEndpoints::Plain(tcp),
            http: None,
        }
    }

    /// Endpoints for a node reachable over TLS only.
    pub fn secure(secure_tcp: Endpoint) -> Self {
        Self {
            tcp: TcpEndpoints::Secure(secure_tcp),
            http: None,
        }
    }

    pub fn with_http(mut self, http: Endpoint) -> Self {
        self.http = Some(http);
        self
    }

    pub fn tcp(&self) -> Option<&Endpoint> {
        match &self.tcp {
            TcpEndpoints::Plain(plain) | TcpEndpoints::Both { plain, .. } => Some(plain),
            TcpEndpoints::Secure(_) => None,
        }
    }

    pub fn secure_tcp(&self) -> Option<&Endpoint> {
        match &self.tcp {
            TcpEndpoints::Secure(secure) | TcpEndpoints::Both { secure, .. } => Some(secure),
            TcpEndpoints::Plain(_) => None,
        }
    }

    pub fn http(&self) -> Option<&Endpoint> {
        self.http.as_ref()
    }

    /// The endpoint to open a client connection to. TLS connections use the
    /// secure endpoint when the node has one; plain connections use the
    /// plain one when it exists.
    pub fn connect_target(&self, use_tls: bool) -> &Endpoint {
        match &self.tcp {
            TcpEndpoints::Plain(endpoint) | TcpEndpoints::Secure(endpoint) => endpoint,
            TcpEndpoints::Both { plain, secure } => {
                if use_tls {
                    secure
                } else {
                    plain
                }
            }
        }
    }
}

impl Display for NodeEndpoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |e: Option<&Endpoint>| e.map_or("n/a".to_string(), ToString::to_string);
        write!(
            f,
            "[tcp: {}, secure: {}]",
            show(self.tcp()),
            show(self.secure_tcp())
        )
    }
}

/// Role a node currently plays in the cluster, as advertised by gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Leader,
    Follower,
    ReadOnlyReplica,
    #[serde(other)]
    Unknown,
}

impl Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leader => write!(f, "leader"),
            Self::Follower => write!(f, "follower"),
            Self::ReadOnlyReplica => write!(f, "read-only replica"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One entry of a gossip response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub endpoints: NodeEndpoints,
    pub role: MemberRole,
    pub alive: bool,
    #[serde(default)]
    pub last_seen: Timestamp,
}

impl ClusterMember {
    pub fn new(endpoints: NodeEndpoints, role: MemberRole) -> Self {
        Self {
            endpoints,
            role,
            alive: true,
            last_seen: Timestamp::now(),
        }
    }

    pub fn dead(mut self) -> Self {
        self.alive = false;
        self
    }
}

/// Which kind of node discovery should hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodePreference {
    #[default]
    Leader,
    Follower,
    ReadOnlyReplica,
    Random,
}

impl NodePreference {
    /// Whether a member with `role` satisfies this preference exactly.
    pub fn matches(self, role: MemberRole) -> bool {
        match self {
            Self::Leader => role == MemberRole::Leader,
            Self::Follower => role == MemberRole::Follower,
            Self::ReadOnlyReplica => role == MemberRole::ReadOnlyReplica,
            Self::Random => role != MemberRole::Unknown,
        }
    }
}

impl FromStr for NodePreference {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "leader" | "master" => Ok(Self::Leader),
            "follower" | "slave" => Ok(Self::Follower),
            "readonlyreplica" => Ok(Self::ReadOnlyReplica),
            "random" => Ok(Self::Random),
            _ => Err(TypeError::InvalidNodePreference(s.to_string())),
        }
    }
}

impl Display for NodePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leader => write!(f, "leader"),
            Self::Follower => write!(f, "follower"),
            Self::ReadOnlyReplica => write!(f, "read-only replica"),
            Self::Random => write!(f, "random"),
        }
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Username and password presented to the server.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl FromStr for Credentials {
    type Err = TypeError;

    /// Parses `user:password`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((user, pass)) if !user.trim().is_empty() => {
                Ok(Self::new(user.trim(), pass.trim()))
            }
            _ => Err(TypeError::InvalidCredentials),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error returned when a value cannot be constructed or decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    /// Expected-version sentinel outside the defined set.
    InvalidExpectedVersion(i64),
    /// Exact revision too large to encode.
    ExpectedVersionOutOfRange(u64),
    /// A node must advertise a plain or a secure TCP endpoint.
    MissingTcpEndpoint,
    InvalidEndpoint(String),
    InvalidNodePreference(String),
    /// Credentials must be `user:password` with a non-empty user.
    InvalidCredentials,
}

impl Display for TypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidExpectedVersion(v) => write!(f, "invalid expected version: {v}"),
            Self::ExpectedVersionOutOfRange(v) => {
                write!(f, "expected version {v} exceeds {}", i64::MAX)
            }
            Self::MissingTcpEndpoint => {
                write!(f, "node endpoints need a tcp or secure tcp endpoint")
            }
            Self::InvalidEndpoint(s) => write!(f, "invalid endpoint '{s}'"),
            Self::InvalidNodePreference(s) => write!(f, "invalid node preference '{s}'"),
            Self::InvalidCredentials => write!(f, "credentials must be 'user:password'"),
        }
    }
}

impl std::error::Error for TypeError {}

#[cfg(test)]
mod tests;

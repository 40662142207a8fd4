use super::*;
use proptest::prelude::*;
use test_case::test_case;

fn recorded(stream: &str, number: u64) -> RecordedEvent {
    RecordedEvent {
        stream_id: stream.to_string(),
        event_id: Uuid::new_v4(),
        event_number: EventNumber::new(number),
        event_type: "test-event".to_string(),
        is_json: true,
        data: Bytes::from_static(b"{}"),
        metadata: Bytes::new(),
        created: Timestamp::from_nanos(1),
    }
}

// ============================================================================
// ExpectedVersion
// ============================================================================

#[test_case(-2, ExpectedVersion::Any; "any")]
#[test_case(-1, ExpectedVersion::NoStream; "no stream")]
#[test_case(-4, ExpectedVersion::StreamExists; "stream exists")]
#[test_case(0, ExpectedVersion::exact(0); "exact zero")]
#[test_case(41, ExpectedVersion::exact(41); "exact positive")]
fn expected_version_decodes_sentinels(wire: i64, expected: ExpectedVersion) {
    assert_eq!(ExpectedVersion::from_wire(wire), Ok(expected));
    assert_eq!(expected.to_wire(), Ok(wire));
}

#[test]
fn expected_version_exact_never_encodes_as_a_sentinel() {
    assert_eq!(
        ExpectedVersion::exact(i64::MAX as u64).to_wire(),
        Ok(i64::MAX)
    );
    for revision in [i64::MAX as u64 + 1, u64::MAX - 1, u64::MAX] {
        assert_eq!(
            ExpectedVersion::exact(revision).to_wire(),
            Err(TypeError::ExpectedVersionOutOfRange(revision))
        );
    }
}

#[test_case(-3; "minus three")]
#[test_case(-5; "below stream exists")]
#[test_case(i64::MIN; "min")]
fn expected_version_rejects_undefined_sentinels(wire: i64) {
    assert_eq!(
        ExpectedVersion::try_from(wire),
        Err(TypeError::InvalidExpectedVersion(wire))
    );
}

#[test]
fn current_version_maps_back_to_an_expectation() {
    assert_eq!(
        CurrentVersion::from_wire(Some(-1)).as_expected(),
        ExpectedVersion::NoStream
    );
    assert_eq!(
        CurrentVersion::from_wire(Some(7)).as_expected(),
        ExpectedVersion::exact(7)
    );
    assert_eq!(CurrentVersion::from_wire(None), CurrentVersion::Unknown);
}

proptest! {
    #[test]
    fn prop_exact_wire_is_never_negative(revision in any::<u64>()) {
        match ExpectedVersion::exact(revision).to_wire() {
            Ok(wire) => prop_assert!(wire >= 0),
            Err(err) => {
                prop_assert!(revision > i64::MAX as u64);
                prop_assert_eq!(err, TypeError::ExpectedVersionOutOfRange(revision));
            }
        }
    }

    #[test]
    fn prop_expected_version_wire_is_stable(wire in -10i64..10_000) {
        match ExpectedVersion::from_wire(wire) {
            Ok(version) => prop_assert_eq!(version.to_wire(), Ok(wire)),
            Err(_) => prop_assert!(wire == -3 || wire < -4),
        }
    }
}

// ============================================================================
// Positions
// ============================================================================

#[test]
fn positions_order_by_commit_then_prepare() {
    let a = Position::new(10, 5);
    let b = Position::new(10, 6);
    let c = Position::new(11, 0);
    assert!(a < b);
    assert!(b < c);
    assert!(Position::START < a);
    assert!(Position::END.is_end());
    assert_eq!(Position::new(3, 2).to_string(), "3/2");
}

#[test]
fn event_number_steps() {
    assert_eq!(EventNumber::ZERO.next(), EventNumber::new(1));
    assert_eq!(EventNumber::ZERO.previous(), None);
    assert_eq!(EventNumber::new(5).previous(), Some(EventNumber::new(4)));
}

// ============================================================================
// Resolved events
// ============================================================================

#[test]
fn original_event_is_the_link_when_present() {
    let target = recorded("orders", 3);
    let link = recorded("$ce-orders", 0);
    let resolved = ResolvedEvent::from_link(link.clone(), Some(target.clone()), None);

    assert_eq!(resolved.original_event(), &link);
    assert_eq!(resolved.event(), Some(&target));
    assert_eq!(resolved.original_stream_id(), "$ce-orders");
    assert!(resolved.is_resolved());
}

#[test]
fn original_event_is_the_event_without_a_link() {
    let event = recorded("orders", 9);
    let resolved = ResolvedEvent::from_event(event.clone(), Some(Position::new(4, 4)));

    assert_eq!(resolved.original_event(), &event);
    assert_eq!(resolved.link(), None);
    assert_eq!(resolved.original_event_number(), EventNumber::new(9));
    assert_eq!(resolved.original_position(), Some(Position::new(4, 4)));
    assert!(!resolved.is_resolved());
}

#[test]
fn dangling_link_keeps_the_link_as_original() {
    let link = recorded("$et-created", 2);
    let resolved = ResolvedEvent::from_link(link.clone(), None, None);
    assert_eq!(resolved.event(), None);
    assert_eq!(resolved.original_event(), &link);
}

// ============================================================================
// Endpoints
// ============================================================================

#[test_case("localhost:1113", "localhost", 1113; "dns name")]
#[test_case("10.0.0.1:2113", "10.0.0.1", 2113; "ipv4")]
#[test_case("[::1]:1113", "::1", 1113; "ipv6")]
fn endpoint_parses(input: &str, host: &str, port: u16) {
    let endpoint: Endpoint = input.parse().unwrap();
    assert_eq!(endpoint, Endpoint::new(host, port));
    assert_eq!(endpoint.to_string(), input);
}

#[test_case(""; "empty")]
#[test_case(":1113"; "missing host")]
#[test_case("host"; "missing port")]
#[test_case("host:notaport"; "bad port")]
#[test_case("::1:1113"; "unbracketed ipv6")]
fn endpoint_rejects(input: &str) {
    assert!(input.parse::<Endpoint>().is_err());
}

#[test]
fn endpoint_default_port_applies_when_omitted() {
    let endpoint = Endpoint::parse_with_default_port("db.internal", 2113).unwrap();
    assert_eq!(endpoint, Endpoint::new("db.internal", 2113));
}

#[test]
fn node_endpoints_require_a_tcp_address() {
    let http = Some(Endpoint::new("a", 2113));
    assert_eq!(
        NodeEndpoints::new(None, None, http),
        Err(TypeError::MissingTcpEndpoint)
    );
}

#[test]
fn node_endpoints_pick_connect_target_by_tls() {
    let both = NodeEndpoints::new(
        Some(Endpoint::new("a", 1113)),
        Some(Endpoint::new("a", 1115)),
        None,
    )
    .unwrap();
    assert_eq!(both.connect_target(true).port, 1115);
    assert_eq!(both.connect_target(false).port, 1113);

    let plain_only = NodeEndpoints::plain(Endpoint::new("b", 1113));
    assert_eq!(plain_only.connect_target(true).port, 1113);
    assert_eq!(plain_only.secure_tcp(), None);
}

#[test]
fn node_endpoints_deserialize_validates() {
    let ok: NodeEndpoints =
        serde_json::from_str(r#"{"tcp":{"host":"a","port":1113},"secure_tcp":null,"http":null}"#)
            .unwrap();
    assert_eq!(ok.tcp(), Some(&Endpoint::new("a", 1113)));

    let err = serde_json::from_str::<NodeEndpoints>(
        r#"{"tcp":null,"secure_tcp":null,"http":{"host":"a","port":2113}}"#,
    );
    assert!(err.is_err());
}

#[test]
fn member_role_tolerates_unknown_states() {
    let role: MemberRole = serde_json::from_str(r#""pre_leader""#).unwrap();
    assert_eq!(role, MemberRole::Unknown);
}

// ============================================================================
// Preferences and credentials
// ============================================================================

#[test_case("Leader", NodePreference::Leader; "leader")]
#[test_case("master", NodePreference::Leader; "legacy leader")]
#[test_case("FOLLOWER", NodePreference::Follower; "follower")]
#[test_case("read_only_replica", NodePreference::ReadOnlyReplica; "read only")]
#[test_case(" random ", NodePreference::Random; "random")]
fn node_preference_parses(input: &str, expected: NodePreference) {
    assert_eq!(input.parse::<NodePreference>(), Ok(expected));
}

#[test]
fn preference_match_is_exact_for_roles() {
    assert!(NodePreference::Leader.matches(MemberRole::Leader));
    assert!(!NodePreference::Leader.matches(MemberRole::Follower));
    assert!(NodePreference::Random.matches(MemberRole::ReadOnlyReplica));
    assert!(!NodePreference::Random.matches(MemberRole::Unknown));
}

#[test]
fn credentials_debug_hides_password() {
    let creds: Credentials = "admin:changeit".parse().unwrap();
    let rendered = format!("{creds:?}");
    assert!(rendered.contains("admin"));
    assert!(!rendered.contains("changeit"));
}

#[test]
fn credentials_require_user() {
    assert_eq!(
        ":secret".parse::<Credentials>(),
        Err(TypeError::InvalidCredentials)
    );
    assert_eq!(
        "nopassword".parse::<Credentials>(),
        Err(TypeError::InvalidCredentials)
    );
}

#[test]
fn metastream_naming() {
    assert_eq!(metastream_of("orders"), "$$orders");
    assert!(is_metastream("$$orders"));
    assert!(!is_metastream("$all"));
}

#[test]
fn event_data_builders() {
    let id = Uuid::new_v4();
    let event = EventData::json("created", r#"{"a":1}"#)
        .with_id(id)
        .with_metadata("meta");
    assert!(event.is_json);
    assert_eq!(event.event_id, id);
    assert_eq!(event.metadata, Bytes::from_static(b"meta"));
    assert!(!EventData::binary("blob", vec![1u8, 2]).is_json);
}

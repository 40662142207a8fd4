//! Live, catch-up and persistent subscriptions against a fake cluster.

use std::time::Duration;

use async_trait::async_trait;
use cairn_client::{
    CatchUpSettings, ClientError, Connection, EventData, EventHandler, EventNumber,
    ExpectedVersion, Filter, NackAction, PersistentEventHandler, PersistentSubscription,
    PersistentSubscriptionSettings, Position, ResolvedEvent, StartFrom, SubscriptionDropReason,
    SubscriptionState, handler_fn,
};
use cairn_test_harness::{FakeCluster, init_tracing, wait_until};
use tokio::sync::mpsc;

const PATIENCE: Duration = Duration::from_secs(30);

async fn append(connection: &Connection, stream: &str, count: usize) {
    let events = (0..count)
        .map(|i| EventData::json("Tested", format!(r#"{{"i":{i}}}"#)))
        .collect();
    connection
        .append_to_stream(stream, ExpectedVersion::Any, events)
        .await
        .unwrap();
}

/// Forwards every event and the switch to live processing to a channel.
struct Recorder {
    tx: mpsc::UnboundedSender<Seen>,
    fail_on: Option<u64>,
}

#[derive(Debug, PartialEq)]
enum Seen {
    Event(String, u64),
    Live,
}

impl Recorder {
    fn new() -> (Self, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, fail_on: None }, rx)
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn event_appeared(&mut self, event: ResolvedEvent) -> anyhow::Result<()> {
        let number = event.original_event_number().as_u64();
        if self.fail_on == Some(number) {
            anyhow::bail!("cannot project event {number}");
        }
        let _ = self.tx.send(Seen::Event(
            event.original_stream_id().to_string(),
            number,
        ));
        Ok(())
    }

    async fn live_processing_started(&mut self) {
        let _ = self.tx.send(Seen::Live);
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Seen>) -> (String, u64) {
    loop {
        match tokio::time::timeout(PATIENCE, rx.recv()).await {
            Ok(Some(Seen::Event(stream, number))) => return (stream, number),
            Ok(Some(Seen::Live)) => {}
            other => panic!("expected an event, got {other:?}"),
        }
    }
}

async fn until_live(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Vec<u64> {
    let mut numbers = Vec::new();
    loop {
        match tokio::time::timeout(PATIENCE, rx.recv()).await {
            Ok(Some(Seen::Event(_, number))) => numbers.push(number),
            Ok(Some(Seen::Live)) => return numbers,
            other => panic!("subscription never went live: {other:?}"),
        }
    }
}

// ============================================================================
// Live
// ============================================================================

#[tokio::test]
async fn test_live_subscription_sees_new_events_only() {
    init_tracing();
    let cluster = FakeCluster::single();
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    append(&connection, "orders", 2).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = connection
        .subscribe_to_stream(
            "orders",
            false,
            handler_fn(move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event.original_event_number().as_u64());
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();
    assert_eq!(subscription.stream_id(), Some("orders"));
    assert_eq!(subscription.last_event_number(), Some(EventNumber::new(1)));
    assert_eq!(subscription.state(), SubscriptionState::Live);

    append(&connection, "orders", 2).await;
    append(&connection, "other", 1).await;
    assert_eq!(rx.recv().await, Some(2));
    assert_eq!(rx.recv().await, Some(3));

    let notice = subscription.unsubscribe().await;
    assert_eq!(notice.reason, SubscriptionDropReason::UserInitiated);
    wait_until(PATIENCE, || cluster.live_subscriptions() == 0).await;
}

#[tokio::test]
async fn test_handler_error_drops_live_subscription() {
    let cluster = FakeCluster::single();
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    let (mut recorder, _rx) = Recorder::new();
    recorder.fail_on = Some(0);

    let subscription = connection
        .subscribe_to_stream("orders", false, recorder)
        .await
        .unwrap();
    append(&connection, "orders", 1).await;

    let notice = subscription.dropped().await;
    assert_eq!(notice.reason, SubscriptionDropReason::EventHandlerException);
    assert!(notice.error.unwrap().contains("cannot project event 0"));
    wait_until(PATIENCE, || cluster.live_subscriptions() == 0).await;
}

#[tokio::test]
async fn test_denied_subscription_is_rejected() {
    let cluster = FakeCluster::single();
    cluster.restrict_stream("payroll", "finance");
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    let (recorder, _rx) = Recorder::new();

    let err = connection
        .subscribe_to_stream("payroll", false, recorder)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::AccessDenied(_)), "{err}");
}

#[tokio::test(start_paused = true)]
async fn test_live_subscription_drops_when_connection_lost() {
    let cluster = FakeCluster::single();
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    let (recorder, _rx) = Recorder::new();
    let subscription = connection
        .subscribe_to_all(false, recorder)
        .await
        .unwrap();
    assert!(subscription.is_subscribed_to_all());

    cluster.kill_connections();
    let notice = subscription.dropped().await;
    assert_eq!(notice.reason, SubscriptionDropReason::ConnectionClosed);
}

#[tokio::test]
async fn test_filtered_subscription_reports_checkpoints() {
    struct Checkpoints {
        events: mpsc::UnboundedSender<String>,
        checkpoints: mpsc::UnboundedSender<Position>,
    }

    #[async_trait]
    impl EventHandler for Checkpoints {
        async fn event_appeared(&mut self, event: ResolvedEvent) -> anyhow::Result<()> {
            let _ = self.events.send(event.original_stream_id().to_string());
            Ok(())
        }

        async fn checkpoint_reached(&mut self, position: Position) -> anyhow::Result<()> {
            let _ = self.checkpoints.send(position);
            Ok(())
        }
    }

    let cluster = FakeCluster::single();
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    let (events, mut seen) = mpsc::unbounded_channel();
    let (checkpoints, mut reached) = mpsc::unbounded_channel();
    let _subscription = connection
        .filtered_subscribe_to_all(
            Filter::stream_id_prefix(["orders-"]),
            2,
            false,
            Checkpoints {
                events,
                checkpoints,
            },
        )
        .await
        .unwrap();

    append(&connection, "users-1", 1).await;
    append(&connection, "orders-1", 1).await;
    append(&connection, "users-2", 2).await;

    assert_eq!(seen.recv().await.as_deref(), Some("orders-1"));
    assert_eq!(reached.recv().await, Some(Position::new(2, 2)));
    assert_eq!(reached.recv().await, Some(Position::new(4, 4)));
    assert!(seen.try_recv().is_err());
}

// ============================================================================
// Catch-up
// ============================================================================

#[tokio::test]
async fn test_catch_up_delivers_history_then_live_exactly_once() {
    let cluster = FakeCluster::single();
    // The live subscription repeats events the history read already
    // covered.
    cluster.redeliver_on_subscribe(3);
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    append(&connection, "orders", 5).await;

    let (recorder, mut rx) = Recorder::new();
    let subscription = connection
        .subscribe_to_stream_from(
            "orders",
            None,
            CatchUpSettings::default().with_read_batch_size(2),
            recorder,
        )
        .unwrap();

    assert_eq!(until_live(&mut rx).await, vec![0, 1, 2, 3, 4]);
    assert_eq!(subscription.state(), SubscriptionState::Live);

    append(&connection, "orders", 2).await;
    assert_eq!(next_event(&mut rx).await.1, 5);
    assert_eq!(next_event(&mut rx).await.1, 6);

    let notice = subscription.unsubscribe().await;
    assert_eq!(notice.reason, SubscriptionDropReason::UserInitiated);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_catch_up_resumes_after_checkpoint() {
    let cluster = FakeCluster::single();
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    append(&connection, "orders", 5).await;

    let (recorder, mut rx) = Recorder::new();
    let _subscription = connection
        .subscribe_to_stream_from(
            "orders",
            Some(EventNumber::new(2)),
            CatchUpSettings::default(),
            recorder,
        )
        .unwrap();
    assert_eq!(until_live(&mut rx).await, vec![3, 4]);
}

#[tokio::test(start_paused = true)]
async fn test_catch_up_survives_reconnect_without_duplicates() {
    let cluster = FakeCluster::single();
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    append(&connection, "orders", 3).await;

    let (recorder, mut rx) = Recorder::new();
    let subscription = connection
        .subscribe_to_stream_from("orders", None, CatchUpSettings::default(), recorder)
        .unwrap();
    assert_eq!(until_live(&mut rx).await, vec![0, 1, 2]);

    cluster.kill_connections();
    append(&connection, "orders", 2).await;

    assert_eq!(next_event(&mut rx).await.1, 3);
    assert_eq!(next_event(&mut rx).await.1, 4);
    wait_until(PATIENCE, || subscription.state() == SubscriptionState::Live).await;
    while let Ok(seen) = rx.try_recv() {
        assert_eq!(seen, Seen::Live);
    }
}

#[tokio::test(start_paused = true)]
async fn test_catch_up_survives_reconnect_while_reading_history() {
    let cluster = FakeCluster::single();
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    append(&connection, "orders", 6).await;
    cluster.set_response_delay(Duration::from_millis(100));

    let (recorder, mut rx) = Recorder::new();
    let subscription = connection
        .subscribe_to_stream_from(
            "orders",
            None,
            CatchUpSettings::default().with_read_batch_size(1),
            recorder,
        )
        .unwrap();
    assert_eq!(next_event(&mut rx).await.1, 0);
    assert_eq!(next_event(&mut rx).await.1, 1);
    assert_eq!(subscription.state(), SubscriptionState::CatchingUp);

    cluster.kill_connections();
    assert_eq!(until_live(&mut rx).await, vec![2, 3, 4, 5]);
    assert_eq!(cluster.stats().connects, 2);

    append(&connection, "orders", 1).await;
    assert_eq!(next_event(&mut rx).await.1, 6);

    let notice = subscription.unsubscribe().await;
    assert_eq!(notice.reason, SubscriptionDropReason::UserInitiated);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_catch_up_on_all_delivers_boundary_events_once() {
    let cluster = FakeCluster::single();
    cluster.redeliver_on_subscribe(3);
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    append(&connection, "orders", 3).await;
    append(&connection, "users", 2).await;

    let (recorder, mut rx) = Recorder::new();
    let subscription = connection
        .subscribe_to_all_from(
            None,
            CatchUpSettings::default().with_read_batch_size(2),
            recorder,
        )
        .unwrap();

    let mut history = Vec::new();
    loop {
        match tokio::time::timeout(PATIENCE, rx.recv()).await {
            Ok(Some(Seen::Event(stream, number))) => history.push((stream, number)),
            Ok(Some(Seen::Live)) => break,
            other => panic!("subscription never went live: {other:?}"),
        }
    }
    let expected: Vec<(String, u64)> = [
        ("orders", 0),
        ("orders", 1),
        ("orders", 2),
        ("users", 0),
        ("users", 1),
    ]
    .into_iter()
    .map(|(stream, number)| (stream.to_string(), number))
    .collect();
    assert_eq!(history, expected);

    append(&connection, "orders", 1).await;
    assert_eq!(next_event(&mut rx).await, ("orders".to_string(), 3));

    let notice = subscription.unsubscribe().await;
    assert_eq!(notice.reason, SubscriptionDropReason::UserInitiated);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_catch_up_on_all_with_filter() {
    let cluster = FakeCluster::single();
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    append(&connection, "orders-1", 2).await;
    append(&connection, "users-1", 2).await;

    let (recorder, mut rx) = Recorder::new();
    let subscription = connection
        .filtered_subscribe_to_all_from(
            None,
            Filter::stream_id_prefix(["orders-"]),
            CatchUpSettings::default(),
            recorder,
        )
        .unwrap();
    assert!(subscription.is_subscribed_to_all());
    assert_eq!(until_live(&mut rx).await, vec![0, 1]);

    append(&connection, "users-1", 1).await;
    append(&connection, "orders-2", 1).await;
    assert_eq!(next_event(&mut rx).await, ("orders-2".to_string(), 0));
}

#[tokio::test]
async fn test_catch_up_handler_error_drops_subscription() {
    let cluster = FakeCluster::single();
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    append(&connection, "orders", 3).await;

    let (mut recorder, _rx) = Recorder::new();
    recorder.fail_on = Some(1);
    let subscription = connection
        .subscribe_to_stream_from("orders", None, CatchUpSettings::default(), recorder)
        .unwrap();

    let notice = subscription.dropped().await;
    assert_eq!(notice.reason, SubscriptionDropReason::EventHandlerException);
}

#[tokio::test]
async fn test_catch_up_rejects_invalid_settings() {
    let cluster = FakeCluster::single();
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    let (recorder, _rx) = Recorder::new();

    let result = connection.subscribe_to_stream_from(
        "orders",
        None,
        CatchUpSettings::default().with_read_batch_size(0),
        recorder,
    );
    assert!(matches!(result, Err(ClientError::InvalidArgument(_))));
}

// ============================================================================
// Persistent
// ============================================================================

/// Hands every delivery to the test, which decides when to ack.
struct Collector {
    tx: mpsc::UnboundedSender<(ResolvedEvent, Option<u32>)>,
    fail: bool,
}

#[async_trait]
impl PersistentEventHandler for Collector {
    async fn event_appeared(
        &mut self,
        _subscription: &PersistentSubscription,
        event: ResolvedEvent,
        retry_count: Option<u32>,
    ) -> anyhow::Result<()> {
        let _ = self.tx.send((event, retry_count));
        if self.fail {
            anyhow::bail!("poison message");
        }
        Ok(())
    }
}

fn collector() -> (Collector, mpsc::UnboundedReceiver<(ResolvedEvent, Option<u32>)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Collector { tx, fail: false }, rx)
}

async fn create_group(connection: &Connection, stream: &str, group: &str) {
    connection
        .create_persistent_subscription(
            stream,
            group,
            PersistentSubscriptionSettings::default().with_start_from(StartFrom::Beginning),
        )
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_persistent_manual_ack_limits_outstanding_events() {
    let cluster = FakeCluster::single();
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    append(&connection, "jobs", 5).await;
    create_group(&connection, "jobs", "workers").await;

    let (handler, mut rx) = collector();
    let subscription = connection
        .connect_to_persistent_subscription("jobs", "workers", handler, 2, false)
        .await
        .unwrap();
    assert_eq!(subscription.group(), "workers");

    let (first, _) = rx.recv().await.unwrap();
    let (second, _) = rx.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(cluster.persistent_in_flight("jobs", "workers"), 2);

    subscription.ack(&first);
    let (third, retry_count) = rx.recv().await.unwrap();
    assert_eq!(third.original_event_number(), EventNumber::new(2));
    assert_eq!(retry_count, Some(0));

    subscription.ack_many([
        second.original_event().event_id,
        third.original_event().event_id,
    ]);
    let mut rest = Vec::new();
    for _ in 0..2 {
        let (event, _) = rx.recv().await.unwrap();
        rest.push(event.original_event_number().as_u64());
        subscription.ack(&event);
    }
    assert_eq!(rest, vec![3, 4]);
    wait_until(PATIENCE, || cluster.persistent_in_flight("jobs", "workers") == 0).await;
}

#[tokio::test]
async fn test_persistent_manual_ack_overflow_drops_subscription() {
    let cluster = FakeCluster::single();
    cluster.ignore_in_flight_limit(true);
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    append(&connection, "jobs", 10).await;
    create_group(&connection, "jobs", "greedy").await;

    let (handler, mut rx) = collector();
    let subscription = connection
        .connect_to_persistent_subscription("jobs", "greedy", handler, 2, false)
        .await
        .unwrap();

    let notice = tokio::time::timeout(PATIENCE, subscription.dropped())
        .await
        .unwrap();
    assert_eq!(notice.reason, SubscriptionDropReason::ProcessingQueueOverflow);

    let mut delivered = Vec::new();
    while let Ok((event, _)) = rx.try_recv() {
        delivered.push(event.original_event_number().as_u64());
    }
    assert_eq!(delivered, vec![0, 1]);
}

#[tokio::test]
async fn test_persistent_auto_ack() {
    let cluster = FakeCluster::single();
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    create_group(&connection, "jobs", "auto").await;

    let (handler, mut rx) = collector();
    let _subscription = connection
        .connect_to_persistent_subscription("jobs", "auto", handler, 10, true)
        .await
        .unwrap();
    append(&connection, "jobs", 3).await;

    for expected in 0..3 {
        let (event, _) = rx.recv().await.unwrap();
        assert_eq!(event.original_event_number().as_u64(), expected);
    }
    wait_until(PATIENCE, || cluster.persistent_in_flight("jobs", "auto") == 0).await;
}

#[tokio::test]
async fn test_persistent_nack_parks_and_retries() {
    let cluster = FakeCluster::single();
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    append(&connection, "jobs", 2).await;
    create_group(&connection, "jobs", "picky").await;

    let (handler, mut rx) = collector();
    let subscription = connection
        .connect_to_persistent_subscription("jobs", "picky", handler, 10, false)
        .await
        .unwrap();

    let (first, _) = rx.recv().await.unwrap();
    let (second, _) = rx.recv().await.unwrap();
    subscription.nack(&first, NackAction::Park, "malformed");
    subscription.nack(&second, NackAction::Retry, "try later");

    let (again, retry_count) = rx.recv().await.unwrap();
    assert_eq!(again.original_event_number(), EventNumber::new(1));
    assert_eq!(retry_count, Some(1));
    subscription.ack(&again);

    wait_until(PATIENCE, || cluster.parked("jobs", "picky") == vec![0]).await;
}

#[tokio::test]
async fn test_persistent_handler_error_nacks_and_drops() {
    let cluster = FakeCluster::single();
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();
    append(&connection, "jobs", 1).await;
    create_group(&connection, "jobs", "fragile").await;

    let (mut handler, mut rx) = collector();
    handler.fail = true;
    let subscription = connection
        .connect_to_persistent_subscription("jobs", "fragile", handler, 10, true)
        .await
        .unwrap();

    rx.recv().await.unwrap();
    let notice = subscription.dropped().await;
    assert_eq!(notice.reason, SubscriptionDropReason::EventHandlerException);
    wait_until(PATIENCE, || cluster.group_member_count("jobs", "fragile") == 0).await;
    assert_eq!(cluster.persistent_in_flight("jobs", "fragile"), 0);
}

#[tokio::test]
async fn test_persistent_group_lifecycle() {
    let cluster = FakeCluster::single();
    let connection = cluster.connection(&cluster.single_node_options()).unwrap();

    let (handler, _rx) = collector();
    let err = connection
        .connect_to_persistent_subscription("jobs", "missing", handler, 10, true)
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            ClientError::SubscriptionRejected(SubscriptionDropReason::NotFound)
        ),
        "{err}"
    );

    create_group(&connection, "jobs", "workers").await;
    let duplicate = connection
        .create_persistent_subscription(
            "jobs",
            "workers",
            PersistentSubscriptionSettings::default(),
        )
        .await;
    assert!(matches!(duplicate, Err(ClientError::InvalidOperation(_))));

    connection
        .update_persistent_subscription(
            "jobs",
            "workers",
            PersistentSubscriptionSettings::default().with_max_retry_count(3),
        )
        .await
        .unwrap();

    let (handler, _rx) = collector();
    let subscription = connection
        .connect_to_persistent_subscription("jobs", "workers", handler, 10, true)
        .await
        .unwrap();
    assert_eq!(subscription.subscription_id(), "jobs::workers");

    connection
        .delete_persistent_subscription("jobs", "workers")
        .await
        .unwrap();
    let notice = subscription.dropped().await;
    assert_eq!(
        notice.reason,
        SubscriptionDropReason::PersistentSubscriptionDeleted
    );

    let missing = connection
        .delete_persistent_subscription("jobs", "workers")
        .await;
    assert!(matches!(missing, Err(ClientError::InvalidOperation(_))));
}

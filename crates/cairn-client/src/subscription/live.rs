//! Live subscriptions: events pushed from the moment the server confirms.

use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{
    Control, EventHandler, Subscription, SubscriptionConfirmation, SubscriptionDropReason,
    SubscriptionInbox, SubscriptionMessage, SubscriptionState, report_drop,
};
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::operation::{Command, Reply};
use crate::transport::CorrelationId;

/// Opens a live subscription and spawns the task feeding `handler`.
///
/// Resolves once the server confirmed; a rejection is returned as the error
/// and the handler is never called.
pub(crate) async fn subscribe<H: EventHandler>(
    connection: &Connection,
    command: Command,
    handler: H,
) -> ClientResult<Subscription> {
    let stream = command.stream().map(str::to_string);
    let opened = connection.open_subscription(command).await?;
    let confirmation = match opened.reply {
        Reply::SubscriptionConfirmed {
            last_commit_position,
            last_event_number,
        } => SubscriptionConfirmation {
            last_commit_position,
            last_event_number,
        },
        other => {
            connection.unsubscribe(opened.correlation_id);
            return Err(ClientError::Protocol(format!(
                "unexpected subscription confirmation: {other:?}"
            )));
        }
    };
    debug!(
        correlation_id = %opened.correlation_id,
        stream = stream.as_deref().unwrap_or(cairn_types::ALL_STREAM),
        last_commit_position = confirmation.last_commit_position,
        "live subscription confirmed"
    );

    let (state_tx, state_rx) = watch::channel(SubscriptionState::Live);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let task = LiveTask {
        connection: connection.clone(),
        correlation_id: opened.correlation_id,
        handler,
        inbox: opened.inbox,
        control: control_rx,
        state: state_tx,
    };
    tokio::spawn(task.run());

    Ok(Subscription::new(
        stream,
        Some(confirmation),
        state_rx,
        control_tx,
    ))
}

struct LiveTask<H> {
    connection: Connection,
    correlation_id: CorrelationId,
    handler: H,
    inbox: SubscriptionInbox,
    control: mpsc::UnboundedReceiver<Control>,
    state: watch::Sender<SubscriptionState>,
}

impl<H: EventHandler> LiveTask<H> {
    async fn run(mut self) {
        let mut control_open = true;
        let (reason, error) = loop {
            tokio::select! {
                biased;

                command = self.control.recv(), if control_open => match command {
                    Some(Control::Stop) => {
                        self.connection.unsubscribe(self.correlation_id);
                        break (SubscriptionDropReason::UserInitiated, None);
                    }
                    Some(_) => {}
                    None => control_open = false,
                },
                message = self.inbox.recv() => {
                    let outcome = match message {
                        Some(SubscriptionMessage::Event(event))
                        | Some(SubscriptionMessage::PersistentEvent { event, .. }) => {
                            self.handler.event_appeared(event).await
                        }
                        Some(SubscriptionMessage::Checkpoint(position)) => {
                            self.handler.checkpoint_reached(position).await
                        }
                        Some(SubscriptionMessage::ServerDropped(reason)) => break (reason, None),
                        Some(SubscriptionMessage::ConnectionLost)
                        | Some(SubscriptionMessage::ConnectionClosed(_))
                        | None => break (SubscriptionDropReason::ConnectionClosed, None),
                    };
                    if let Err(err) = outcome {
                        self.connection.unsubscribe(self.correlation_id);
                        break (SubscriptionDropReason::EventHandlerException, Some(err));
                    }
                }
            }
        };
        report_drop(&mut self.handler, &self.state, reason, error).await;
    }
}

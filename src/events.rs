//! Tagged events delivered over explicit channels
//!
//! Drawing pipelines talk to their subscribers with [`DrawingEvent`]; every
//! component reports to the application with [`StreamEvent`].

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::constants::EVENT_QUEUE_CAPACITY;

/// Lifecycle of a surface drawing pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum DrawingEvent {
    /// The graphics context is ready and targets are being drawn
    Started,
    /// The draw thread exited and released its resources
    Stopped,
    /// Context loss, surface failure or render timeout
    Error(String),
}

/// Notifications for the application layer
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    ClientAttached { peer: SocketAddr, clients: usize },
    ClientRejected { peer: SocketAddr },
    ClientDetached { peer: SocketAddr, clients: usize },
    SessionCreated(Uuid),
    SessionReleased(Uuid),
    /// A session could not be created or started
    SessionFailed(String),
    /// A pipeline stopped itself after a resource error
    EncoderError { source: &'static str, message: String },
}

pub type EventSender = Sender<StreamEvent>;
pub type EventReceiver = Receiver<StreamEvent>;

/// Create an application event channel
///
/// Holds at most [`EVENT_QUEUE_CAPACITY`] undelivered events; newer events
/// are dropped while the receiver lags.
pub fn channel() -> (EventSender, EventReceiver) {
    bounded(EVENT_QUEUE_CAPACITY)
}

/// Send without blocking and without caring whether anybody is listening
pub(crate) fn emit(sender: Option<&EventSender>, event: StreamEvent) {
    if let Some(sender) = sender {
        match sender.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => {
                tracing::debug!("Event queue full, dropped {:?}", event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_drops_when_receiver_lags() {
        let (tx, rx) = channel();
        for _ in 0..EVENT_QUEUE_CAPACITY + 10 {
            emit(Some(&tx), StreamEvent::SessionFailed("full".to_string()));
        }
        assert_eq!(rx.len(), EVENT_QUEUE_CAPACITY);

        rx.recv().unwrap();
        emit(Some(&tx), StreamEvent::SessionReleased(Uuid::nil()));
        assert_eq!(rx.len(), EVENT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_emit_without_receiver() {
        let (tx, rx) = channel();
        drop(rx);
        emit(Some(&tx), StreamEvent::SessionFailed("gone".to_string()));
        emit(None, StreamEvent::SessionFailed("nobody".to_string()));
    }
}

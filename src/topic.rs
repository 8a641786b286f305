//! Kind-checked broadcast topics.
//!
//! A `Topic` binds one `MessageKind` to a bounded publication log and any
//! number of subscription channels. Every subscriber receives its own
//! `Arc<Message>`; no subscriber can steal a message from another.
//!
//! Subscriptions MUST be created before the workers that consume them are
//! spawned. A worker is handed its `Subscription`s at `create()` time; a
//! subscription made afterwards is never seen by an already-running worker.
//! This is a wiring precondition and is not checked at runtime.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::PipelineError;
use crate::message::{Message, MessageKind, TopicMessage};

/// Default capacity of each topic's publication log.
pub const DEFAULT_LOG_CAPACITY: usize = 64;

pub struct Topic {
    kind: MessageKind,
    state: RwLock<TopicState>,
}

struct TopicState {
    closed: bool,
    log_tx: Option<Sender<Arc<Message>>>,
    log_rx: Option<Receiver<Arc<Message>>>,
    subscribers: Vec<Sender<Arc<Message>>>,
}

impl Topic {
    pub fn new(kind: MessageKind, log_capacity: usize) -> Self {
        let (log_tx, log_rx) = crossbeam_channel::bounded(log_capacity.max(1));
        Self {
            kind,
            state: RwLock::new(TopicState {
                closed: false,
                log_tx: Some(log_tx),
                log_rx: Some(log_rx),
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.topic_name()
    }

    /// Publish to the log and every registered subscription.
    ///
    /// A message of the wrong kind is rejected before it reaches any channel.
    pub fn publish(&self, message: Message) -> Result<(), PipelineError> {
        if message.kind() != self.kind {
            return Err(PipelineError::TypeMismatch {
                topic: self.name(),
                expected: self.kind,
                actual: message.kind(),
            });
        }
        let state = self.state.read();
        if state.closed {
            return Err(PipelineError::TopicClosed(self.name()));
        }
        let message = Arc::new(message);

        if let (Some(log_tx), Some(log_rx)) = (&state.log_tx, &state.log_rx) {
            if let Err(TrySendError::Full(entry)) = log_tx.try_send(message.clone()) {
                // Log is full: discard the oldest record.
                let _ = log_rx.try_recv();
                let _ = log_tx.try_send(entry);
            }
        }

        for subscriber in &state.subscribers {
            // A dropped receiver only means that subscriber is gone.
            let _ = subscriber.send(message.clone());
        }
        Ok(())
    }

    pub fn subscribe(&self) -> Result<Subscription, PipelineError> {
        let mut state = self.state.write();
        if state.closed {
            return Err(PipelineError::TopicClosed(self.name()));
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        state.subscribers.push(tx);
        log::trace!(
            "subscribed to topic {} ({} subscriptions)",
            self.name(),
            state.subscribers.len()
        );
        Ok(Subscription {
            topic: self.name(),
            kind: self.kind,
            rx,
        })
    }

    /// Receiver over the publication log, if the topic is still open.
    pub fn publication_log(&self) -> Option<Receiver<Arc<Message>>> {
        self.state.read().log_rx.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.read().subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Release the log and every subscription sender. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.write();
        if state.closed {
            return;
        }
        state.closed = true;
        state.subscribers.clear();
        state.log_tx = None;
        state.log_rx = None;
    }
}

/// Receive side of one topic subscription.
pub struct Subscription {
    topic: &'static str,
    kind: MessageKind,
    rx: Receiver<Arc<Message>>,
}

impl Subscription {
    pub fn topic(&self) -> &'static str {
        self.topic
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Non-blocking receive. `None` when empty or when the topic was closed.
    pub fn try_recv(&self) -> Option<Arc<Message>> {
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Arc<Message>> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn drain(&self) -> Vec<Arc<Message>> {
        self.rx.try_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Non-blocking receive of a concrete message type.
    ///
    /// A variant other than `M` is a wiring contract violation.
    pub fn try_recv_as<M: TopicMessage>(&self) -> Result<Option<M>, PipelineError> {
        match self.try_recv() {
            Some(message) => self.expect::<M>(&message).map(Some),
            None => Ok(None),
        }
    }

    pub fn recv_timeout_as<M: TopicMessage>(
        &self,
        timeout: Duration,
    ) -> Result<Option<M>, PipelineError> {
        match self.recv_timeout(timeout) {
            Some(message) => self.expect::<M>(&message).map(Some),
            None => Ok(None),
        }
    }

    pub fn drain_as<M: TopicMessage>(&self) -> Result<Vec<M>, PipelineError> {
        self.drain()
            .iter()
            .map(|message| self.expect::<M>(message))
            .collect()
    }

    /// Drain everything pending and keep only the newest message.
    pub fn latest_as<M: TopicMessage>(&self) -> Result<Option<M>, PipelineError> {
        Ok(self.drain_as::<M>()?.pop())
    }

    fn expect<M: TopicMessage>(&self, message: &Message) -> Result<M, PipelineError> {
        M::from_message(message)
            .cloned()
            .ok_or(PipelineError::UnexpectedMessage {
                topic: self.topic,
                actual: message.kind(),
            })
    }
}

/// One topic per message kind for a single pipeline instance.
pub struct TopicRegistry {
    topics: BTreeMap<MessageKind, Topic>,
}

impl TopicRegistry {
    pub fn create(log_capacity: usize) -> Self {
        let topics = MessageKind::ALL
            .iter()
            .map(|kind| {
                log::debug!("instantiated topic {}", kind.topic_name());
                (*kind, Topic::new(*kind, log_capacity))
            })
            .collect();
        Self { topics }
    }

    pub fn topic(&self, kind: MessageKind) -> &Topic {
        // Every kind is instantiated in `create`.
        &self.topics[&kind]
    }

    pub fn publish(&self, kind: MessageKind, message: Message) -> Result<(), PipelineError> {
        self.topic(kind).publish(message)
    }

    pub fn publish_typed<M: TopicMessage>(&self, message: M) -> Result<(), PipelineError> {
        self.publish(M::KIND, message.into())
    }

    pub fn subscribe(&self, kind: MessageKind) -> Result<Subscription, PipelineError> {
        self.topic(kind).subscribe()
    }

    pub fn close(&self) {
        log::debug!("closing topic registry");
        for topic in self.topics.values() {
            topic.close();
        }
    }
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::create(DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CameraObservationMessage, Observation, ProcessFrameNumberMessage};

    fn frame_request(frame_number: u64) -> Message {
        ProcessFrameNumberMessage { frame_number }.into()
    }

    #[test]
    fn wrong_kind_is_rejected_and_never_delivered() {
        let topic = Topic::new(MessageKind::ProcessFrameNumber, 8);
        let sub = topic.subscribe().unwrap();
        let log = topic.publication_log().unwrap();

        let wrong: Message = CameraObservationMessage {
            camera_id: "0".into(),
            frame_number: 1,
            tracker_name: "t".into(),
            observation: Observation::new(),
        }
        .into();
        let err = topic.publish(wrong).unwrap_err();
        assert!(matches!(err, PipelineError::TypeMismatch { .. }));
        assert!(err.is_contract_violation());
        assert!(sub.try_recv().is_none());
        assert!(log.try_recv().is_err());
    }

    #[test]
    fn publish_fans_out_to_every_subscriber_and_the_log() {
        let topic = Topic::new(MessageKind::ProcessFrameNumber, 8);
        let subs: Vec<_> = (0..3).map(|_| topic.subscribe().unwrap()).collect();

        topic.publish(frame_request(99)).unwrap();

        for sub in &subs {
            let received = sub.drain();
            assert_eq!(received.len(), 1);
            assert_eq!(*received[0], frame_request(99));
        }
        let log: Vec<_> = topic.publication_log().unwrap().try_iter().collect();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn full_log_drops_oldest_entry() {
        let topic = Topic::new(MessageKind::ProcessFrameNumber, 2);
        for n in 0..5 {
            topic.publish(frame_request(n)).unwrap();
        }
        let log: Vec<_> = topic.publication_log().unwrap().try_iter().collect();
        assert_eq!(log.len(), 2);
        assert_eq!(*log[1], frame_request(4));
    }

    #[test]
    fn close_is_idempotent_and_rejects_later_publishes() {
        let topic = Topic::new(MessageKind::ProcessFrameNumber, 4);
        let sub = topic.subscribe().unwrap();
        assert_eq!(topic.subscriber_count(), 1);

        topic.close();
        topic.close();

        assert!(topic.is_closed());
        assert_eq!(topic.subscriber_count(), 0);
        assert!(matches!(
            topic.publish(frame_request(1)),
            Err(PipelineError::TopicClosed(_))
        ));
        assert!(topic.subscribe().is_err());
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn typed_receive_rejects_foreign_variant() {
        let registry = TopicRegistry::create(4);
        let sub = registry.subscribe(MessageKind::ProcessFrameNumber).unwrap();
        registry
            .publish_typed(ProcessFrameNumberMessage { frame_number: 7 })
            .unwrap();

        let err = sub.try_recv_as::<CameraObservationMessage>().unwrap_err();
        assert!(matches!(err, PipelineError::UnexpectedMessage { .. }));
    }

    #[test]
    fn latest_as_keeps_only_newest() {
        let registry = TopicRegistry::create(4);
        let sub = registry.subscribe(MessageKind::ProcessFrameNumber).unwrap();
        for n in [3, 4, 5] {
            registry
                .publish_typed(ProcessFrameNumberMessage { frame_number: n })
                .unwrap();
        }
        let latest = sub.latest_as::<ProcessFrameNumberMessage>().unwrap();
        assert_eq!(latest.map(|m| m.frame_number), Some(5));
        assert!(sub.is_empty());
    }

    #[test]
    fn registry_rejects_message_on_wrong_topic() {
        let registry = TopicRegistry::create(4);
        let sub = registry.subscribe(MessageKind::AggregatedFrame).unwrap();
        let err = registry
            .publish(MessageKind::AggregatedFrame, frame_request(1))
            .unwrap_err();
        assert!(matches!(err, PipelineError::TypeMismatch { .. }));
        assert!(sub.try_recv().is_none());
    }
}

use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use bytes::Bytes;

use moqt_wire::{
    data_stream_type::DataStreamType,
    messages::{
        control_messages::{
            group_order::GroupOrder,
            subscribe::{FilterType, Subscribe},
        },
        data_streams::{datagram, object_status::ObjectStatus, DataStreams},
    },
    models::sequence::FullSequence,
    variable_integer::write_variable_integer,
};

use crate::{
    priority::{send_order_for_stream, update_send_order_for_subscriber_priority},
    publisher::{publisher_has_data, ForwardingPreference, MOQTTrackPublisher},
    send_stream_map::{ReducedSequenceIndex, SendStreamMap},
    subscribe_window::SubscribeWindow,
    transport::StreamId,
};

/// Publisher-side state for one accepted SUBSCRIBE. Owns the stream map
/// and the per-subscription queue of data streams waiting for stream
/// credit. Object arrival is routed here by the session facade.
pub struct PublishedSubscription {
    subscription_id: u64,
    track_alias: u64,
    track_publisher: Rc<dyn MOQTTrackPublisher>,
    window: SubscribeWindow,
    subscriber_priority: u8,
    subscriber_delivery_order: Option<GroupOrder>,
    // Initialized on first use; the forwarding preference is not reliable
    // until the publisher has data.
    lazily_initialized_stream_map: Option<SendStreamMap>,
    // Keyed by send order with the subscriber-priority bits zeroed, so a
    // priority change does not have to re-sort this map.
    queued_outgoing_data_streams: BTreeMap<u64, FullSequence>,
    largest_sent: Option<FullSequence>,
}

/// Re-keying instruction for the session-global queue after a mutation of
/// the local queue: remove `old`, insert `new`.
pub type QueuedSendOrderUpdate = (Option<u64>, Option<u64>);

pub fn window_from_subscribe(
    subscribe: &Subscribe,
    publisher: &dyn MOQTTrackPublisher,
) -> SubscribeWindow {
    let largest = if publisher_has_data(publisher) {
        publisher.largest_sequence()
    } else {
        FullSequence::default()
    };
    match subscribe.filter_type() {
        FilterType::LatestGroup => SubscribeWindow::new(FullSequence::new(largest.group_id, 0, 0)),
        FilterType::LatestObject => {
            SubscribeWindow::new(FullSequence::new(largest.group_id, 0, largest.object_id))
        }
        FilterType::AbsoluteStart => SubscribeWindow::new(FullSequence::new(
            subscribe.start_group().unwrap(),
            0,
            subscribe.start_object().unwrap(),
        )),
        FilterType::AbsoluteRange => SubscribeWindow::new_with_end(
            FullSequence::new(
                subscribe.start_group().unwrap(),
                0,
                subscribe.start_object().unwrap(),
            ),
            FullSequence::new(
                subscribe.end_group().unwrap(),
                0,
                subscribe.end_object().unwrap_or(u64::MAX),
            ),
        ),
    }
}

impl PublishedSubscription {
    pub fn new(subscribe: &Subscribe, track_publisher: Rc<dyn MOQTTrackPublisher>) -> Self {
        let window = window_from_subscribe(subscribe, track_publisher.as_ref());
        tracing::debug!("Created subscription for {}", subscribe.full_track_name());
        PublishedSubscription {
            subscription_id: subscribe.subscribe_id(),
            track_alias: subscribe.track_alias(),
            track_publisher,
            window,
            subscriber_priority: subscribe.subscriber_priority(),
            subscriber_delivery_order: subscribe.group_order(),
            lazily_initialized_stream_map: None,
            queued_outgoing_data_streams: BTreeMap::new(),
            largest_sent: None,
        }
    }

    pub fn subscription_id(&self) -> u64 {
        self.subscription_id
    }

    pub fn track_alias(&self) -> u64 {
        self.track_alias
    }

    pub fn publisher(&self) -> &Rc<dyn MOQTTrackPublisher> {
        &self.track_publisher
    }

    pub fn in_window(&self, sequence: FullSequence) -> bool {
        self.window.contains(sequence)
    }

    pub fn subscriber_priority(&self) -> u8 {
        self.subscriber_priority
    }

    pub fn largest_sent(&self) -> Option<FullSequence> {
        self.largest_sent
    }

    pub fn forwarding_preference(&self) -> ForwardingPreference {
        self.track_publisher.forwarding_preference()
    }

    pub fn delivery_order(&self) -> GroupOrder {
        self.subscriber_delivery_order
            .unwrap_or_else(|| self.track_publisher.delivery_order())
    }

    fn stream_map(&mut self) -> &mut SendStreamMap {
        if self.lazily_initialized_stream_map.is_none() {
            debug_assert!(publisher_has_data(self.track_publisher.as_ref()));
            self.lazily_initialized_stream_map = Some(SendStreamMap::new(
                self.track_publisher.forwarding_preference(),
            ));
        }
        self.lazily_initialized_stream_map.as_mut().unwrap()
    }

    pub fn stream_for_sequence(&mut self, sequence: FullSequence) -> Option<StreamId> {
        self.stream_map().stream_for_sequence(sequence)
    }

    pub fn on_data_stream_created(&mut self, stream_id: StreamId, first_object: FullSequence) {
        if let Err(err) = self.stream_map().add_stream(first_object, stream_id) {
            tracing::warn!("data stream bookkeeping broken: {}", err);
        }
    }

    pub fn on_data_stream_destroyed(&mut self, stream_id: StreamId, end_sequence: FullSequence) {
        self.stream_map().remove_stream(end_sequence, stream_id);
    }

    pub fn on_object_sent(&mut self, sequence: FullSequence) {
        self.largest_sent = Some(match self.largest_sent {
            Some(largest) => largest.max(sequence),
            None => sequence,
        });
    }

    /// Window update from SUBSCRIBE_UPDATE. Streams already outside the new
    /// window are left to run out on their own.
    pub fn update(
        &mut self,
        start: FullSequence,
        end: Option<FullSequence>,
        subscriber_priority: u8,
    ) -> Option<QueuedSendOrderUpdate> {
        self.window.update_start_end(start, end);
        self.set_subscriber_priority(subscriber_priority)
    }

    /// Returns the re-keying for the session queue when the head entry's
    /// finalized send order changed.
    pub fn set_subscriber_priority(&mut self, priority: u8) -> Option<QueuedSendOrderUpdate> {
        if priority == self.subscriber_priority {
            return None;
        }
        if self.queued_outgoing_data_streams.is_empty() {
            self.subscriber_priority = priority;
            return None;
        }
        let head = *self.queued_outgoing_data_streams.last_key_value().unwrap().0;
        let old_send_order = self.finalize_send_order(head);
        self.subscriber_priority = priority;
        Some((Some(old_send_order), Some(self.finalize_send_order(head))))
    }

    pub fn get_send_order(&self, sequence: FullSequence) -> u64 {
        debug_assert!(
            self.forwarding_preference() != ForwardingPreference::Datagram,
            "datagram track requesting send order"
        );
        send_order_for_stream(
            self.subscriber_priority,
            self.track_publisher.publisher_priority(),
            sequence.group_id,
            sequence.subgroup_id,
            self.delivery_order(),
        )
    }

    fn finalize_send_order(&self, send_order: u64) -> u64 {
        update_send_order_for_subscriber_priority(send_order, self.subscriber_priority)
    }

    /// Queues a data stream for `first_object` until the transport grants
    /// stream credit.
    pub fn add_queued_outgoing_data_stream(
        &mut self,
        first_object: FullSequence,
    ) -> Option<QueuedSendOrderUpdate> {
        let old_head = self
            .queued_outgoing_data_streams
            .last_key_value()
            .map(|(&send_order, _)| send_order);
        let send_order = self.get_send_order(first_object);
        let stripped = update_send_order_for_subscriber_priority(send_order, 0);
        self.queued_outgoing_data_streams
            .insert(stripped, first_object);
        match old_head {
            None => Some((None, Some(send_order))),
            Some(old_head) if stripped > old_head => {
                Some((Some(self.finalize_send_order(old_head)), Some(send_order)))
            }
            Some(_) => None,
        }
    }

    /// Pops the highest-priority queued stream request.
    pub fn next_queued_outgoing_data_stream(
        &mut self,
    ) -> Option<(FullSequence, QueuedSendOrderUpdate)> {
        let (&head, &first_object) = self.queued_outgoing_data_streams.last_key_value()?;
        self.queued_outgoing_data_streams.remove(&head);
        let old_send_order = self.finalize_send_order(head);
        let new_send_order = self
            .queued_outgoing_data_streams
            .last_key_value()
            .map(|(&send_order, _)| self.finalize_send_order(send_order));
        Some((first_object, (Some(old_send_order), new_send_order)))
    }

    pub fn has_queued_streams(&self) -> bool {
        !self.queued_outgoing_data_streams.is_empty()
    }

    /// Finalized send order of the queue head, used to purge the session
    /// queue when the subscription is destroyed.
    pub fn queue_head_send_order(&self) -> Option<u64> {
        self.queued_outgoing_data_streams
            .last_key_value()
            .map(|(&send_order, _)| self.finalize_send_order(send_order))
    }

    pub fn all_streams(&self) -> Vec<StreamId> {
        match &self.lazily_initialized_stream_map {
            Some(stream_map) => stream_map.all_streams(),
            None => Vec::new(),
        }
    }

    pub fn streams_for_group(&self, group_id: u64) -> Vec<StreamId> {
        match &self.lazily_initialized_stream_map {
            Some(stream_map) => stream_map.streams_for_group(group_id),
            None => Vec::new(),
        }
    }

    /// Sequences to replay after SUBSCRIBE_OK: the earliest cached object
    /// of every stream mapping unit in the window. The streams themselves
    /// pull the rest.
    pub fn backfill_candidates(&self) -> Vec<FullSequence> {
        let start = self.window.start();
        let end = self.track_publisher.largest_sequence();
        let preference = self.track_publisher.forwarding_preference();

        let mut already_opened: HashSet<ReducedSequenceIndex> = HashSet::new();
        let mut candidates = Vec::new();
        for sequence in self.track_publisher.cached_objects_in_range(start, end) {
            if already_opened.insert(ReducedSequenceIndex::new(sequence, preference)) {
                candidates.push(sequence);
            }
        }
        candidates
    }

    /// Serializes `sequence` as a datagram, recording it as sent.
    pub fn make_datagram(&mut self, sequence: FullSequence) -> Option<Bytes> {
        let object = match self.track_publisher.get_cached_object(sequence) {
            Some(object) => object,
            None => {
                tracing::warn!("object {} notified but not in the cache", sequence);
                return None;
            }
        };

        let status = if object.payload.is_empty() && object.status != ObjectStatus::Normal {
            Some(object.status)
        } else {
            None
        };
        let message = match datagram::Object::new(
            self.track_alias,
            object.sequence.group_id,
            object.sequence.object_id,
            self.track_publisher.publisher_priority(),
            status,
            object.payload.to_vec(),
        ) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!("datagram serialization failed: {}", err);
                return None;
            }
        };
        let mut buf = write_variable_integer(u8::from(DataStreamType::ObjectDatagram) as u64);
        message.packetize(&mut buf);
        self.on_object_sent(object.sequence);
        Some(buf.freeze())
    }
}

impl Drop for PublishedSubscription {
    fn drop(&mut self) {
        tracing::debug!(
            "Destroyed subscription {} for {}",
            self.subscription_id,
            self.track_publisher.track_name()
        );
    }
}

use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;

use moqt_wire::{
    constants::{
        AnnounceErrorCode, SessionErrorCode, SubscribeDoneCode, RESET_CODE_SUBSCRIPTION_GONE,
        RESET_CODE_TIMED_OUT,
    },
    messages::control_messages::{
        announce::Announce,
        client_setup::ClientSetup,
        fetch::Fetch,
        max_subscribe_id::MaxSubscribeId,
        setup_parameters::{RoleCase, SetupParameter},
        subscribe::{filter_type_for, Subscribe},
        subscribe_done::SubscribeDone,
        unsubscribe::Unsubscribe,
    },
    models::{sequence::FullSequence, track::FullTrackName},
};

use crate::{
    callbacks::{MOQTSessionCallbacks, OutgoingAnnounceCallback},
    config::{MOQTSessionConfig, Perspective, Underlay},
    control_stream::{ControlStream, SetupState},
    data_streams::{IncomingDataStream, OutgoingDataStream, OutgoingStream},
    parsers::control_message::{serialize_control_message, ControlMessage},
    priority::{send_order_for_stream, CONTROL_STREAM_SEND_ORDER, DEFAULT_SUBSCRIBER_PRIORITY, SEND_GROUP_ID},
    published_fetch::PublishedFetch,
    published_subscription::PublishedSubscription,
    publisher::{DefaultPublisher, MOQTPublisher},
    queued_streams::SubscriptionQueue,
    remote_track::{FetchRemoteTrack, RemoteTrack, SharedRemoteTrackVisitor, SubscribeRemoteTrack},
    subscribe_window::SubscribeWindow,
    transport::{SessionTransport, StreamId, StreamWriteOptions},
};

// What to do with a newly available object, decided while the subscription
// is borrowed and executed afterwards.
enum ObjectAction {
    Datagram(Bytes),
    Signal(StreamId),
    OpenOrQueue,
}

/// One MoQT session over one transport session. All state is owned here;
/// the embedder drives it through the transport callbacks and never
/// re-enters it from within a callback.
pub struct MOQTSession {
    pub(crate) config: MOQTSessionConfig,
    pub(crate) transport: Box<dyn SessionTransport>,
    pub(crate) publisher: Rc<dyn MOQTPublisher>,
    pub(crate) callbacks: MOQTSessionCallbacks,

    pub(crate) control_stream: Option<ControlStream>,
    pub(crate) incoming_data_streams: HashMap<StreamId, IncomingDataStream>,
    pub(crate) outgoing_data_streams: HashMap<StreamId, OutgoingStream>,

    // Publisher side.
    pub(crate) published_subscriptions: HashMap<u64, PublishedSubscription>,
    pub(crate) incoming_fetches: HashMap<u64, PublishedFetch>,
    // Doubles as the object-arrival route and the duplicate-subscribe guard.
    pub(crate) subscribed_track_names: HashMap<FullTrackName, u64>,

    // Subscriber side. `subscribe_by_alias` owns the entries; the id and
    // name maps are indexes into it and are always updated together with
    // the owner.
    pub(crate) subscribe_by_alias: HashMap<u64, SubscribeRemoteTrack>,
    pub(crate) upstream_by_id: HashMap<u64, u64>,
    pub(crate) upstream_by_name: HashMap<FullTrackName, u64>,
    pub(crate) upstream_fetches: HashMap<u64, FetchRemoteTrack>,

    pub(crate) pending_outgoing_announces: HashMap<Vec<String>, OutgoingAnnounceCallback>,

    pub(crate) queued_streams: SubscriptionQueue,

    pub(crate) next_subscribe_id: u64,
    pub(crate) next_remote_track_alias: u64,
    pub(crate) next_incoming_subscribe_id: u64,
    pub(crate) local_max_subscribe_id: u64,
    pub(crate) peer_max_subscribe_id: u64,
    pub(crate) peer_role: Option<RoleCase>,
    pub(crate) peer_supports_object_ack: bool,
    pub(crate) error: Option<String>,
}

impl MOQTSession {
    pub fn new(
        transport: Box<dyn SessionTransport>,
        config: MOQTSessionConfig,
        callbacks: MOQTSessionCallbacks,
    ) -> Self {
        let local_max_subscribe_id = config.max_subscribe_id;
        MOQTSession {
            config,
            transport,
            publisher: Rc::new(DefaultPublisher),
            callbacks,
            control_stream: None,
            incoming_data_streams: HashMap::new(),
            outgoing_data_streams: HashMap::new(),
            published_subscriptions: HashMap::new(),
            incoming_fetches: HashMap::new(),
            subscribed_track_names: HashMap::new(),
            subscribe_by_alias: HashMap::new(),
            upstream_by_id: HashMap::new(),
            upstream_by_name: HashMap::new(),
            upstream_fetches: HashMap::new(),
            pending_outgoing_announces: HashMap::new(),
            queued_streams: SubscriptionQueue::new(),
            next_subscribe_id: 0,
            next_remote_track_alias: 0,
            next_incoming_subscribe_id: 0,
            local_max_subscribe_id,
            peer_max_subscribe_id: 0,
            peer_role: None,
            peer_supports_object_ack: false,
            error: None,
        }
    }

    pub fn set_publisher(&mut self, publisher: Rc<dyn MOQTPublisher>) {
        self.publisher = publisher;
    }

    pub fn peer_max_subscribe_id(&self) -> u64 {
        self.peer_max_subscribe_id
    }

    /// Object acks require support on both endpoints.
    pub fn supports_object_ack(&self) -> bool {
        self.config.support_object_acks && self.peer_supports_object_ack
    }

    pub fn is_closed(&self) -> bool {
        self.error.is_some()
    }

    /// Terminates the session. Idempotent; only the first call closes the
    /// transport and fires the termination callback.
    pub fn error(&mut self, code: SessionErrorCode, reason: &str) {
        if self.error.is_some() {
            return;
        }
        tracing::info!(
            "MOQT session closed with code {:?} and message: {}",
            code,
            reason
        );
        self.error = Some(reason.to_string());
        if let Some(control_stream) = &mut self.control_stream {
            control_stream.set_setup_state(SetupState::Terminated);
        }
        self.transport.close_session(code.into(), reason);
        if let Some(callback) = self.callbacks.session_terminated.take() {
            callback(reason);
        }
    }

    // ---------------------------------------------------------------
    // Public API
    // ---------------------------------------------------------------

    pub fn announce(&mut self, track_namespace: Vec<String>, callback: OutgoingAnnounceCallback) {
        if self.peer_role == Some(RoleCase::Publisher) {
            callback(
                &track_namespace,
                Some((
                    AnnounceErrorCode::InternalError,
                    "ANNOUNCE cannot be sent to Publisher".to_string(),
                )),
            );
            return;
        }
        if self.pending_outgoing_announces.contains_key(&track_namespace) {
            callback(
                &track_namespace,
                Some((
                    AnnounceErrorCode::InternalError,
                    "ANNOUNCE message already outstanding for namespace".to_string(),
                )),
            );
            return;
        }
        self.send_control_message(ControlMessage::Announce(Announce::new(
            track_namespace.clone(),
        )));
        tracing::debug!("Sent ANNOUNCE message for {:?}", track_namespace);
        self.pending_outgoing_announces
            .insert(track_namespace, callback);
    }

    pub fn subscribe_absolute(
        &mut self,
        name: &FullTrackName,
        start_group: u64,
        start_object: u64,
        visitor: Option<SharedRemoteTrackVisitor>,
    ) -> bool {
        self.subscribe_with_range(
            name,
            Some(start_group),
            Some(start_object),
            None,
            None,
            visitor,
        )
    }

    pub fn subscribe_absolute_with_end(
        &mut self,
        name: &FullTrackName,
        start_group: u64,
        start_object: u64,
        end_group: u64,
        visitor: Option<SharedRemoteTrackVisitor>,
    ) -> bool {
        if end_group < start_group {
            tracing::warn!("Subscription end is before beginning");
            return false;
        }
        self.subscribe_with_range(
            name,
            Some(start_group),
            Some(start_object),
            Some(end_group),
            None,
            visitor,
        )
    }

    pub fn subscribe_absolute_with_end_object(
        &mut self,
        name: &FullTrackName,
        start_group: u64,
        start_object: u64,
        end_group: u64,
        end_object: u64,
        visitor: Option<SharedRemoteTrackVisitor>,
    ) -> bool {
        if end_group < start_group {
            tracing::warn!("Subscription end is before beginning");
            return false;
        }
        if end_group == start_group && end_object < start_object {
            tracing::warn!("Subscription end is before beginning");
            return false;
        }
        self.subscribe_with_range(
            name,
            Some(start_group),
            Some(start_object),
            Some(end_group),
            Some(end_object),
            visitor,
        )
    }

    pub fn subscribe_current_object(
        &mut self,
        name: &FullTrackName,
        visitor: Option<SharedRemoteTrackVisitor>,
    ) -> bool {
        self.subscribe_with_range(name, None, None, None, None, visitor)
    }

    pub fn subscribe_current_group(
        &mut self,
        name: &FullTrackName,
        visitor: Option<SharedRemoteTrackVisitor>,
    ) -> bool {
        // First object of the current group.
        self.subscribe_with_range(name, None, Some(0), None, None, visitor)
    }

    pub fn unsubscribe(&mut self, name: &FullTrackName) {
        let Some(&track_alias) = self.upstream_by_name.get(name) else {
            return;
        };
        let Some(track) = self.subscribe_by_alias.remove(&track_alias) else {
            return;
        };
        self.send_control_message(ControlMessage::Unsubscribe(Unsubscribe::new(
            track.track().subscribe_id(),
        )));
        self.upstream_by_name.remove(name);
        self.upstream_by_id.remove(&track.track().subscribe_id());
    }

    /// Issues a FETCH for a bounded range of past objects.
    pub fn fetch(
        &mut self,
        name: &FullTrackName,
        start_group: u64,
        start_object: u64,
        end_group: u64,
        end_object: Option<u64>,
        visitor: Option<SharedRemoteTrackVisitor>,
    ) -> bool {
        if self.peer_role == Some(RoleCase::Subscriber) {
            tracing::debug!("Tried to send FETCH to subscriber peer");
            return false;
        }
        if self.next_subscribe_id >= self.peer_max_subscribe_id {
            tracing::debug!(
                "Tried to send FETCH with ID {} which is greater than the maximum ID {}",
                self.next_subscribe_id,
                self.peer_max_subscribe_id
            );
            return false;
        }
        if end_group < start_group {
            tracing::warn!("Fetch end is before beginning");
            return false;
        }
        let subscribe_id = self.next_subscribe_id;
        self.next_subscribe_id += 1;
        let message = Fetch::new(
            subscribe_id,
            name.track_namespace().clone(),
            name.track_name().to_string(),
            DEFAULT_SUBSCRIBER_PRIORITY,
            None,
            start_group,
            start_object,
            end_group,
            end_object,
        );
        self.send_control_message(ControlMessage::Fetch(message));
        tracing::debug!("Sent FETCH message for {}", name);
        let window = SubscribeWindow::new_with_end(
            FullSequence::new(start_group, 0, start_object),
            FullSequence::new(end_group, 0, end_object.unwrap_or(u64::MAX)),
        );
        let track = RemoteTrack::new_fetch(subscribe_id, name.clone(), window);
        self.upstream_fetches
            .insert(subscribe_id, FetchRemoteTrack::new(track, visitor));
        true
    }

    /// Raises the number of subscribes the peer may send.
    pub fn grant_more_subscribes(&mut self, num_subscribes: u64) {
        self.local_max_subscribe_id += num_subscribes;
        self.send_control_message(ControlMessage::MaxSubscribeId(MaxSubscribeId::new(
            self.local_max_subscribe_id,
        )));
    }

    // ---------------------------------------------------------------
    // Transport callbacks
    // ---------------------------------------------------------------

    pub fn on_session_ready(&mut self) {
        tracing::debug!("Underlying session ready");
        if self.config.perspective == Perspective::Server {
            return;
        }

        let Some(stream_id) = self.transport.open_outgoing_bidirectional_stream() else {
            self.error(
                SessionErrorCode::InternalError,
                "Unable to open a control stream",
            );
            return;
        };
        if let Some(stream) = self.transport.stream(stream_id) {
            stream.set_priority(SEND_GROUP_ID, CONTROL_STREAM_SEND_ORDER);
        }
        let mut control_stream = ControlStream::new(stream_id);
        control_stream.set_setup_state(SetupState::AwaitingPeerSetup);
        self.control_stream = Some(control_stream);

        let mut setup_parameters = vec![
            SetupParameter::Role(RoleCase::PubSub),
            SetupParameter::MaxSubscribeId(self.config.max_subscribe_id),
        ];
        if self.config.support_object_acks {
            setup_parameters.push(SetupParameter::SupportObjectAcks(true));
        }
        if self.config.underlay == Underlay::QUIC {
            setup_parameters.push(SetupParameter::Path(self.config.path.clone()));
        }
        let setup = ClientSetup::new(vec![self.config.version], setup_parameters);
        self.send_control_message(ControlMessage::ClientSetup(setup));
        tracing::debug!("Sent the SETUP message");
    }

    pub fn on_session_closed(&mut self, reason: &str) {
        if self.error.is_some() {
            // Avoid erroring out twice.
            return;
        }
        tracing::debug!("Underlying session closed with message: {}", reason);
        self.error = Some(reason.to_string());
        if let Some(callback) = self.callbacks.session_terminated.take() {
            callback(reason);
        }
    }

    pub fn on_incoming_bidirectional_stream_available(&mut self) {
        while let Some(stream_id) = self.transport.accept_incoming_bidirectional_stream() {
            if self.control_stream.is_some() {
                self.error(
                    SessionErrorCode::ProtocolViolation,
                    "Bidirectional stream already open",
                );
                return;
            }
            if let Some(stream) = self.transport.stream(stream_id) {
                stream.set_priority(SEND_GROUP_ID, CONTROL_STREAM_SEND_ORDER);
            }
            self.control_stream = Some(ControlStream::new(stream_id));
            self.process_control_stream();
            if self.error.is_some() {
                return;
            }
        }
    }

    pub fn on_incoming_unidirectional_stream_available(&mut self) {
        while let Some(stream_id) = self.transport.accept_incoming_unidirectional_stream() {
            self.incoming_data_streams
                .insert(stream_id, IncomingDataStream::new());
            self.process_incoming_data_stream(stream_id);
            if self.error.is_some() {
                return;
            }
        }
    }

    pub fn on_can_read(&mut self, stream_id: StreamId) {
        if self.error.is_some() {
            return;
        }
        if self
            .control_stream
            .as_ref()
            .is_some_and(|control_stream| control_stream.stream_id() == stream_id)
        {
            self.process_control_stream();
        } else if self.incoming_data_streams.contains_key(&stream_id) {
            self.process_incoming_data_stream(stream_id);
        }
    }

    pub fn on_can_write(&mut self, stream_id: StreamId) {
        if self.error.is_some() {
            return;
        }
        match self.outgoing_data_streams.get(&stream_id) {
            Some(OutgoingStream::Subscription(_)) => self.outgoing_stream_send_objects(stream_id),
            Some(OutgoingStream::Fetch(fetch_id)) => {
                let fetch_id = *fetch_id;
                self.fetch_stream_send_objects(stream_id, fetch_id);
            }
            None => {}
        }
    }

    pub fn on_stream_reset(&mut self, stream_id: StreamId, error_code: u64) {
        if self
            .control_stream
            .as_ref()
            .is_some_and(|control_stream| control_stream.stream_id() == stream_id)
        {
            self.error(
                SessionErrorCode::ProtocolViolation,
                &format!("Control stream reset with error code {}", error_code),
            );
            return;
        }
        self.incoming_data_streams.remove(&stream_id);
        if let Some(OutgoingStream::Subscription(state)) =
            self.outgoing_data_streams.remove(&stream_id)
        {
            if let Some(subscription) = self.published_subscriptions.get_mut(&state.subscription_id)
            {
                subscription.on_data_stream_destroyed(stream_id, state.next_object);
            }
        }
    }

    pub fn on_stop_sending(&mut self, stream_id: StreamId, error_code: u64) {
        if self
            .control_stream
            .as_ref()
            .is_some_and(|control_stream| control_stream.stream_id() == stream_id)
        {
            self.error(
                SessionErrorCode::ProtocolViolation,
                &format!("Control stream reset with error code {}", error_code),
            );
        }
    }

    /// Admission loop: opens queued data streams while the transport has
    /// stream credit, highest send order first.
    pub fn on_can_create_new_outgoing_unidirectional_stream(&mut self) {
        while !self.queued_streams.is_empty()
            && self
                .transport
                .can_open_next_outgoing_unidirectional_stream()
        {
            let Some((send_order, subscription_id)) = self.queued_streams.max() else {
                return;
            };
            if self.published_subscriptions.contains_key(&subscription_id) {
                let Some((first_object, (old_send_order, new_send_order))) = self
                    .published_subscriptions
                    .get_mut(&subscription_id)
                    .unwrap()
                    .next_queued_outgoing_data_stream()
                else {
                    // The local queue ran dry; the entry is stale.
                    self.queued_streams.remove(send_order, subscription_id);
                    continue;
                };
                self.queued_streams
                    .update(subscription_id, old_send_order, new_send_order);
                if let Some(stream_id) = self.open_data_stream(subscription_id, first_object) {
                    self.outgoing_stream_send_objects(stream_id);
                }
            } else if self.incoming_fetches.contains_key(&subscription_id) {
                // A FETCH needs exactly one stream.
                let opened = self.open_fetch_stream(subscription_id);
                self.queued_streams.remove(send_order, subscription_id);
                if !opened {
                    return;
                }
            } else {
                // Stale entry from a destroyed subscription.
                self.queued_streams.remove(send_order, subscription_id);
            }
        }
    }

    // ---------------------------------------------------------------
    // Object arrival, routed from the track publishers
    // ---------------------------------------------------------------

    pub fn on_object_available(&mut self, name: &FullTrackName, sequence: FullSequence) {
        let Some(&subscription_id) = self.subscribed_track_names.get(name) else {
            return;
        };
        self.subscription_on_new_object(subscription_id, sequence);
    }

    pub fn on_fin_available(&mut self, name: &FullTrackName, sequence: FullSequence) {
        let Some(&subscription_id) = self.subscribed_track_names.get(name) else {
            return;
        };
        let stream_id = {
            let Some(subscription) = self.published_subscriptions.get_mut(&subscription_id) else {
                return;
            };
            if !subscription.in_window(sequence) {
                return;
            }
            match subscription.stream_for_sequence(sequence) {
                Some(stream_id) => stream_id,
                None => return,
            }
        };
        let next_object = match self.outgoing_data_streams.get(&stream_id) {
            Some(OutgoingStream::Subscription(state)) => state.next_object,
            _ => return,
        };
        if next_object.group_object() <= sequence.group_object() {
            // There is still data to send.
            return;
        }
        if let Some(stream) = self.transport.stream(stream_id) {
            if !stream.send_fin() {
                tracing::warn!("Writing pure FIN failed on stream {}", stream_id);
            }
        }
    }

    pub fn on_group_abandoned(&mut self, name: &FullTrackName, group_id: u64) {
        let Some(&subscription_id) = self.subscribed_track_names.get(name) else {
            return;
        };
        let streams = match self.published_subscriptions.get(&subscription_id) {
            Some(subscription) => subscription.streams_for_group(group_id),
            None => return,
        };
        for stream_id in streams {
            if let Some(stream) = self.transport.stream(stream_id) {
                stream.reset_with_user_code(RESET_CODE_TIMED_OUT);
            }
            if let Some(OutgoingStream::Subscription(state)) =
                self.outgoing_data_streams.remove(&stream_id)
            {
                if let Some(subscription) =
                    self.published_subscriptions.get_mut(&state.subscription_id)
                {
                    subscription.on_data_stream_destroyed(stream_id, state.next_object);
                }
            }
        }
    }

    pub fn on_track_publisher_gone(&mut self, name: &FullTrackName) {
        let Some(&subscription_id) = self.subscribed_track_names.get(name) else {
            return;
        };
        self.subscribe_is_done(
            subscription_id,
            SubscribeDoneCode::GoingAway,
            "Publisher is gone",
        );
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    pub(crate) fn send_control_message(&mut self, message: ControlMessage) {
        let Some(control_stream) = &self.control_stream else {
            tracing::error!(
                "Trying to send a message on the control stream while it does not exist"
            );
            return;
        };
        let stream_id = control_stream.stream_id();
        let buf = serialize_control_message(&message);
        let options = StreamWriteOptions {
            send_fin: false,
            // Unconditional buffering preserves control message ordering.
            // There is no cap on the buffered amount yet, which leaves a
            // memory exhaustion hole under a slow peer.
            buffer_unconditionally: true,
        };
        let result = match self.transport.stream(stream_id) {
            Some(stream) => stream.writev(&[&buf[..]], &options),
            None => {
                tracing::error!("Control stream {} is gone", stream_id);
                return;
            }
        };
        if result.is_err() {
            self.error(
                SessionErrorCode::InternalError,
                "Failed to write a control message",
            );
        }
    }

    pub(crate) fn subscribe_with_range(
        &mut self,
        name: &FullTrackName,
        start_group: Option<u64>,
        start_object: Option<u64>,
        end_group: Option<u64>,
        end_object: Option<u64>,
        visitor: Option<SharedRemoteTrackVisitor>,
    ) -> bool {
        let Some(filter_type) = filter_type_for(start_group, start_object, end_group, end_object)
        else {
            tracing::warn!("Invalid range field combination for SUBSCRIBE");
            return false;
        };
        let message = match Subscribe::new(
            0, // Assigned at send time.
            0,
            name.track_namespace().clone(),
            name.track_name().to_string(),
            DEFAULT_SUBSCRIBER_PRIORITY,
            None,
            filter_type,
            start_group,
            start_object,
            end_group,
            end_object,
        ) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!("could not build SUBSCRIBE: {}", err);
                return false;
            }
        };
        self.subscribe(message, visitor, None)
    }

    pub(crate) fn subscribe(
        &mut self,
        mut message: Subscribe,
        visitor: Option<SharedRemoteTrackVisitor>,
        provided_track_alias: Option<u64>,
    ) -> bool {
        if self.peer_role == Some(RoleCase::Subscriber) {
            tracing::debug!("Tried to send SUBSCRIBE to subscriber peer");
            return false;
        }
        if self.next_subscribe_id >= self.peer_max_subscribe_id {
            tracing::debug!(
                "Tried to send SUBSCRIBE with ID {} which is greater than the maximum ID {}",
                self.next_subscribe_id,
                self.peer_max_subscribe_id
            );
            return false;
        }
        let name = message.full_track_name();
        if self.upstream_by_name.contains_key(&name) {
            tracing::debug!(
                "Tried to send SUBSCRIBE for track {} which is already subscribed",
                name
            );
            return false;
        }
        if let Some(track_alias) = provided_track_alias {
            if self.subscribe_by_alias.contains_key(&track_alias) {
                self.error(
                    SessionErrorCode::ProtocolViolation,
                    "Provided track alias already in use",
                );
                return false;
            }
        }
        message.set_subscribe_id(self.next_subscribe_id);
        self.next_subscribe_id += 1;
        let track_alias = provided_track_alias.unwrap_or_else(|| {
            let track_alias = self.next_remote_track_alias;
            self.next_remote_track_alias += 1;
            track_alias
        });
        message.set_track_alias(track_alias);
        let subscribe_id = message.subscribe_id();

        self.send_control_message(ControlMessage::Subscribe(message.clone()));
        tracing::debug!("Sent SUBSCRIBE message for {}", name);

        let window = window_from_subscribe_message(&message);
        let track = SubscribeRemoteTrack::new(message, window, visitor);
        // Owner first, index references next.
        self.subscribe_by_alias.insert(track_alias, track);
        self.upstream_by_id.insert(subscribe_id, track_alias);
        self.upstream_by_name.insert(name, track_alias);
        true
    }

    /// Enforces the inbound subscribe-id window: strictly monotonic and
    /// below the advertised maximum.
    pub(crate) fn validate_subscribe_id(&mut self, subscribe_id: u64) -> bool {
        if self.peer_role == Some(RoleCase::Publisher) {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "Received SUBSCRIBE from publisher",
            );
            return false;
        }
        if subscribe_id >= self.local_max_subscribe_id {
            self.error(
                SessionErrorCode::TooManySubscribes,
                "Received SUBSCRIBE with too large ID",
            );
            return false;
        }
        if subscribe_id < self.next_incoming_subscribe_id {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "Subscribe ID not monotonically increasing",
            );
            return false;
        }
        self.next_incoming_subscribe_id = subscribe_id + 1;
        true
    }

    /// Terminates one published subscription: sends SUBSCRIBE_DONE,
    /// destroys the state and resets all of its open streams. Returns
    /// false if the subscription does not exist (any more).
    pub fn subscribe_is_done(
        &mut self,
        subscribe_id: u64,
        code: SubscribeDoneCode,
        reason_phrase: &str,
    ) -> bool {
        let Some(subscription) = self.published_subscriptions.get(&subscribe_id) else {
            return false;
        };
        let streams_to_reset = subscription.all_streams();
        let final_id = subscription.largest_sent();
        let queue_head = subscription.queue_head_send_order();

        self.send_control_message(ControlMessage::SubscribeDone(SubscribeDone::new(
            subscribe_id,
            code,
            reason_phrase.to_string(),
            final_id,
        )));
        tracing::debug!("Sent SUBSCRIBE_DONE message for {}", subscribe_id);

        // Clean up the subscription.
        let subscription = self.published_subscriptions.remove(&subscribe_id).unwrap();
        self.subscribed_track_names
            .remove(subscription.publisher().track_name());
        if let Some(send_order) = queue_head {
            self.queued_streams.update(subscribe_id, Some(send_order), None);
        }
        for stream_id in streams_to_reset {
            self.outgoing_data_streams.remove(&stream_id);
            if let Some(stream) = self.transport.stream(stream_id) {
                stream.reset_with_user_code(RESET_CODE_SUBSCRIPTION_GONE);
            }
        }
        true
    }

    pub(crate) fn subscription_on_new_object(
        &mut self,
        subscription_id: u64,
        sequence: FullSequence,
    ) {
        let action = {
            let Some(subscription) = self.published_subscriptions.get_mut(&subscription_id) else {
                return;
            };
            if !subscription.in_window(sequence) {
                return;
            }
            if subscription.forwarding_preference()
                == crate::publisher::ForwardingPreference::Datagram
            {
                match subscription.make_datagram(sequence) {
                    Some(datagram) => ObjectAction::Datagram(datagram),
                    None => return,
                }
            } else {
                match subscription.stream_for_sequence(sequence) {
                    Some(stream_id) => ObjectAction::Signal(stream_id),
                    None => ObjectAction::OpenOrQueue,
                }
            }
        };
        match action {
            ObjectAction::Datagram(datagram) => {
                self.transport.send_or_queue_datagram(datagram);
            }
            ObjectAction::Signal(stream_id) => {
                self.outgoing_stream_send_objects(stream_id);
            }
            ObjectAction::OpenOrQueue => {
                if let Some(stream_id) =
                    self.open_or_queue_data_stream(subscription_id, sequence)
                {
                    self.outgoing_stream_send_objects(stream_id);
                }
            }
        }
    }

    pub(crate) fn open_or_queue_data_stream(
        &mut self,
        subscription_id: u64,
        first_object: FullSequence,
    ) -> Option<StreamId> {
        // The subscription might have been discarded while the stream
        // request was pending.
        self.published_subscriptions.get(&subscription_id)?;
        if !self
            .transport
            .can_open_next_outgoing_unidirectional_stream()
        {
            let update = self
                .published_subscriptions
                .get_mut(&subscription_id)
                .unwrap()
                .add_queued_outgoing_data_stream(first_object);
            if let Some((old_send_order, new_send_order)) = update {
                self.queued_streams
                    .update(subscription_id, old_send_order, new_send_order);
            }
            return None;
        }
        self.open_data_stream(subscription_id, first_object)
    }

    pub(crate) fn open_data_stream(
        &mut self,
        subscription_id: u64,
        first_object: FullSequence,
    ) -> Option<StreamId> {
        let Some(stream_id) = self.transport.open_outgoing_unidirectional_stream() else {
            tracing::error!("open_data_stream called while stream creation is blocked");
            return None;
        };
        let send_order = {
            let subscription = self.published_subscriptions.get_mut(&subscription_id)?;
            subscription.on_data_stream_created(stream_id, first_object);
            subscription.get_send_order(first_object)
        };
        if let Some(stream) = self.transport.stream(stream_id) {
            stream.set_priority(SEND_GROUP_ID, send_order);
        }
        self.outgoing_data_streams.insert(
            stream_id,
            OutgoingStream::Subscription(OutgoingDataStream::new(subscription_id, first_object)),
        );
        Some(stream_id)
    }

    pub(crate) fn open_fetch_stream(&mut self, fetch_id: u64) -> bool {
        let Some(stream_id) = self.transport.open_outgoing_unidirectional_stream() else {
            tracing::error!("open_fetch_stream called while stream creation is blocked");
            return false;
        };
        let Some(fetch) = self.incoming_fetches.get_mut(&fetch_id) else {
            return false;
        };
        fetch.set_stream_id(stream_id);
        self.outgoing_data_streams
            .insert(stream_id, OutgoingStream::Fetch(fetch_id));
        self.fetch_stream_send_objects(stream_id, fetch_id);
        true
    }
}

pub(crate) fn window_from_subscribe_message(message: &Subscribe) -> SubscribeWindow {
    let start = FullSequence::new(
        message.start_group().unwrap_or(0),
        0,
        message.start_object().unwrap_or(0),
    );
    match message.end_group() {
        Some(end_group) => SubscribeWindow::new_with_end(
            start,
            FullSequence::new(end_group, 0, message.end_object().unwrap_or(u64::MAX)),
        ),
        None => SubscribeWindow::new(start),
    }
}

pub(crate) fn fetch_send_order(
    subscriber_priority: u8,
    publisher_priority: u8,
    delivery_order: moqt_wire::messages::control_messages::group_order::GroupOrder,
) -> u64 {
    send_order_for_stream(subscriber_priority, publisher_priority, 0, 0, delivery_order)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use bytes::BytesMut;

    use moqt_wire::{
        constants::{
            SessionErrorCode, SubscribeDoneCode, SubscribeErrorCode, MOQ_TRANSPORT_VERSION,
            RESET_CODE_SUBSCRIPTION_GONE,
        },
        data_stream_type::DataStreamType,
        messages::{
            control_messages::{
                client_setup::ClientSetup,
                server_setup::ServerSetup,
                setup_parameters::{RoleCase, SetupParameter},
                subscribe::{FilterType, Subscribe},
                subscribe_error::SubscribeError,
                subscribe_ok::SubscribeOk,
                unsubscribe::Unsubscribe,
            },
            data_streams::{datagram, subgroup_stream, DataStreams},
        },
        models::sequence::FullSequence,
        variable_integer::write_variable_integer,
    };

    use crate::{
        callbacks::MOQTSessionCallbacks,
        config::{MOQTSessionConfig, Perspective},
        parsers::control_message::{
            serialize_control_message, try_read_message, ControlMessage,
            ControlMessageProcessResult,
        },
        session::MOQTSession,
        test_helper::{
            create_mock_transport, test_track_name, MockPublisher, MockTrackPublisher,
            MockTransportHandle, MockVisitor,
        },
        transport::StreamId,
    };

    const CLIENT_CONTROL_STREAM: StreamId = 2;
    const SERVER_CONTROL_STREAM: StreamId = 3;

    fn setup_message_bytes(message: ControlMessage) -> Vec<u8> {
        serialize_control_message(&message).to_vec()
    }

    fn client_setup_bytes(version: u32, max_subscribe_id: u64) -> Vec<u8> {
        setup_message_bytes(ControlMessage::ClientSetup(ClientSetup::new(
            vec![version],
            vec![
                SetupParameter::Role(RoleCase::PubSub),
                SetupParameter::MaxSubscribeId(max_subscribe_id),
            ],
        )))
    }

    fn server_setup_bytes(version: u32, max_subscribe_id: u64) -> Vec<u8> {
        setup_message_bytes(ControlMessage::ServerSetup(ServerSetup::new(
            version,
            vec![
                SetupParameter::Role(RoleCase::PubSub),
                SetupParameter::MaxSubscribeId(max_subscribe_id),
            ],
        )))
    }

    fn read_messages(written: Vec<u8>) -> Vec<ControlMessage> {
        let mut buf = BytesMut::from(&written[..]);
        let mut messages = Vec::new();
        loop {
            match try_read_message(&mut buf) {
                ControlMessageProcessResult::Success(message) => messages.push(message),
                ControlMessageProcessResult::Continue => break,
                ControlMessageProcessResult::Failure(code, reason) => {
                    panic!("unparseable control bytes: {:?} {}", code, reason)
                }
            }
        }
        messages
    }

    fn client_session(peer_max_subscribe_id: u64) -> (MOQTSession, MockTransportHandle) {
        let (transport, handle) = create_mock_transport();
        let config = MOQTSessionConfig {
            perspective: Perspective::Client,
            max_subscribe_id: 10,
            ..Default::default()
        };
        let mut session = MOQTSession::new(transport, config, MOQTSessionCallbacks::default());
        session.on_session_ready();
        handle.take_written(CLIENT_CONTROL_STREAM);
        handle.push_read(
            CLIENT_CONTROL_STREAM,
            &server_setup_bytes(MOQ_TRANSPORT_VERSION, peer_max_subscribe_id),
        );
        session.on_can_read(CLIENT_CONTROL_STREAM);
        assert!(!session.is_closed());
        (session, handle)
    }

    fn server_session(
        publisher: MockPublisher,
        local_max_subscribe_id: u64,
    ) -> (MOQTSession, MockTransportHandle) {
        let (transport, handle) = create_mock_transport();
        let config = MOQTSessionConfig {
            perspective: Perspective::Server,
            max_subscribe_id: local_max_subscribe_id,
            ..Default::default()
        };
        let mut session = MOQTSession::new(transport, config, MOQTSessionCallbacks::default());
        session.set_publisher(Rc::new(publisher));
        handle.seed_incoming_bidi(SERVER_CONTROL_STREAM);
        handle.push_read(
            SERVER_CONTROL_STREAM,
            &client_setup_bytes(MOQ_TRANSPORT_VERSION, 10),
        );
        session.on_incoming_bidirectional_stream_available();
        assert!(!session.is_closed());
        handle.take_written(SERVER_CONTROL_STREAM);
        (session, handle)
    }

    fn inbound_subscribe(subscribe_id: u64, track_alias: u64) -> Vec<u8> {
        let subscribe = Subscribe::new(
            subscribe_id,
            track_alias,
            vec!["live".to_string()],
            "video".to_string(),
            0x80,
            None,
            FilterType::LatestGroup,
            None,
            None,
            None,
            None,
        )
        .unwrap();
        setup_message_bytes(ControlMessage::Subscribe(subscribe))
    }

    fn subgroup_stream_bytes(
        track_alias: u64,
        group_id: u64,
        subgroup_id: u64,
        object_id: u64,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut buf =
            write_variable_integer(u8::from(DataStreamType::SubgroupHeader) as u64);
        subgroup_stream::Header::new(track_alias, group_id, subgroup_id, 0x80).packetize(&mut buf);
        subgroup_stream::Object::new(object_id, None, payload.to_vec())
            .unwrap()
            .packetize(&mut buf);
        buf.to_vec()
    }

    fn datagram_bytes(track_alias: u64, group_id: u64, object_id: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf =
            write_variable_integer(u8::from(DataStreamType::ObjectDatagram) as u64);
        datagram::Object::new(track_alias, group_id, object_id, 0x80, None, payload.to_vec())
            .unwrap()
            .packetize(&mut buf);
        buf.to_vec()
    }

    mod handshake {
        use super::*;

        #[test]
        fn client_records_peer_max_subscribe_id() {
            let established = Rc::new(RefCell::new(false));
            let (transport, handle) = create_mock_transport();
            let mut callbacks = MOQTSessionCallbacks::default();
            let flag = established.clone();
            callbacks.session_established = Some(Box::new(move || {
                *flag.borrow_mut() = true;
            }));
            let config = MOQTSessionConfig {
                perspective: Perspective::Client,
                max_subscribe_id: 10,
                ..Default::default()
            };
            let mut session = MOQTSession::new(transport, config, callbacks);

            session.on_session_ready();
            let sent = read_messages(handle.take_written(CLIENT_CONTROL_STREAM));
            assert!(matches!(sent[0], ControlMessage::ClientSetup(_)));

            handle.push_read(
                CLIENT_CONTROL_STREAM,
                &server_setup_bytes(MOQ_TRANSPORT_VERSION, 5),
            );
            session.on_can_read(CLIENT_CONTROL_STREAM);

            assert!(*established.borrow());
            assert_eq!(session.peer_max_subscribe_id(), 5);
            assert!(!session.supports_object_ack());
            assert_eq!(
                handle.priority(CLIENT_CONTROL_STREAM),
                Some((crate::priority::SEND_GROUP_ID, u64::MAX))
            );
            assert!(!session.is_closed());
        }

        #[test]
        fn server_replies_with_server_setup() {
            let established = Rc::new(RefCell::new(false));
            let (transport, handle) = create_mock_transport();
            let mut callbacks = MOQTSessionCallbacks::default();
            let flag = established.clone();
            callbacks.session_established = Some(Box::new(move || {
                *flag.borrow_mut() = true;
            }));
            let config = MOQTSessionConfig {
                perspective: Perspective::Server,
                max_subscribe_id: 5,
                ..Default::default()
            };
            let mut session = MOQTSession::new(transport, config, callbacks);

            handle.seed_incoming_bidi(SERVER_CONTROL_STREAM);
            handle.push_read(
                SERVER_CONTROL_STREAM,
                &client_setup_bytes(MOQ_TRANSPORT_VERSION, 10),
            );
            session.on_incoming_bidirectional_stream_available();

            let sent = read_messages(handle.take_written(SERVER_CONTROL_STREAM));
            assert!(matches!(sent[0], ControlMessage::ServerSetup(_)));
            assert!(*established.borrow());
            assert_eq!(session.peer_max_subscribe_id(), 10);
        }

        #[test]
        fn version_mismatch_closes_session() {
            let (transport, handle) = create_mock_transport();
            let config = MOQTSessionConfig {
                perspective: Perspective::Client,
                ..Default::default()
            };
            let mut session =
                MOQTSession::new(transport, config, MOQTSessionCallbacks::default());
            session.on_session_ready();
            handle.take_written(CLIENT_CONTROL_STREAM);

            handle.push_read(
                CLIENT_CONTROL_STREAM,
                &server_setup_bytes(MOQ_TRANSPORT_VERSION + 1, 5),
            );
            session.on_can_read(CLIENT_CONTROL_STREAM);

            let (code, reason) = handle.closed().unwrap();
            assert_eq!(code, u64::from(SessionErrorCode::ProtocolViolation));
            assert!(reason.starts_with("Version mismatch"));

            // Later messages are not processed.
            handle.push_read(
                CLIENT_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::SubscribeOk(SubscribeOk::new(
                    0,
                    0,
                    moqt_wire::messages::control_messages::group_order::GroupOrder::Ascending,
                    None,
                ))),
            );
            session.on_can_read(CLIENT_CONTROL_STREAM);
            assert_eq!(handle.close_count(), 1);
        }

        #[test]
        fn duplicate_control_stream_is_a_protocol_violation() {
            let publisher = MockPublisher::new();
            let (mut session, handle) = server_session(publisher, 10);

            handle.seed_incoming_bidi(7);
            session.on_incoming_bidirectional_stream_available();

            let (code, reason) = handle.closed().unwrap();
            assert_eq!(code, u64::from(SessionErrorCode::ProtocolViolation));
            assert_eq!(reason, "Bidirectional stream already open");
        }
    }

    mod subscribe_ids {
        use super::*;

        #[test]
        fn non_monotonic_subscribe_id_closes_session() {
            let publisher = MockPublisher::new();
            publisher.add_track(MockTrackPublisher::new(test_track_name()));
            let (mut session, handle) = server_session(publisher, 10);

            handle.push_read(SERVER_CONTROL_STREAM, &inbound_subscribe(3, 1));
            session.on_can_read(SERVER_CONTROL_STREAM);
            assert!(!session.is_closed());

            handle.push_read(SERVER_CONTROL_STREAM, &inbound_subscribe(2, 2));
            session.on_can_read(SERVER_CONTROL_STREAM);

            let (code, reason) = handle.closed().unwrap();
            assert_eq!(code, u64::from(SessionErrorCode::ProtocolViolation));
            assert_eq!(reason, "Subscribe ID not monotonically increasing");
        }

        #[test]
        fn subscribe_id_past_local_maximum_closes_session() {
            let publisher = MockPublisher::new();
            publisher.add_track(MockTrackPublisher::new(test_track_name()));
            let (mut session, handle) = server_session(publisher, 4);

            handle.push_read(SERVER_CONTROL_STREAM, &inbound_subscribe(4, 1));
            session.on_can_read(SERVER_CONTROL_STREAM);

            let (code, _) = handle.closed().unwrap();
            assert_eq!(code, u64::from(SessionErrorCode::TooManySubscribes));
        }

        #[test]
        fn outbound_subscribe_respects_peer_maximum() {
            let (mut session, handle) = client_session(1);
            let name = test_track_name();

            assert!(session.subscribe_current_object(&name, None));
            let other = moqt_wire::models::track::FullTrackName::new(
                vec!["live".to_string()],
                "audio".to_string(),
            );
            assert!(!session.subscribe_current_object(&other, None));

            let sent = read_messages(handle.take_written(CLIENT_CONTROL_STREAM));
            assert_eq!(sent.len(), 1);
        }

        #[test]
        fn max_subscribe_id_regression_closes_session() {
            let (mut session, handle) = client_session(10);

            handle.push_read(
                CLIENT_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::MaxSubscribeId(
                    moqt_wire::messages::control_messages::max_subscribe_id::MaxSubscribeId::new(
                        3,
                    ),
                )),
            );
            session.on_can_read(CLIENT_CONTROL_STREAM);

            let (code, reason) = handle.closed().unwrap();
            assert_eq!(code, u64::from(SessionErrorCode::ProtocolViolation));
            assert_eq!(reason, "MAX_SUBSCRIBE_ID message has lower value than previous");
        }

        #[test]
        fn grant_more_subscribes_sends_new_maximum() {
            let publisher = MockPublisher::new();
            let (mut session, handle) = server_session(publisher, 10);

            session.grant_more_subscribes(5);

            let sent = read_messages(handle.take_written(SERVER_CONTROL_STREAM));
            match &sent[0] {
                ControlMessage::MaxSubscribeId(message) => {
                    assert_eq!(message.max_subscribe_id(), 15);
                }
                message => panic!("unexpected message {:?}", message),
            }
        }
    }

    mod upstream_subscribe {
        use super::*;

        #[test]
        fn subscribe_ok_reaches_visitor_and_indices() {
            let (mut session, handle) = client_session(10);
            let name = test_track_name();
            let visitor = Rc::new(RefCell::new(MockVisitor::default()));

            assert!(session.subscribe_current_object(&name, Some(visitor.clone())));
            let sent = read_messages(handle.take_written(CLIENT_CONTROL_STREAM));
            let subscribe_id = match &sent[0] {
                ControlMessage::Subscribe(message) => message.subscribe_id(),
                message => panic!("unexpected message {:?}", message),
            };

            handle.push_read(
                CLIENT_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::SubscribeOk(SubscribeOk::new(
                    subscribe_id,
                    0,
                    moqt_wire::messages::control_messages::group_order::GroupOrder::Ascending,
                    Some(FullSequence::new(2, 0, 5)),
                ))),
            );
            session.on_can_read(CLIENT_CONTROL_STREAM);

            let replies = &visitor.borrow().replies;
            assert_eq!(replies.len(), 1);
            assert_eq!(replies[0].1, Some(FullSequence::new(2, 0, 5)));
            assert!(replies[0].2.is_none());

            // Reachable by name, id and alias.
            assert!(session.upstream_by_name.contains_key(&name));
            assert!(session.upstream_by_id.contains_key(&subscribe_id));
            let track_alias = session.upstream_by_name[&name];
            assert!(session.subscribe_by_alias.contains_key(&track_alias));

            session.unsubscribe(&name);
            let sent = read_messages(handle.take_written(CLIENT_CONTROL_STREAM));
            assert!(matches!(sent[0], ControlMessage::Unsubscribe(_)));
            assert!(session.upstream_by_name.is_empty());
            assert!(session.upstream_by_id.is_empty());
            assert!(session.subscribe_by_alias.is_empty());
        }

        #[test]
        fn duplicate_subscribe_for_same_track_is_rejected_locally() {
            let (mut session, handle) = client_session(10);
            let name = test_track_name();

            assert!(session.subscribe_current_object(&name, None));
            assert!(!session.subscribe_current_object(&name, None));

            let sent = read_messages(handle.take_written(CLIENT_CONTROL_STREAM));
            assert_eq!(sent.len(), 1);
        }

        #[test]
        fn retry_track_alias_resubscribes_with_new_alias() {
            let (mut session, handle) = client_session(10);
            let name = test_track_name();
            let visitor = Rc::new(RefCell::new(MockVisitor::default()));

            assert!(session.subscribe_current_object(&name, Some(visitor.clone())));
            handle.take_written(CLIENT_CONTROL_STREAM);

            handle.push_read(
                CLIENT_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::SubscribeError(SubscribeError::new(
                    0,
                    SubscribeErrorCode::RetryTrackAlias,
                    "retry".to_string(),
                    9,
                ))),
            );
            session.on_can_read(CLIENT_CONTROL_STREAM);

            let sent = read_messages(handle.take_written(CLIENT_CONTROL_STREAM));
            match &sent[0] {
                ControlMessage::Subscribe(message) => {
                    assert_eq!(message.track_alias(), 9);
                    assert_eq!(message.subscribe_id(), 1);
                }
                message => panic!("unexpected message {:?}", message),
            }
            assert_eq!(session.upstream_by_name[&name], 9);
            assert!(session.subscribe_by_alias.contains_key(&9));
            // No terminal error was reported to the visitor.
            assert!(visitor.borrow().replies.is_empty());
        }

        #[test]
        fn terminal_subscribe_error_reports_and_removes_state() {
            let (mut session, handle) = client_session(10);
            let name = test_track_name();
            let visitor = Rc::new(RefCell::new(MockVisitor::default()));

            assert!(session.subscribe_current_object(&name, Some(visitor.clone())));
            handle.take_written(CLIENT_CONTROL_STREAM);

            handle.push_read(
                CLIENT_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::SubscribeError(SubscribeError::new(
                    0,
                    SubscribeErrorCode::TrackDoesNotExist,
                    "no such track".to_string(),
                    0,
                ))),
            );
            session.on_can_read(CLIENT_CONTROL_STREAM);

            let replies = &visitor.borrow().replies;
            assert_eq!(replies.len(), 1);
            assert_eq!(replies[0].2.as_deref(), Some("no such track"));
            assert!(session.upstream_by_name.is_empty());
            assert!(session.subscribe_by_alias.is_empty());
        }

        #[test]
        fn subscribe_error_after_ok_closes_session() {
            let (mut session, handle) = client_session(10);
            let name = test_track_name();

            assert!(session.subscribe_current_object(&name, None));
            handle.take_written(CLIENT_CONTROL_STREAM);
            handle.push_read(
                CLIENT_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::SubscribeOk(SubscribeOk::new(
                    0,
                    0,
                    moqt_wire::messages::control_messages::group_order::GroupOrder::Ascending,
                    None,
                ))),
            );
            session.on_can_read(CLIENT_CONTROL_STREAM);

            handle.push_read(
                CLIENT_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::SubscribeError(SubscribeError::new(
                    0,
                    SubscribeErrorCode::InternalError,
                    "late".to_string(),
                    0,
                ))),
            );
            session.on_can_read(CLIENT_CONTROL_STREAM);

            let (code, reason) = handle.closed().unwrap();
            assert_eq!(code, u64::from(SessionErrorCode::ProtocolViolation));
            assert_eq!(reason, "Received SUBSCRIBE_ERROR after SUBSCRIBE_OK or objects");
        }

        #[test]
        fn range_end_before_start_is_rejected_without_sending() {
            let (mut session, handle) = client_session(10);
            let name = test_track_name();

            assert!(!session.subscribe_absolute_with_end(&name, 5, 0, 4, None));
            assert!(!session.subscribe_absolute_with_end_object(&name, 5, 3, 5, 2, None));
            assert!(handle.take_written(CLIENT_CONTROL_STREAM).is_empty());
        }
    }

    mod published_subscriptions {
        use super::*;

        fn track_with_objects(sequences: &[FullSequence]) -> MockTrackPublisher {
            let mut track = MockTrackPublisher::new(test_track_name());
            for sequence in sequences {
                track.push_object(*sequence, b"payload");
            }
            track
        }

        #[test]
        fn subscribe_for_unknown_track_sends_error() {
            let publisher = MockPublisher::new();
            let (mut session, handle) = server_session(publisher, 10);

            handle.push_read(SERVER_CONTROL_STREAM, &inbound_subscribe(0, 1));
            session.on_can_read(SERVER_CONTROL_STREAM);

            let sent = read_messages(handle.take_written(SERVER_CONTROL_STREAM));
            match &sent[0] {
                ControlMessage::SubscribeError(message) => {
                    assert_eq!(message.error_code(), SubscribeErrorCode::TrackDoesNotExist);
                }
                message => panic!("unexpected message {:?}", message),
            }
            assert!(!session.is_closed());
        }

        #[test]
        fn subscribe_in_previous_group_sends_invalid_range() {
            let publisher = MockPublisher::new();
            publisher.add_track(track_with_objects(&[FullSequence::new(5, 0, 0)]));
            let (mut session, handle) = server_session(publisher, 10);

            let subscribe = Subscribe::new(
                0,
                1,
                vec!["live".to_string()],
                "video".to_string(),
                0x80,
                None,
                FilterType::AbsoluteStart,
                Some(4),
                Some(0),
                None,
                None,
            )
            .unwrap();
            handle.push_read(
                SERVER_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::Subscribe(subscribe)),
            );
            session.on_can_read(SERVER_CONTROL_STREAM);

            let sent = read_messages(handle.take_written(SERVER_CONTROL_STREAM));
            match &sent[0] {
                ControlMessage::SubscribeError(message) => {
                    assert_eq!(message.error_code(), SubscribeErrorCode::InvalidRange);
                    assert_eq!(message.reason_phrase(), "SUBSCRIBE starts in previous group");
                }
                message => panic!("unexpected message {:?}", message),
            }
        }

        #[test]
        fn accepted_subscribe_replies_ok_and_backfills() {
            let publisher = MockPublisher::new();
            publisher.add_track(track_with_objects(&[
                FullSequence::new(0, 0, 0),
                FullSequence::new(0, 0, 1),
                FullSequence::new(0, 1, 0),
            ]));
            let (mut session, handle) = server_session(publisher, 10);

            handle.push_read(SERVER_CONTROL_STREAM, &inbound_subscribe(0, 7));
            session.on_can_read(SERVER_CONTROL_STREAM);

            let sent = read_messages(handle.take_written(SERVER_CONTROL_STREAM));
            match &sent[0] {
                ControlMessage::SubscribeOk(message) => {
                    assert_eq!(message.largest_id(), Some(FullSequence::new(0, 0, 1)));
                }
                message => panic!("unexpected message {:?}", message),
            }

            // One stream per subgroup, each carrying its objects.
            let data_streams: Vec<StreamId> = session
                .outgoing_data_streams
                .keys()
                .copied()
                .collect();
            assert_eq!(data_streams.len(), 2);
            let mut all_written = Vec::new();
            for stream_id in data_streams {
                let written = handle.written(stream_id);
                assert!(!written.is_empty());
                all_written.extend(written);
            }
            assert!(!session.is_closed());
            assert!(all_written.len() > 2 * b"payload".len());
        }

        #[test]
        fn duplicate_subscribe_for_same_track_closes_session() {
            let publisher = MockPublisher::new();
            publisher.add_track(MockTrackPublisher::new(test_track_name()));
            let (mut session, handle) = server_session(publisher, 10);

            handle.push_read(SERVER_CONTROL_STREAM, &inbound_subscribe(0, 1));
            session.on_can_read(SERVER_CONTROL_STREAM);
            handle.push_read(SERVER_CONTROL_STREAM, &inbound_subscribe(1, 2));
            session.on_can_read(SERVER_CONTROL_STREAM);

            let (code, reason) = handle.closed().unwrap();
            assert_eq!(code, u64::from(SessionErrorCode::ProtocolViolation));
            assert_eq!(reason, "Duplicate subscribe for track");
        }

        #[test]
        fn queued_streams_open_in_send_order_priority() {
            let publisher = MockPublisher::new();
            let mut low = MockTrackPublisher::new(test_track_name());
            low.set_publisher_priority(1);
            low.push_object(FullSequence::new(0, 0, 0), b"low");
            publisher.add_track(low);
            let mut high = MockTrackPublisher::new(
                moqt_wire::models::track::FullTrackName::new(
                    vec!["live".to_string()],
                    "audio".to_string(),
                ),
            );
            high.set_publisher_priority(2);
            high.push_object(FullSequence::new(0, 0, 0), b"high");
            publisher.add_track(high);
            let (mut session, handle) = server_session(publisher, 10);

            // No stream credit: both subscriptions queue their streams.
            handle.set_uni_credit(0);
            handle.push_read(SERVER_CONTROL_STREAM, &inbound_subscribe(0, 1));
            session.on_can_read(SERVER_CONTROL_STREAM);
            let audio_subscribe = Subscribe::new(
                1,
                2,
                vec!["live".to_string()],
                "audio".to_string(),
                0x80,
                None,
                FilterType::LatestGroup,
                None,
                None,
                None,
                None,
            )
            .unwrap();
            handle.push_read(
                SERVER_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::Subscribe(audio_subscribe)),
            );
            session.on_can_read(SERVER_CONTROL_STREAM);
            assert!(session.outgoing_data_streams.is_empty());

            // One unit of credit admits the higher-priority subscription.
            handle.set_uni_credit(1);
            session.on_can_create_new_outgoing_unidirectional_stream();

            assert_eq!(session.outgoing_data_streams.len(), 1);
            let stream_id = *session.outgoing_data_streams.keys().next().unwrap();
            let written = handle.written(stream_id);
            assert!(written.ends_with(b"high"));

            // The lower-priority subscription is still queued.
            handle.set_uni_credit(1);
            session.on_can_create_new_outgoing_unidirectional_stream();
            assert_eq!(session.outgoing_data_streams.len(), 2);
        }

        #[test]
        fn group_abandoned_resets_group_streams() {
            let publisher = MockPublisher::new();
            publisher.add_track(track_with_objects(&[
                FullSequence::new(5, 0, 0),
                FullSequence::new(5, 1, 0),
            ]));
            let (mut session, handle) = server_session(publisher, 10);

            handle.push_read(SERVER_CONTROL_STREAM, &inbound_subscribe(0, 7));
            session.on_can_read(SERVER_CONTROL_STREAM);
            let data_streams: Vec<StreamId> =
                session.outgoing_data_streams.keys().copied().collect();
            assert_eq!(data_streams.len(), 2);

            session.on_group_abandoned(&test_track_name(), 5);

            for stream_id in data_streams {
                assert_eq!(
                    handle.reset_code(stream_id),
                    Some(moqt_wire::constants::RESET_CODE_TIMED_OUT)
                );
            }
            assert!(session.outgoing_data_streams.is_empty());
        }

        #[test]
        fn fin_after_last_object_closes_stream() {
            let publisher = MockPublisher::new();
            publisher.add_track(track_with_objects(&[FullSequence::new(0, 0, 0)]));
            let (mut session, handle) = server_session(publisher, 10);

            handle.push_read(SERVER_CONTROL_STREAM, &inbound_subscribe(0, 7));
            session.on_can_read(SERVER_CONTROL_STREAM);
            let stream_id = *session.outgoing_data_streams.keys().next().unwrap();
            assert!(!handle.fin_sent(stream_id));

            session.on_fin_available(&test_track_name(), FullSequence::new(0, 0, 0));

            assert!(handle.fin_sent(stream_id));
        }

        #[test]
        fn subscribe_update_narrows_the_window() {
            let publisher = MockPublisher::new();
            publisher.add_track(MockTrackPublisher::new(test_track_name()));
            let (mut session, handle) = server_session(publisher, 10);

            handle.push_read(SERVER_CONTROL_STREAM, &inbound_subscribe(0, 7));
            session.on_can_read(SERVER_CONTROL_STREAM);

            let update =
                moqt_wire::messages::control_messages::subscribe_update::SubscribeUpdate::new(
                    0, 2, 0, None, None, 0x80,
                );
            handle.push_read(
                SERVER_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::SubscribeUpdate(update)),
            );
            session.on_can_read(SERVER_CONTROL_STREAM);

            // Objects before the new start are ignored.
            session.on_object_available(&test_track_name(), FullSequence::new(1, 0, 0));
            assert!(session.outgoing_data_streams.is_empty());

            session.on_object_available(&test_track_name(), FullSequence::new(2, 0, 0));
            assert_eq!(session.outgoing_data_streams.len(), 1);
        }

        #[test]
        fn unsubscribe_sends_done_and_resets_streams() {
            let publisher = MockPublisher::new();
            publisher.add_track(track_with_objects(&[
                FullSequence::new(5, 0, 9),
                FullSequence::new(5, 1, 10),
            ]));
            let (mut session, handle) = server_session(publisher, 10);

            handle.push_read(SERVER_CONTROL_STREAM, &inbound_subscribe(0, 7));
            session.on_can_read(SERVER_CONTROL_STREAM);
            handle.take_written(SERVER_CONTROL_STREAM);
            let data_streams: Vec<StreamId> =
                session.outgoing_data_streams.keys().copied().collect();
            assert_eq!(data_streams.len(), 2);

            handle.push_read(
                SERVER_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::Unsubscribe(Unsubscribe::new(0))),
            );
            session.on_can_read(SERVER_CONTROL_STREAM);

            let sent = read_messages(handle.take_written(SERVER_CONTROL_STREAM));
            match &sent[0] {
                ControlMessage::SubscribeDone(message) => {
                    assert_eq!(message.status_code(), SubscribeDoneCode::Unsubscribed);
                    let final_id = message.final_id().unwrap();
                    assert_eq!((final_id.group_id, final_id.object_id), (5, 10));
                }
                message => panic!("unexpected message {:?}", message),
            }
            for stream_id in data_streams {
                assert_eq!(
                    handle.reset_code(stream_id),
                    Some(RESET_CODE_SUBSCRIPTION_GONE)
                );
            }
            assert!(session.published_subscriptions.is_empty());

            // Idempotent: the subscription is gone.
            assert!(!session.subscribe_is_done(0, SubscribeDoneCode::Unsubscribed, ""));
        }
    }

    mod data_delivery {
        use super::*;

        #[test]
        fn fragmented_object_is_reassembled() {
            let (mut session, handle) = client_session(10);
            let name = test_track_name();
            let visitor = Rc::new(RefCell::new(MockVisitor::default()));
            assert!(session.subscribe_current_object(&name, Some(visitor.clone())));

            let bytes = subgroup_stream_bytes(0, 0, 0, 0, b"fragmented payload");
            let (first_half, second_half) = bytes.split_at(bytes.len() - 9);

            handle.seed_incoming_uni(11);
            handle.push_read(11, first_half);
            session.on_incoming_unidirectional_stream_available();
            assert!(visitor.borrow().objects.is_empty());

            handle.push_read(11, second_half);
            session.on_can_read(11);

            let objects = &visitor.borrow().objects;
            assert_eq!(objects.len(), 1);
            assert_eq!(objects[0].2, b"fragmented payload");
            assert!(objects[0].3);
        }

        #[test]
        fn object_for_unknown_alias_stops_sending() {
            let (mut session, handle) = client_session(10);

            handle.seed_incoming_uni(11);
            handle.push_read(11, &subgroup_stream_bytes(42, 0, 0, 0, b"x"));
            session.on_incoming_unidirectional_stream_available();

            assert!(!session.is_closed());
            assert_eq!(
                handle.stop_sending_code(11),
                Some(RESET_CODE_SUBSCRIPTION_GONE)
            );
        }

        #[test]
        fn datagram_for_subgroup_track_closes_session() {
            let (mut session, handle) = client_session(10);
            let name = test_track_name();
            let visitor = Rc::new(RefCell::new(MockVisitor::default()));
            assert!(session.subscribe_current_object(&name, Some(visitor.clone())));

            // The first stream object locks the track to subgroup streams.
            handle.seed_incoming_uni(11);
            handle.push_read(11, &subgroup_stream_bytes(0, 0, 0, 0, b"x"));
            session.on_incoming_unidirectional_stream_available();
            assert_eq!(visitor.borrow().objects.len(), 1);

            session.on_datagram_received(&datagram_bytes(0, 0, 1, b"y"));

            let (code, reason) = handle.closed().unwrap();
            assert_eq!(code, u64::from(SessionErrorCode::ProtocolViolation));
            assert_eq!(reason, "Received DATAGRAM for non-datagram track");
        }

        #[test]
        fn datagram_for_unknown_alias_is_dropped() {
            let (mut session, handle) = client_session(10);

            session.on_datagram_received(&datagram_bytes(42, 0, 0, b"y"));

            assert!(!session.is_closed());
            assert!(handle.closed().is_none());
        }

        #[test]
        fn datagram_in_window_reaches_visitor() {
            let (mut session, _handle) = client_session(10);
            let name = test_track_name();
            let visitor = Rc::new(RefCell::new(MockVisitor::default()));
            assert!(session.subscribe_current_object(&name, Some(visitor.clone())));

            session.on_datagram_received(&datagram_bytes(0, 2, 3, b"payload"));

            let objects = &visitor.borrow().objects;
            assert_eq!(objects.len(), 1);
            assert_eq!(objects[0].1, FullSequence::new(2, 0, 3));
            assert_eq!(objects[0].2, b"payload");
        }

        #[test]
        fn control_message_on_data_stream_closes_session() {
            let (mut session, handle) = client_session(10);

            handle.seed_incoming_uni(11);
            handle.push_read(11, &inbound_subscribe(0, 1));
            session.on_incoming_unidirectional_stream_available();

            let (code, reason) = handle.closed().unwrap();
            assert_eq!(code, u64::from(SessionErrorCode::ProtocolViolation));
            assert!(reason.contains("control message"));
        }
    }

    mod datagram_publishing {
        use super::*;

        #[test]
        fn datagram_track_objects_are_sent_as_datagrams() {
            let publisher = MockPublisher::new();
            let mut track = MockTrackPublisher::new(test_track_name());
            track.set_forwarding_preference(crate::publisher::ForwardingPreference::Datagram);
            track.push_object(FullSequence::new(0, 0, 0), b"dgram");
            publisher.add_track(track);
            let (mut session, handle) = server_session(publisher, 10);

            handle.push_read(SERVER_CONTROL_STREAM, &inbound_subscribe(0, 7));
            session.on_can_read(SERVER_CONTROL_STREAM);

            let datagrams = handle.datagrams();
            assert_eq!(datagrams.len(), 1);
            assert!(datagrams[0].ends_with(b"dgram"));
            assert!(session.outgoing_data_streams.is_empty());
        }
    }

    mod announces {
        use super::*;

        #[test]
        fn announce_ok_resolves_pending_announce() {
            let (mut session, handle) = client_session(10);
            let result = Rc::new(RefCell::new(None));
            let stored = result.clone();

            session.announce(
                vec!["live".to_string()],
                Box::new(move |_, error| {
                    *stored.borrow_mut() = Some(error);
                }),
            );
            let sent = read_messages(handle.take_written(CLIENT_CONTROL_STREAM));
            assert!(matches!(sent[0], ControlMessage::Announce(_)));

            handle.push_read(
                CLIENT_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::AnnounceOk(
                    moqt_wire::messages::control_messages::announce_ok::AnnounceOk::new(vec![
                        "live".to_string(),
                    ]),
                )),
            );
            session.on_can_read(CLIENT_CONTROL_STREAM);

            assert_eq!(*result.borrow(), Some(None));
        }

        #[test]
        fn duplicate_pending_announce_fails_immediately() {
            let (mut session, handle) = client_session(10);
            let result = Rc::new(RefCell::new(None));
            let stored = result.clone();

            session.announce(vec!["live".to_string()], Box::new(|_, _| {}));
            session.announce(
                vec!["live".to_string()],
                Box::new(move |_, error| {
                    *stored.borrow_mut() = Some(error.is_some());
                }),
            );

            assert_eq!(*result.borrow(), Some(true));
            let sent = read_messages(handle.take_written(CLIENT_CONTROL_STREAM));
            assert_eq!(sent.len(), 1);
        }

        #[test]
        fn spurious_announce_ok_closes_session() {
            let (mut session, handle) = client_session(10);

            handle.push_read(
                CLIENT_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::AnnounceOk(
                    moqt_wire::messages::control_messages::announce_ok::AnnounceOk::new(vec![
                        "bogus".to_string(),
                    ]),
                )),
            );
            session.on_can_read(CLIENT_CONTROL_STREAM);

            let (code, reason) = handle.closed().unwrap();
            assert_eq!(code, u64::from(SessionErrorCode::ProtocolViolation));
            assert_eq!(reason, "Received ANNOUNCE_OK for nonexistent announce");
        }

        #[test]
        fn incoming_announce_is_answered_via_callback() {
            let (mut session, handle) = client_session(10);

            handle.push_read(
                CLIENT_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::Announce(
                    moqt_wire::messages::control_messages::announce::Announce::new(vec![
                        "live".to_string(),
                    ]),
                )),
            );
            session.on_can_read(CLIENT_CONTROL_STREAM);

            // The default callback declines every namespace.
            let sent = read_messages(handle.take_written(CLIENT_CONTROL_STREAM));
            assert!(matches!(sent[0], ControlMessage::AnnounceError(_)));
        }
    }

    mod termination {
        use super::*;

        #[test]
        fn error_is_idempotent() {
            let terminated = Rc::new(RefCell::new(Vec::new()));
            let (transport, handle) = create_mock_transport();
            let mut callbacks = MOQTSessionCallbacks::default();
            let log = terminated.clone();
            callbacks.session_terminated = Some(Box::new(move |reason| {
                log.borrow_mut().push(reason.to_string());
            }));
            let mut session = MOQTSession::new(
                transport,
                MOQTSessionConfig::default(),
                callbacks,
            );

            session.error(SessionErrorCode::ProtocolViolation, "first");
            session.error(SessionErrorCode::InternalError, "second");

            assert_eq!(handle.close_count(), 1);
            assert_eq!(
                handle.closed(),
                Some((
                    u64::from(SessionErrorCode::ProtocolViolation),
                    "first".to_string()
                ))
            );
            assert_eq!(*terminated.borrow(), vec!["first".to_string()]);
        }

        #[test]
        fn session_closed_after_error_does_not_fire_twice() {
            let terminated = Rc::new(RefCell::new(Vec::new()));
            let (transport, _handle) = create_mock_transport();
            let mut callbacks = MOQTSessionCallbacks::default();
            let log = terminated.clone();
            callbacks.session_terminated = Some(Box::new(move |reason| {
                log.borrow_mut().push(reason.to_string());
            }));
            let mut session = MOQTSession::new(
                transport,
                MOQTSessionConfig::default(),
                callbacks,
            );

            session.error(SessionErrorCode::ProtocolViolation, "first");
            session.on_session_closed("transport went away");

            assert_eq!(*terminated.borrow(), vec!["first".to_string()]);
        }
    }

    mod fetches {
        use super::*;

        #[test]
        fn inbound_fetch_writes_objects_on_one_stream() {
            let publisher = MockPublisher::new();
            let mut track = MockTrackPublisher::new(test_track_name());
            track.push_object(FullSequence::new(0, 0, 0), b"one");
            track.push_object(FullSequence::new(0, 0, 1), b"two");
            publisher.add_track(track);
            let (mut session, handle) = server_session(publisher, 10);

            let fetch = moqt_wire::messages::control_messages::fetch::Fetch::new(
                0,
                vec!["live".to_string()],
                "video".to_string(),
                0x80,
                None,
                0,
                0,
                0,
                None,
            );
            handle.push_read(
                SERVER_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::Fetch(fetch)),
            );
            session.on_can_read(SERVER_CONTROL_STREAM);

            let sent = read_messages(handle.take_written(SERVER_CONTROL_STREAM));
            assert!(matches!(sent[0], ControlMessage::FetchOk(_)));

            assert_eq!(session.outgoing_data_streams.len(), 1);
            let stream_id = *session.outgoing_data_streams.keys().next().unwrap();
            let written = handle.written(stream_id);
            // Fetch stream type then the fetch header's subscribe id.
            assert_eq!(written[0], 0x5);
            assert_eq!(written[1], 0);
            assert!(handle.fin_sent(stream_id));
        }

        #[test]
        fn inbound_fetch_for_unknown_track_sends_fetch_error() {
            let publisher = MockPublisher::new();
            let (mut session, handle) = server_session(publisher, 10);

            let fetch = moqt_wire::messages::control_messages::fetch::Fetch::new(
                0,
                vec!["live".to_string()],
                "video".to_string(),
                0x80,
                None,
                0,
                0,
                0,
                None,
            );
            handle.push_read(
                SERVER_CONTROL_STREAM,
                &setup_message_bytes(ControlMessage::Fetch(fetch)),
            );
            session.on_can_read(SERVER_CONTROL_STREAM);

            let sent = read_messages(handle.take_written(SERVER_CONTROL_STREAM));
            match &sent[0] {
                ControlMessage::FetchError(message) => {
                    assert_eq!(message.error_code(), SubscribeErrorCode::TrackDoesNotExist);
                }
                message => panic!("unexpected message {:?}", message),
            }
        }

        #[test]
        fn outbound_fetch_receives_objects_by_subscribe_id() {
            let (mut session, handle) = client_session(10);
            let name = test_track_name();
            let visitor = Rc::new(RefCell::new(MockVisitor::default()));

            assert!(session.fetch(&name, 0, 0, 1, None, Some(visitor.clone())));
            let sent = read_messages(handle.take_written(CLIENT_CONTROL_STREAM));
            assert!(matches!(sent[0], ControlMessage::Fetch(_)));

            // A fetch stream carries the subscribe id where subscribe
            // streams carry the track alias.
            let mut buf = write_variable_integer(u8::from(DataStreamType::FetchHeader) as u64);
            moqt_wire::messages::data_streams::fetch_stream::Header::new(0).packetize(&mut buf);
            moqt_wire::messages::data_streams::fetch_stream::Object::new(
                0, 0, 0, 0x80, None, b"past".to_vec(),
            )
            .unwrap()
            .packetize(&mut buf);
            handle.seed_incoming_uni(11);
            handle.push_read(11, &buf);
            session.on_incoming_unidirectional_stream_available();

            let objects = &visitor.borrow().objects;
            assert_eq!(objects.len(), 1);
            assert_eq!(objects[0].2, b"past");
        }
    }
}

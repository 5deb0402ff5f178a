use bytes::BytesMut;

use moqt_wire::{
    constants::{SessionErrorCode, SubscribeDoneCode, SubscribeErrorCode},
    messages::control_messages::{
        announce::Announce,
        announce_error::AnnounceError,
        announce_ok::AnnounceOk,
        client_setup::ClientSetup,
        fetch::Fetch,
        fetch_error::FetchError,
        fetch_ok::FetchOk,
        max_subscribe_id::MaxSubscribeId,
        server_setup::ServerSetup,
        setup_parameters::{RoleCase, SetupParameter},
        subscribe::Subscribe,
        subscribe_error::SubscribeError,
        subscribe_ok::SubscribeOk,
        subscribe_update::SubscribeUpdate,
    },
    models::sequence::FullSequence,
};

use crate::{
    config::Perspective,
    parsers::control_message::{try_read_message, ControlMessage, ControlMessageProcessResult},
    published_fetch::PublishedFetch,
    published_subscription::PublishedSubscription,
    publisher::publisher_has_data,
    session::{fetch_send_order, MOQTSession},
    transport::{ReadChunk, StreamId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    Initial,
    AwaitingPeerSetup,
    Established,
    Terminated,
}

/// The bidirectional control stream of one session.
pub struct ControlStream {
    stream_id: StreamId,
    setup_state: SetupState,
    buffer: BytesMut,
}

impl ControlStream {
    pub fn new(stream_id: StreamId) -> Self {
        ControlStream {
            stream_id,
            setup_state: SetupState::Initial,
            buffer: BytesMut::new(),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn setup_state(&self) -> SetupState {
        self.setup_state
    }

    pub fn set_setup_state(&mut self, setup_state: SetupState) {
        self.setup_state = setup_state;
    }
}

impl MOQTSession {
    pub(crate) fn process_control_stream(&mut self) {
        let mut fin_received = false;
        {
            let Some(control_stream) = self.control_stream.as_mut() else {
                return;
            };
            let stream_id = control_stream.stream_id;
            let Some(stream) = self.transport.stream(stream_id) else {
                return;
            };
            loop {
                match stream.read_chunk() {
                    ReadChunk::Data(data) => control_stream.buffer.extend_from_slice(&data),
                    ReadChunk::Fin => {
                        fin_received = true;
                        break;
                    }
                    ReadChunk::Blocked => break,
                }
            }
        }

        loop {
            if self.error.is_some() {
                return;
            }
            let result = {
                let Some(control_stream) = self.control_stream.as_mut() else {
                    return;
                };
                try_read_message(&mut control_stream.buffer)
            };
            match result {
                ControlMessageProcessResult::Success(message) => {
                    self.process_control_message(message);
                }
                ControlMessageProcessResult::Continue => break,
                ControlMessageProcessResult::Failure(code, reason) => {
                    self.error(code, &format!("Parse error: {}", reason));
                    return;
                }
            }
        }

        if fin_received {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "Control stream closed by peer",
            );
        }
    }

    fn process_control_message(&mut self, message: ControlMessage) {
        let setup_state = match &self.control_stream {
            Some(control_stream) => control_stream.setup_state,
            None => return,
        };
        if setup_state == SetupState::Terminated {
            return;
        }
        match message {
            ControlMessage::ClientSetup(message) => self.process_client_setup(message),
            ControlMessage::ServerSetup(message) => self.process_server_setup(message),
            message => {
                if setup_state != SetupState::Established {
                    self.error(
                        SessionErrorCode::ProtocolViolation,
                        "Received control message before setup",
                    );
                    return;
                }
                match message {
                    ControlMessage::Subscribe(message) => self.process_subscribe(message),
                    ControlMessage::SubscribeOk(message) => self.process_subscribe_ok(message),
                    ControlMessage::SubscribeError(message) => {
                        self.process_subscribe_error(message)
                    }
                    ControlMessage::SubscribeUpdate(message) => {
                        self.process_subscribe_update(message)
                    }
                    ControlMessage::SubscribeDone(message) => {
                        self.process_subscribe_done(message.subscribe_id())
                    }
                    ControlMessage::Unsubscribe(message) => {
                        self.subscribe_is_done(
                            message.subscribe_id(),
                            SubscribeDoneCode::Unsubscribed,
                            "",
                        );
                    }
                    ControlMessage::Announce(message) => self.process_announce(message),
                    ControlMessage::AnnounceOk(message) => self.process_announce_ok(message),
                    ControlMessage::AnnounceError(message) => {
                        self.process_announce_error(message)
                    }
                    ControlMessage::MaxSubscribeId(message) => {
                        self.process_max_subscribe_id(message)
                    }
                    ControlMessage::Fetch(message) => self.process_fetch(message),
                    ControlMessage::FetchOk(message) => self.process_fetch_ok(message),
                    ControlMessage::FetchError(message) => self.process_fetch_error(message),
                    ControlMessage::ClientSetup(_) | ControlMessage::ServerSetup(_) => {
                        unreachable!()
                    }
                }
            }
        }
    }

    fn process_client_setup(&mut self, message: ClientSetup) {
        if self.config.perspective == Perspective::Client {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "Received CLIENT_SETUP from server",
            );
            return;
        }
        let setup_state = self.control_stream.as_ref().unwrap().setup_state;
        if setup_state != SetupState::Initial {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "Received the SETUP message twice",
            );
            return;
        }
        if !message.supported_versions().contains(&self.config.version) {
            self.error(
                SessionErrorCode::ProtocolViolation,
                &format!("Version mismatch: expected {:#x}", self.config.version),
            );
            return;
        }
        let (peer_role, peer_max_subscribe_id, supports_object_ack) =
            extract_setup_parameters(message.setup_parameters());
        self.peer_supports_object_ack = supports_object_ack;
        tracing::debug!("Received the SETUP message");

        let mut setup_parameters = vec![
            SetupParameter::Role(RoleCase::PubSub),
            SetupParameter::MaxSubscribeId(self.config.max_subscribe_id),
        ];
        if self.config.support_object_acks {
            setup_parameters.push(SetupParameter::SupportObjectAcks(true));
        }
        let response = ServerSetup::new(self.config.version, setup_parameters);
        self.send_control_message(ControlMessage::ServerSetup(response));
        tracing::debug!("Sent the SETUP message");

        if let Some(max_subscribe_id) = peer_max_subscribe_id {
            self.peer_max_subscribe_id = max_subscribe_id;
        }
        // The peer role must be in place before the established callback
        // runs; applications may announce or fetch from inside it.
        self.peer_role = Some(peer_role.unwrap_or(RoleCase::PubSub));
        self.control_stream
            .as_mut()
            .unwrap()
            .set_setup_state(SetupState::Established);
        if let Some(callback) = self.callbacks.session_established.take() {
            callback();
        }
    }

    fn process_server_setup(&mut self, message: ServerSetup) {
        if self.config.perspective == Perspective::Server {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "Received SERVER_SETUP from client",
            );
            return;
        }
        let setup_state = self.control_stream.as_ref().unwrap().setup_state;
        if setup_state != SetupState::AwaitingPeerSetup {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "Received the SETUP message twice",
            );
            return;
        }
        if message.selected_version() != self.config.version {
            self.error(
                SessionErrorCode::ProtocolViolation,
                &format!("Version mismatch: expected {:#x}", self.config.version),
            );
            return;
        }
        let (peer_role, peer_max_subscribe_id, supports_object_ack) =
            extract_setup_parameters(message.setup_parameters());
        self.peer_supports_object_ack = supports_object_ack;
        tracing::debug!("Received the SETUP message");

        if let Some(max_subscribe_id) = peer_max_subscribe_id {
            self.peer_max_subscribe_id = max_subscribe_id;
        }
        // The peer role must be in place before the established callback
        // runs; applications may announce or fetch from inside it.
        self.peer_role = Some(peer_role.unwrap_or(RoleCase::PubSub));
        self.control_stream
            .as_mut()
            .unwrap()
            .set_setup_state(SetupState::Established);
        if let Some(callback) = self.callbacks.session_established.take() {
            callback();
        }
    }

    fn send_subscribe_error(
        &mut self,
        message: &Subscribe,
        error_code: SubscribeErrorCode,
        reason_phrase: &str,
    ) {
        let subscribe_error = SubscribeError::new(
            message.subscribe_id(),
            error_code,
            reason_phrase.to_string(),
            message.track_alias(),
        );
        self.send_control_message(ControlMessage::SubscribeError(subscribe_error));
    }

    fn send_fetch_error(
        &mut self,
        subscribe_id: u64,
        error_code: SubscribeErrorCode,
        reason_phrase: &str,
    ) {
        let fetch_error =
            FetchError::new(subscribe_id, error_code, reason_phrase.to_string());
        self.send_control_message(ControlMessage::FetchError(fetch_error));
    }

    fn process_subscribe(&mut self, message: Subscribe) {
        if !self.validate_subscribe_id(message.subscribe_id()) {
            return;
        }
        let track_name = message.full_track_name();
        tracing::debug!("Received a SUBSCRIBE for {}", track_name);

        let track_publisher = match self.publisher.get_track(&track_name) {
            Ok(track_publisher) => track_publisher,
            Err(err) => {
                tracing::debug!(
                    "SUBSCRIBE for {} rejected by the application: {}",
                    track_name,
                    err
                );
                self.send_subscribe_error(
                    &message,
                    SubscribeErrorCode::TrackDoesNotExist,
                    &err.to_string(),
                );
                return;
            }
        };
        let largest_id = if publisher_has_data(track_publisher.as_ref()) {
            Some(track_publisher.largest_sequence())
        } else {
            None
        };
        if let (Some(start_group), Some(largest_id)) = (message.start_group(), largest_id) {
            if start_group < largest_id.group_id {
                self.send_subscribe_error(
                    &message,
                    SubscribeErrorCode::InvalidRange,
                    "SUBSCRIBE starts in previous group",
                );
                return;
            }
        }
        let delivery_order = track_publisher.delivery_order();

        if self.subscribed_track_names.contains_key(&track_name) {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "Duplicate subscribe for track",
            );
            return;
        }
        if self
            .published_subscriptions
            .contains_key(&message.subscribe_id())
        {
            self.send_subscribe_error(
                &message,
                SubscribeErrorCode::InternalError,
                "Duplicate subscribe ID",
            );
            return;
        }
        let subscription = PublishedSubscription::new(&message, track_publisher);
        let subscribe_id = message.subscribe_id();
        self.published_subscriptions
            .insert(subscribe_id, subscription);
        self.subscribed_track_names
            .insert(track_name, subscribe_id);

        let subscribe_ok = SubscribeOk::new(subscribe_id, 0, delivery_order, largest_id);
        self.send_control_message(ControlMessage::SubscribeOk(subscribe_ok));

        if largest_id.is_some() {
            self.backfill_subscription(subscribe_id);
        }
    }

    fn backfill_subscription(&mut self, subscribe_id: u64) {
        let candidates = match self.published_subscriptions.get(&subscribe_id) {
            Some(subscription) => subscription.backfill_candidates(),
            None => return,
        };
        for sequence in candidates {
            self.subscription_on_new_object(subscribe_id, sequence);
        }
    }

    fn process_subscribe_ok(&mut self, message: SubscribeOk) {
        if self.upstream_fetches.contains_key(&message.subscribe_id()) {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "Received SUBSCRIBE_OK for a FETCH",
            );
            return;
        }
        let Some(&track_alias) = self.upstream_by_id.get(&message.subscribe_id()) else {
            // Subscription state might have been torn down for internal
            // reasons.
            tracing::debug!(
                "Received the SUBSCRIBE_OK for subscribe_id = {} but no track exists",
                message.subscribe_id()
            );
            return;
        };
        let Some(track) = self.subscribe_by_alias.get_mut(&track_alias) else {
            return;
        };
        tracing::debug!(
            "Received the SUBSCRIBE_OK for subscribe_id = {} {}",
            message.subscribe_id(),
            track.track().full_track_name()
        );
        track.track_mut().on_object_or_ok();
        // The expires field is not handled yet.
        let track_name = track.track().full_track_name().clone();
        let visitor = track.visitor();
        if let Some(visitor) = visitor {
            visitor
                .borrow_mut()
                .on_reply(&track_name, message.largest_id(), None);
        }
    }

    fn process_subscribe_error(&mut self, message: SubscribeError) {
        if self.upstream_fetches.contains_key(&message.subscribe_id()) {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "Received SUBSCRIBE_ERROR for a FETCH",
            );
            return;
        }
        let Some(&track_alias) = self.upstream_by_id.get(&message.subscribe_id()) else {
            tracing::debug!(
                "Received the SUBSCRIBE_ERROR for subscribe_id = {} but no track exists",
                message.subscribe_id()
            );
            return;
        };
        let error_allowed = self
            .subscribe_by_alias
            .get(&track_alias)
            .map(|track| track.track().error_is_allowed())
            .unwrap_or(false);
        if !error_allowed {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "Received SUBSCRIBE_ERROR after SUBSCRIBE_OK or objects",
            );
            return;
        }
        tracing::debug!(
            "Received the SUBSCRIBE_ERROR for subscribe_id = {}, error = {:?} ({})",
            message.subscribe_id(),
            message.error_code(),
            message.reason_phrase()
        );
        let track = self.subscribe_by_alias.remove(&track_alias).unwrap();
        self.upstream_by_id.remove(&message.subscribe_id());
        self.upstream_by_name
            .remove(track.track().full_track_name());
        if message.error_code() == SubscribeErrorCode::RetryTrackAlias {
            // Automatically resubscribe with the alias the peer proposed.
            let subscribe = track.subscribe().clone();
            self.subscribe(subscribe, track.visitor(), Some(message.track_alias()));
        } else if let Some(visitor) = track.visitor() {
            visitor.borrow_mut().on_reply(
                track.track().full_track_name(),
                None,
                Some(message.reason_phrase()),
            );
        }
    }

    fn process_subscribe_update(&mut self, message: SubscribeUpdate) {
        let Some(subscription) = self
            .published_subscriptions
            .get_mut(&message.subscribe_id())
        else {
            return;
        };
        let start = FullSequence::new(message.start_group(), 0, message.start_object());
        let end = message
            .end_group()
            .map(|end_group| {
                FullSequence::new(end_group, 0, message.end_object().unwrap_or(u64::MAX))
            });
        let update = subscription.update(start, end, message.subscriber_priority());
        if let Some((old_send_order, new_send_order)) = update {
            self.queued_streams
                .update(message.subscribe_id(), old_send_order, new_send_order);
        }
    }

    // SUBSCRIBE_DONE from the publisher ends the upstream subscription.
    fn process_subscribe_done(&mut self, subscribe_id: u64) {
        let Some(&track_alias) = self.upstream_by_id.get(&subscribe_id) else {
            return;
        };
        let Some(track) = self.subscribe_by_alias.remove(&track_alias) else {
            return;
        };
        tracing::debug!(
            "Received the SUBSCRIBE_DONE for {}",
            track.track().full_track_name()
        );
        self.upstream_by_id.remove(&subscribe_id);
        self.upstream_by_name
            .remove(track.track().full_track_name());
    }

    fn process_announce(&mut self, message: Announce) {
        if self.peer_role == Some(RoleCase::Subscriber) {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "Received ANNOUNCE from Subscriber",
            );
            return;
        }
        let error = (self.callbacks.incoming_announce)(message.track_namespace());
        match error {
            Some((error_code, reason_phrase)) => {
                let reply = AnnounceError::new(
                    message.track_namespace().clone(),
                    error_code,
                    reason_phrase,
                );
                self.send_control_message(ControlMessage::AnnounceError(reply));
            }
            None => {
                let reply = AnnounceOk::new(message.track_namespace().clone());
                self.send_control_message(ControlMessage::AnnounceOk(reply));
            }
        }
    }

    fn process_announce_ok(&mut self, message: AnnounceOk) {
        match self
            .pending_outgoing_announces
            .remove(message.track_namespace())
        {
            Some(callback) => callback(message.track_namespace(), None),
            None => {
                self.error(
                    SessionErrorCode::ProtocolViolation,
                    "Received ANNOUNCE_OK for nonexistent announce",
                );
            }
        }
    }

    fn process_announce_error(&mut self, message: AnnounceError) {
        match self
            .pending_outgoing_announces
            .remove(message.track_namespace())
        {
            Some(callback) => callback(
                message.track_namespace(),
                Some((message.error_code(), message.reason_phrase().to_string())),
            ),
            None => {
                self.error(
                    SessionErrorCode::ProtocolViolation,
                    "Received ANNOUNCE_ERROR for nonexistent announce",
                );
            }
        }
    }

    fn process_max_subscribe_id(&mut self, message: MaxSubscribeId) {
        if self.peer_role == Some(RoleCase::Subscriber) {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "Received MAX_SUBSCRIBE_ID from Subscriber",
            );
            return;
        }
        if message.max_subscribe_id() < self.peer_max_subscribe_id {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "MAX_SUBSCRIBE_ID message has lower value than previous",
            );
            return;
        }
        self.peer_max_subscribe_id = message.max_subscribe_id();
    }

    fn process_fetch(&mut self, message: Fetch) {
        if !self.validate_subscribe_id(message.subscribe_id()) {
            return;
        }
        let track_name = message.full_track_name();
        tracing::debug!("Received a FETCH for {}", track_name);

        let track_publisher = match self.publisher.get_track(&track_name) {
            Ok(track_publisher) => track_publisher,
            Err(err) => {
                tracing::debug!(
                    "FETCH for {} rejected by the application: {}",
                    track_name,
                    err
                );
                self.send_fetch_error(
                    message.subscribe_id(),
                    SubscribeErrorCode::TrackDoesNotExist,
                    &err.to_string(),
                );
                return;
            }
        };
        let group_order = message
            .group_order()
            .unwrap_or_else(|| track_publisher.delivery_order());
        let fetch_task = track_publisher.fetch(
            FullSequence::new(message.start_group(), 0, message.start_object()),
            message.end_group(),
            message.end_object(),
            group_order,
        );
        if let Err((_, reason)) = fetch_task.status() {
            tracing::debug!("FETCH for {} could not initialize the task", track_name);
            self.send_fetch_error(
                message.subscribe_id(),
                SubscribeErrorCode::InvalidRange,
                &reason,
            );
            return;
        }
        let largest_id = fetch_task.largest_id();
        let publisher_priority = track_publisher.publisher_priority();
        let subscribe_id = message.subscribe_id();
        if self.incoming_fetches.contains_key(&subscribe_id) {
            self.send_fetch_error(
                subscribe_id,
                SubscribeErrorCode::InternalError,
                "Could not initialize FETCH state",
            );
            return;
        }
        self.incoming_fetches
            .insert(subscribe_id, PublishedFetch::new(subscribe_id, fetch_task));

        let fetch_ok = FetchOk::new(subscribe_id, group_order, largest_id);
        self.send_control_message(ControlMessage::FetchOk(fetch_ok));

        if !self
            .transport
            .can_open_next_outgoing_unidirectional_stream()
            || !self.open_fetch_stream(subscribe_id)
        {
            // Put the FETCH in the queue for a new stream.
            let send_order = fetch_send_order(
                message.subscriber_priority(),
                publisher_priority,
                group_order,
            );
            self.queued_streams
                .update(subscribe_id, None, Some(send_order));
        }
    }

    fn process_fetch_ok(&mut self, message: FetchOk) {
        let Some(fetch) = self.upstream_fetches.get_mut(&message.subscribe_id()) else {
            tracing::debug!(
                "Received the FETCH_OK for subscribe_id = {} but no fetch exists",
                message.subscribe_id()
            );
            return;
        };
        fetch.track_mut().on_object_or_ok();
        let track_name = fetch.track().full_track_name().clone();
        let visitor = fetch.visitor();
        if let Some(visitor) = visitor {
            visitor
                .borrow_mut()
                .on_reply(&track_name, Some(message.largest_id()), None);
        }
    }

    fn process_fetch_error(&mut self, message: FetchError) {
        let error_allowed = self
            .upstream_fetches
            .get(&message.subscribe_id())
            .map(|fetch| fetch.track().error_is_allowed())
            .unwrap_or(true);
        if !error_allowed {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "Received FETCH_ERROR after FETCH_OK or objects",
            );
            return;
        }
        let Some(fetch) = self.upstream_fetches.remove(&message.subscribe_id()) else {
            return;
        };
        if let Some(visitor) = fetch.visitor() {
            visitor.borrow_mut().on_reply(
                fetch.track().full_track_name(),
                None,
                Some(message.reason_phrase()),
            );
        }
    }
}

fn extract_setup_parameters(
    setup_parameters: &[SetupParameter],
) -> (Option<RoleCase>, Option<u64>, bool) {
    let mut role = None;
    let mut max_subscribe_id = None;
    let mut supports_object_ack = false;
    for parameter in setup_parameters {
        match parameter {
            SetupParameter::Role(value) => role = Some(*value),
            SetupParameter::MaxSubscribeId(value) => max_subscribe_id = Some(*value),
            SetupParameter::SupportObjectAcks(value) => supports_object_ack = *value,
            SetupParameter::Path(_) | SetupParameter::Unknown(_) => {}
        }
    }
    (role, max_subscribe_id, supports_object_ack)
}

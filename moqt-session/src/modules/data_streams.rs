use bytes::BytesMut;

use moqt_wire::{
    constants::{SessionErrorCode, RESET_CODE_SUBSCRIPTION_GONE},
    data_stream_type::DataStreamType,
    messages::data_streams::{fetch_stream, object_status::ObjectStatus, subgroup_stream, DataStreams},
    models::sequence::FullSequence,
    variable_integer::write_variable_integer,
};

use crate::{
    parsers::data_stream::{parse_datagram, DataStreamParser, ObjectEvent},
    priority::SEND_GROUP_ID,
    publisher::{GetNextObjectResult, TrackStatusCode},
    session::MOQTSession,
    transport::{ReadChunk, StreamId, StreamWriteOptions},
};

/// Outgoing unidirectional stream state, either serving a subscription or
/// carrying the single stream of a FETCH.
pub(crate) enum OutgoingStream {
    Subscription(OutgoingDataStream),
    Fetch(u64),
}

pub(crate) struct OutgoingDataStream {
    pub(crate) subscription_id: u64,
    pub(crate) next_object: FullSequence,
    pub(crate) stream_header_written: bool,
}

impl OutgoingDataStream {
    pub(crate) fn new(subscription_id: u64, first_object: FullSequence) -> Self {
        OutgoingDataStream {
            subscription_id,
            next_object: first_object,
            stream_header_written: false,
        }
    }
}

/// Incoming unidirectional stream state: the wire parser plus the
/// reassembly buffer for fragmented objects.
pub(crate) struct IncomingDataStream {
    pub(crate) parser: DataStreamParser,
    pub(crate) partial_object: BytesMut,
}

impl IncomingDataStream {
    pub(crate) fn new() -> Self {
        IncomingDataStream {
            parser: DataStreamParser::new(),
            partial_object: BytesMut::new(),
        }
    }
}

impl MOQTSession {
    pub fn on_datagram_received(&mut self, datagram: &[u8]) {
        if self.error.is_some() {
            return;
        }
        let (header, payload) = match parse_datagram(datagram) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.error(
                    SessionErrorCode::ProtocolViolation,
                    "Malformed datagram received",
                );
                return;
            }
        };
        tracing::trace!(
            "Received OBJECT message in datagram for track alias {} with sequence {}:{} priority {} length {}",
            header.track_alias,
            header.group_id,
            header.object_id,
            header.publisher_priority,
            payload.len()
        );
        let type_ok = match self.subscribe_by_alias.get_mut(&header.track_alias) {
            Some(track) => track
                .track_mut()
                .check_data_stream_type(DataStreamType::ObjectDatagram),
            None => return,
        };
        if !type_ok {
            self.error(
                SessionErrorCode::ProtocolViolation,
                "Received DATAGRAM for non-datagram track",
            );
            return;
        }
        let track = self.subscribe_by_alias.get_mut(&header.track_alias).unwrap();
        let sequence = FullSequence::new(header.group_id, 0, header.object_id);
        if !track.track().in_window(sequence) {
            // Not an error; a recent SUBSCRIBE_UPDATE can put us here.
            return;
        }
        track.track_mut().on_object_or_ok();
        let track_name = track.track().full_track_name().clone();
        let visitor = track.visitor();
        if let Some(visitor) = visitor {
            visitor.borrow_mut().on_object_fragment(
                &track_name,
                sequence,
                header.publisher_priority,
                header.object_status,
                &payload,
                true,
            );
        }
    }

    pub(crate) fn process_incoming_data_stream(&mut self, stream_id: StreamId) {
        let (events, parse_error, fin_received) = {
            let Some(state) = self.incoming_data_streams.get_mut(&stream_id) else {
                return;
            };
            let Some(stream) = self.transport.stream(stream_id) else {
                return;
            };
            let mut fin_received = false;
            loop {
                match stream.read_chunk() {
                    ReadChunk::Data(data) => state.parser.push(&data),
                    ReadChunk::Fin => {
                        fin_received = true;
                        break;
                    }
                    ReadChunk::Blocked => break,
                }
            }
            let (events, parse_error) = state.parser.parse();
            (events, parse_error, fin_received)
        };

        for event in events {
            if self.error.is_some() {
                return;
            }
            self.process_object_event(stream_id, event);
        }
        if let Some((code, reason)) = parse_error {
            self.error(code, &reason);
            return;
        }
        if fin_received {
            self.incoming_data_streams.remove(&stream_id);
        }
    }

    fn process_object_event(&mut self, stream_id: StreamId, event: ObjectEvent) {
        let ObjectEvent {
            header,
            payload,
            end_of_message,
        } = event;

        // Reassemble fragments unless the application asked for them.
        let (payload, end_of_message) = if self.config.deliver_partial_objects {
            (payload, end_of_message)
        } else {
            let Some(state) = self.incoming_data_streams.get_mut(&stream_id) else {
                return;
            };
            if !end_of_message {
                if state.partial_object.is_empty() {
                    state
                        .partial_object
                        .reserve(header.payload_length as usize);
                }
                state.partial_object.extend_from_slice(&payload);
                return;
            }
            if state.partial_object.is_empty() {
                (payload, true)
            } else {
                state.partial_object.extend_from_slice(&payload);
                (state.partial_object.split().freeze(), true)
            }
        };

        let sequence = FullSequence::new(header.group_id, header.subgroup_id, header.object_id);
        if header.stream_type == DataStreamType::FetchHeader {
            // The alias field of a fetch stream carries the subscribe id.
            let type_ok = match self.upstream_fetches.get_mut(&header.track_alias) {
                Some(fetch) => fetch
                    .track_mut()
                    .check_data_stream_type(header.stream_type),
                None => {
                    if let Some(stream) = self.transport.stream(stream_id) {
                        stream.send_stop_sending(RESET_CODE_SUBSCRIPTION_GONE);
                    }
                    return;
                }
            };
            if !type_ok {
                self.error(
                    SessionErrorCode::ProtocolViolation,
                    "Received object for a track with a different stream type",
                );
                return;
            }
            let fetch = self.upstream_fetches.get_mut(&header.track_alias).unwrap();
            if !fetch.track().in_window(sequence) {
                return;
            }
            fetch.track_mut().on_object_or_ok();
            let track_name = fetch.track().full_track_name().clone();
            let visitor = fetch.visitor();
            if let Some(visitor) = visitor {
                visitor.borrow_mut().on_object_fragment(
                    &track_name,
                    sequence,
                    header.publisher_priority,
                    header.object_status,
                    &payload,
                    end_of_message,
                );
            }
        } else {
            let type_ok = match self.subscribe_by_alias.get_mut(&header.track_alias) {
                Some(track) => track
                    .track_mut()
                    .check_data_stream_type(header.stream_type),
                None => {
                    // Received an object for a nonexistent track.
                    if let Some(stream) = self.transport.stream(stream_id) {
                        stream.send_stop_sending(RESET_CODE_SUBSCRIPTION_GONE);
                    }
                    return;
                }
            };
            if !type_ok {
                self.error(
                    SessionErrorCode::ProtocolViolation,
                    "Received object for a track with a different stream type",
                );
                return;
            }
            let track = self.subscribe_by_alias.get_mut(&header.track_alias).unwrap();
            if !track.track().in_window(sequence) {
                // Not an error; a recent SUBSCRIBE_UPDATE can put us here.
                return;
            }
            track.track_mut().on_object_or_ok();
            let track_name = track.track().full_track_name().clone();
            let visitor = track.visitor();
            if let Some(visitor) = visitor {
                visitor.borrow_mut().on_object_fragment(
                    &track_name,
                    sequence,
                    header.publisher_priority,
                    header.object_status,
                    &payload,
                    end_of_message,
                );
            }
        }
    }

    /// Write loop of one subscription data stream: pulls cached objects
    /// and writes them until the stream or the cache runs dry.
    pub(crate) fn outgoing_stream_send_objects(&mut self, stream_id: StreamId) {
        let subscription_id = match self.outgoing_data_streams.get(&stream_id) {
            Some(OutgoingStream::Subscription(state)) => state.subscription_id,
            _ => return,
        };
        if !self.published_subscriptions.contains_key(&subscription_id) {
            if let Some(stream) = self.transport.stream(stream_id) {
                stream.reset_with_user_code(RESET_CODE_SUBSCRIPTION_GONE);
            }
            self.outgoing_data_streams.remove(&stream_id);
            return;
        }
        let track_status = self
            .published_subscriptions
            .get(&subscription_id)
            .unwrap()
            .publisher()
            .track_status();
        if track_status == TrackStatusCode::StatusNotAvailable {
            return;
        }
        if !track_status.implies_having_data() {
            self.error(
                SessionErrorCode::InternalError,
                "Invalid track state provided by application",
            );
            return;
        }

        let mut write_failed = false;
        {
            let Some(OutgoingStream::Subscription(state)) =
                self.outgoing_data_streams.get_mut(&stream_id)
            else {
                return;
            };
            let subscription = self
                .published_subscriptions
                .get_mut(&subscription_id)
                .unwrap();
            loop {
                let Some(stream) = self.transport.stream(stream_id) else {
                    break;
                };
                if !stream.can_write() {
                    break;
                }
                let Some(object) = subscription
                    .publisher()
                    .get_cached_object(state.next_object)
                else {
                    break;
                };
                if !subscription.in_window(state.next_object) {
                    // The next object became irrelevant after a
                    // SUBSCRIBE_UPDATE; close the stream.
                    if !stream.send_fin() {
                        tracing::warn!("Writing FIN failed despite CanWrite being true");
                    }
                    break;
                }
                stream.set_priority(SEND_GROUP_ID, subscription.get_send_order(state.next_object));

                let mut buf = BytesMut::new();
                if !state.stream_header_written {
                    buf.extend(write_variable_integer(
                        u8::from(DataStreamType::SubgroupHeader) as u64,
                    ));
                    subgroup_stream::Header::new(
                        subscription.track_alias(),
                        object.sequence.group_id,
                        object.sequence.subgroup_id,
                        object.publisher_priority,
                    )
                    .packetize(&mut buf);
                }
                let status = if object.payload.is_empty() && object.status != ObjectStatus::Normal
                {
                    Some(object.status)
                } else {
                    None
                };
                let object_message = match subgroup_stream::Object::new(
                    object.sequence.object_id,
                    status,
                    object.payload.to_vec(),
                ) {
                    Ok(object_message) => object_message,
                    Err(err) => {
                        tracing::warn!("could not serialize object: {}", err);
                        break;
                    }
                };
                object_message.packetize(&mut buf);

                state.next_object.object_id = object.sequence.object_id + 1;
                let options = StreamWriteOptions {
                    send_fin: object.fin_after_this,
                    buffer_unconditionally: false,
                };
                match stream.writev(&[&buf[..]], &options) {
                    Ok(()) => {
                        state.stream_header_written = true;
                        subscription.on_object_sent(object.sequence);
                        tracing::trace!(
                            "Stream {} successfully wrote {}, fin = {}",
                            stream_id,
                            object.sequence,
                            object.fin_after_this
                        );
                    }
                    Err(err) => {
                        tracing::warn!("stream write failed: {}", err);
                        write_failed = true;
                        break;
                    }
                }
            }
        }
        if write_failed {
            self.error(SessionErrorCode::InternalError, "Data stream write error");
        }
    }

    /// Write loop of a FETCH stream: drains the pull task.
    pub(crate) fn fetch_stream_send_objects(&mut self, stream_id: StreamId, fetch_id: u64) {
        let mut write_failed = false;
        let mut reset_code = None;
        {
            let Some(fetch) = self.incoming_fetches.get_mut(&fetch_id) else {
                return;
            };
            loop {
                let Some(stream) = self.transport.stream(stream_id) else {
                    break;
                };
                if !stream.can_write() {
                    break;
                }
                let mut object = None;
                match fetch.fetch_task_mut().next_object(&mut object) {
                    GetNextObjectResult::Success => {
                        let Some(object) = object else {
                            break;
                        };
                        // Skip ObjectDoesNotExist in FETCH.
                        if object.status == ObjectStatus::DoesNotExist {
                            continue;
                        }
                        let mut buf = BytesMut::new();
                        if !fetch.stream_header_written() {
                            buf.extend(write_variable_integer(
                                u8::from(DataStreamType::FetchHeader) as u64,
                            ));
                            fetch_stream::Header::new(fetch_id).packetize(&mut buf);
                        }
                        let status =
                            if object.payload.is_empty() && object.status != ObjectStatus::Normal {
                                Some(object.status)
                            } else {
                                None
                            };
                        let object_message = match fetch_stream::Object::new(
                            object.sequence.group_id,
                            object.sequence.subgroup_id,
                            object.sequence.object_id,
                            object.publisher_priority,
                            status,
                            object.payload.to_vec(),
                        ) {
                            Ok(object_message) => object_message,
                            Err(err) => {
                                tracing::warn!("could not serialize fetch object: {}", err);
                                break;
                            }
                        };
                        object_message.packetize(&mut buf);
                        match stream.writev(&[&buf[..]], &StreamWriteOptions::default()) {
                            Ok(()) => fetch.set_stream_header_written(),
                            Err(err) => {
                                tracing::warn!("fetch stream write failed: {}", err);
                                write_failed = true;
                                break;
                            }
                        }
                    }
                    GetNextObjectResult::Pending => break,
                    GetNextObjectResult::Eof => {
                        if !stream.send_fin() {
                            tracing::debug!("Sending FIN on stream {} failed", stream_id);
                        }
                        break;
                    }
                    GetNextObjectResult::Error => {
                        let code = fetch
                            .fetch_task()
                            .status()
                            .err()
                            .map(|(code, _)| code)
                            .unwrap_or(0);
                        reset_code = Some(code);
                        break;
                    }
                }
            }
        }
        if let Some(code) = reset_code {
            if let Some(stream) = self.transport.stream(stream_id) {
                stream.reset_with_user_code(code);
            }
        }
        if write_failed {
            self.error(SessionErrorCode::InternalError, "Data stream write error");
        }
    }
}

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use anyhow::{bail, Result};
use bytes::Bytes;

use moqt_wire::{
    messages::{
        control_messages::group_order::GroupOrder, data_streams::object_status::ObjectStatus,
    },
    models::{sequence::FullSequence, track::FullTrackName},
};

use crate::{
    callbacks::RemoteTrackVisitor,
    publisher::{
        FetchTask, ForwardingPreference, GetNextObjectResult, MOQTPublisher, MOQTTrackPublisher,
        PublishedObject, TrackStatusCode,
    },
    transport::{ReadChunk, SessionTransport, StreamHandle, StreamId, StreamWriteOptions},
};

// ---------------------------------------------------------------
// Transport mock
// ---------------------------------------------------------------

#[derive(Default)]
pub(crate) struct StreamState {
    pub written: Vec<u8>,
    pub fin_sent: bool,
    pub reset_code: Option<u64>,
    pub stop_sending_code: Option<u64>,
    pub priority: Option<(u64, u64)>,
    pub can_write: bool,
    pub fail_writes: bool,
    pub read_queue: VecDeque<ReadChunk>,
}

impl StreamState {
    fn new() -> Self {
        StreamState {
            can_write: true,
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub(crate) struct SharedTransportState {
    pub streams: HashMap<StreamId, StreamState>,
    pub incoming_bidi: VecDeque<StreamId>,
    pub incoming_uni: VecDeque<StreamId>,
    pub uni_credit: usize,
    pub datagrams: Vec<Bytes>,
    pub closed: Option<(u64, String)>,
    pub close_count: usize,
    next_stream_id: StreamId,
}

pub(crate) struct MockStream {
    stream_id: StreamId,
    shared: Rc<RefCell<SharedTransportState>>,
}

impl StreamHandle for MockStream {
    fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    fn can_write(&self) -> bool {
        self.shared
            .borrow()
            .streams
            .get(&self.stream_id)
            .is_some_and(|stream| stream.can_write)
    }

    fn writev(&mut self, slices: &[&[u8]], options: &StreamWriteOptions) -> Result<()> {
        let mut shared = self.shared.borrow_mut();
        let stream = shared.streams.get_mut(&self.stream_id).unwrap();
        if stream.fail_writes {
            bail!("write failed");
        }
        for slice in slices {
            stream.written.extend_from_slice(slice);
        }
        if options.send_fin {
            stream.fin_sent = true;
        }
        Ok(())
    }

    fn send_fin(&mut self) -> bool {
        let mut shared = self.shared.borrow_mut();
        let stream = shared.streams.get_mut(&self.stream_id).unwrap();
        stream.fin_sent = true;
        true
    }

    fn reset_with_user_code(&mut self, code: u64) {
        let mut shared = self.shared.borrow_mut();
        shared.streams.get_mut(&self.stream_id).unwrap().reset_code = Some(code);
    }

    fn send_stop_sending(&mut self, code: u64) {
        let mut shared = self.shared.borrow_mut();
        shared
            .streams
            .get_mut(&self.stream_id)
            .unwrap()
            .stop_sending_code = Some(code);
    }

    fn set_priority(&mut self, send_group_id: u64, send_order: u64) {
        let mut shared = self.shared.borrow_mut();
        shared.streams.get_mut(&self.stream_id).unwrap().priority =
            Some((send_group_id, send_order));
    }

    fn read_chunk(&mut self) -> ReadChunk {
        let mut shared = self.shared.borrow_mut();
        shared
            .streams
            .get_mut(&self.stream_id)
            .and_then(|stream| stream.read_queue.pop_front())
            .unwrap_or(ReadChunk::Blocked)
    }
}

pub(crate) struct MockTransport {
    shared: Rc<RefCell<SharedTransportState>>,
    handles: HashMap<StreamId, MockStream>,
}

impl MockTransport {
    fn ensure_handle(&mut self, stream_id: StreamId) {
        let mut shared = self.shared.borrow_mut();
        shared
            .streams
            .entry(stream_id)
            .or_insert_with(StreamState::new);
        drop(shared);
        self.handles.entry(stream_id).or_insert(MockStream {
            stream_id,
            shared: self.shared.clone(),
        });
    }

    fn open_stream(&mut self) -> StreamId {
        let stream_id = {
            let mut shared = self.shared.borrow_mut();
            let stream_id = shared.next_stream_id;
            shared.next_stream_id += 4;
            stream_id
        };
        self.ensure_handle(stream_id);
        stream_id
    }
}

impl SessionTransport for MockTransport {
    fn open_outgoing_bidirectional_stream(&mut self) -> Option<StreamId> {
        Some(self.open_stream())
    }

    fn open_outgoing_unidirectional_stream(&mut self) -> Option<StreamId> {
        {
            let mut shared = self.shared.borrow_mut();
            if shared.uni_credit == 0 {
                return None;
            }
            shared.uni_credit -= 1;
        }
        Some(self.open_stream())
    }

    fn accept_incoming_bidirectional_stream(&mut self) -> Option<StreamId> {
        let stream_id = self.shared.borrow_mut().incoming_bidi.pop_front()?;
        self.ensure_handle(stream_id);
        Some(stream_id)
    }

    fn accept_incoming_unidirectional_stream(&mut self) -> Option<StreamId> {
        let stream_id = self.shared.borrow_mut().incoming_uni.pop_front()?;
        self.ensure_handle(stream_id);
        Some(stream_id)
    }

    fn can_open_next_outgoing_unidirectional_stream(&self) -> bool {
        self.shared.borrow().uni_credit > 0
    }

    fn stream(&mut self, stream_id: StreamId) -> Option<&mut dyn StreamHandle> {
        self.handles
            .get_mut(&stream_id)
            .map(|stream| stream as &mut dyn StreamHandle)
    }

    fn send_or_queue_datagram(&mut self, datagram: Bytes) {
        self.shared.borrow_mut().datagrams.push(datagram);
    }

    fn close_session(&mut self, error_code: u64, reason: &str) {
        let mut shared = self.shared.borrow_mut();
        shared.close_count += 1;
        if shared.closed.is_none() {
            shared.closed = Some((error_code, reason.to_string()));
        }
    }
}

/// Shared view of the transport kept by the test after the session takes
/// ownership of the `MockTransport` itself.
#[derive(Clone)]
pub(crate) struct MockTransportHandle {
    shared: Rc<RefCell<SharedTransportState>>,
}

impl MockTransportHandle {
    pub fn push_read(&self, stream_id: StreamId, data: &[u8]) {
        let mut shared = self.shared.borrow_mut();
        let stream = shared
            .streams
            .entry(stream_id)
            .or_insert_with(StreamState::new);
        stream
            .read_queue
            .push_back(ReadChunk::Data(Bytes::copy_from_slice(data)));
    }

    pub fn seed_incoming_bidi(&self, stream_id: StreamId) {
        self.shared.borrow_mut().incoming_bidi.push_back(stream_id);
    }

    pub fn seed_incoming_uni(&self, stream_id: StreamId) {
        self.shared.borrow_mut().incoming_uni.push_back(stream_id);
    }

    pub fn set_uni_credit(&self, credit: usize) {
        self.shared.borrow_mut().uni_credit = credit;
    }

    pub fn written(&self, stream_id: StreamId) -> Vec<u8> {
        self.shared
            .borrow()
            .streams
            .get(&stream_id)
            .map(|stream| stream.written.clone())
            .unwrap_or_default()
    }

    pub fn take_written(&self, stream_id: StreamId) -> Vec<u8> {
        let mut shared = self.shared.borrow_mut();
        shared
            .streams
            .get_mut(&stream_id)
            .map(|stream| std::mem::take(&mut stream.written))
            .unwrap_or_default()
    }

    pub fn fin_sent(&self, stream_id: StreamId) -> bool {
        self.shared
            .borrow()
            .streams
            .get(&stream_id)
            .is_some_and(|stream| stream.fin_sent)
    }

    pub fn reset_code(&self, stream_id: StreamId) -> Option<u64> {
        self.shared
            .borrow()
            .streams
            .get(&stream_id)
            .and_then(|stream| stream.reset_code)
    }

    pub fn stop_sending_code(&self, stream_id: StreamId) -> Option<u64> {
        self.shared
            .borrow()
            .streams
            .get(&stream_id)
            .and_then(|stream| stream.stop_sending_code)
    }

    pub fn priority(&self, stream_id: StreamId) -> Option<(u64, u64)> {
        self.shared
            .borrow()
            .streams
            .get(&stream_id)
            .and_then(|stream| stream.priority)
    }

    pub fn datagrams(&self) -> Vec<Bytes> {
        self.shared.borrow().datagrams.clone()
    }

    pub fn closed(&self) -> Option<(u64, String)> {
        self.shared.borrow().closed.clone()
    }

    pub fn close_count(&self) -> usize {
        self.shared.borrow().close_count
    }
}

pub(crate) fn create_mock_transport() -> (Box<MockTransport>, MockTransportHandle) {
    let shared = Rc::new(RefCell::new(SharedTransportState {
        next_stream_id: 2,
        uni_credit: 100,
        ..Default::default()
    }));
    let transport = Box::new(MockTransport {
        shared: shared.clone(),
        handles: HashMap::new(),
    });
    (transport, MockTransportHandle { shared })
}

// ---------------------------------------------------------------
// Publisher mocks
// ---------------------------------------------------------------

pub(crate) struct MockTrackPublisher {
    track_name: FullTrackName,
    status: TrackStatusCode,
    objects: Vec<PublishedObject>,
    forwarding_preference: ForwardingPreference,
    delivery_order: GroupOrder,
    publisher_priority: u8,
}

impl MockTrackPublisher {
    pub fn new(track_name: FullTrackName) -> Self {
        MockTrackPublisher {
            track_name,
            status: TrackStatusCode::InProgress,
            objects: Vec::new(),
            forwarding_preference: ForwardingPreference::Subgroup,
            delivery_order: GroupOrder::Ascending,
            publisher_priority: 0x80,
        }
    }

    pub fn with_objects(sequences: Vec<FullSequence>) -> Self {
        let mut publisher = Self::new(test_track_name());
        for sequence in sequences {
            publisher.push_object(sequence, b"payload");
        }
        publisher
    }

    pub fn push_object(&mut self, sequence: FullSequence, payload: &[u8]) {
        self.objects.push(PublishedObject {
            sequence,
            status: ObjectStatus::Normal,
            publisher_priority: self.publisher_priority,
            payload: Bytes::copy_from_slice(payload),
            fin_after_this: false,
        });
        self.objects.sort_by_key(|object| object.sequence);
    }

    pub fn set_forwarding_preference(&mut self, preference: ForwardingPreference) {
        self.forwarding_preference = preference;
    }

    pub fn set_publisher_priority(&mut self, priority: u8) {
        self.publisher_priority = priority;
        for object in &mut self.objects {
            object.publisher_priority = priority;
        }
    }
}

impl MOQTTrackPublisher for MockTrackPublisher {
    fn track_name(&self) -> &FullTrackName {
        &self.track_name
    }

    fn track_status(&self) -> TrackStatusCode {
        self.status
    }

    fn largest_sequence(&self) -> FullSequence {
        self.objects
            .iter()
            .map(|object| object.sequence)
            .max_by_key(|sequence| sequence.group_object())
            .unwrap_or_default()
    }

    fn delivery_order(&self) -> GroupOrder {
        self.delivery_order
    }

    fn publisher_priority(&self) -> u8 {
        self.publisher_priority
    }

    fn forwarding_preference(&self) -> ForwardingPreference {
        self.forwarding_preference
    }

    fn get_cached_object(&self, sequence: FullSequence) -> Option<PublishedObject> {
        self.objects
            .iter()
            .find(|object| {
                if object.sequence < sequence {
                    return false;
                }
                match self.forwarding_preference {
                    ForwardingPreference::Subgroup => {
                        object.sequence.group_id == sequence.group_id
                            && object.sequence.subgroup_id == sequence.subgroup_id
                    }
                    ForwardingPreference::Group => {
                        object.sequence.group_id == sequence.group_id
                    }
                    _ => true,
                }
            })
            .cloned()
    }

    fn cached_objects_in_range(&self, start: FullSequence, end: FullSequence) -> Vec<FullSequence> {
        self.objects
            .iter()
            .filter(|object| {
                object.sequence.group_object() >= start.group_object()
                    && object.sequence.group_object() <= end.group_object()
            })
            .map(|object| object.sequence)
            .collect()
    }

    fn fetch(
        &self,
        start: FullSequence,
        end_group: u64,
        end_object: Option<u64>,
        _order: GroupOrder,
    ) -> Box<dyn FetchTask> {
        let objects: VecDeque<PublishedObject> = self
            .objects
            .iter()
            .filter(|object| {
                object.sequence >= start
                    && (object.sequence.group_id < end_group
                        || (object.sequence.group_id == end_group
                            && object.sequence.object_id <= end_object.unwrap_or(u64::MAX)))
            })
            .cloned()
            .collect();
        Box::new(MockFetchTask {
            largest_id: self.largest_sequence(),
            objects,
            fail: None,
        })
    }
}

pub(crate) struct MockFetchTask {
    pub objects: VecDeque<PublishedObject>,
    pub largest_id: FullSequence,
    pub fail: Option<(u64, String)>,
}

impl FetchTask for MockFetchTask {
    fn next_object(&mut self, object: &mut Option<PublishedObject>) -> GetNextObjectResult {
        if self.fail.is_some() {
            return GetNextObjectResult::Error;
        }
        match self.objects.pop_front() {
            Some(next) => {
                *object = Some(next);
                GetNextObjectResult::Success
            }
            None => GetNextObjectResult::Eof,
        }
    }

    fn status(&self) -> Result<(), (u64, String)> {
        match &self.fail {
            Some(fail) => Err(fail.clone()),
            None => Ok(()),
        }
    }

    fn largest_id(&self) -> FullSequence {
        self.largest_id
    }
}

#[derive(Default)]
pub(crate) struct MockPublisher {
    tracks: RefCell<HashMap<FullTrackName, Rc<MockTrackPublisher>>>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_track(&self, publisher: MockTrackPublisher) {
        self.tracks
            .borrow_mut()
            .insert(publisher.track_name.clone(), Rc::new(publisher));
    }
}

impl MOQTPublisher for MockPublisher {
    fn get_track(&self, track_name: &FullTrackName) -> Result<Rc<dyn MOQTTrackPublisher>> {
        match self.tracks.borrow().get(track_name) {
            Some(publisher) => Ok(publisher.clone() as Rc<dyn MOQTTrackPublisher>),
            None => bail!("no track found for {}", track_name),
        }
    }
}

// ---------------------------------------------------------------
// Visitor mock
// ---------------------------------------------------------------

#[derive(Default)]
pub(crate) struct MockVisitor {
    pub replies: Vec<(FullTrackName, Option<FullSequence>, Option<String>)>,
    pub objects: Vec<(FullTrackName, FullSequence, Vec<u8>, bool)>,
}

impl RemoteTrackVisitor for MockVisitor {
    fn on_reply(
        &mut self,
        track_name: &FullTrackName,
        largest_id: Option<FullSequence>,
        error_reason: Option<&str>,
    ) {
        self.replies.push((
            track_name.clone(),
            largest_id,
            error_reason.map(|reason| reason.to_string()),
        ));
    }

    fn on_object_fragment(
        &mut self,
        track_name: &FullTrackName,
        sequence: FullSequence,
        _publisher_priority: u8,
        _status: ObjectStatus,
        payload: &[u8],
        end_of_message: bool,
    ) {
        self.objects.push((
            track_name.clone(),
            sequence,
            payload.to_vec(),
            end_of_message,
        ));
    }
}

pub(crate) fn test_track_name() -> FullTrackName {
    FullTrackName::new(vec!["live".to_string()], "video".to_string())
}

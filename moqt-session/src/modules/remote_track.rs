use std::cell::RefCell;
use std::rc::Rc;

use moqt_wire::{
    data_stream_type::DataStreamType,
    messages::control_messages::subscribe::Subscribe,
    models::{sequence::FullSequence, track::FullTrackName},
};

use crate::{callbacks::RemoteTrackVisitor, subscribe_window::SubscribeWindow};

pub type SharedRemoteTrackVisitor = Rc<RefCell<dyn RemoteTrackVisitor>>;

/// Subscriber-side state common to an outstanding SUBSCRIBE or FETCH.
#[derive(Debug)]
pub struct RemoteTrack {
    subscribe_id: u64,
    full_track_name: FullTrackName,
    window: SubscribeWindow,
    /// Locked by the first arriving object; set at creation for fetches.
    data_stream_type: Option<DataStreamType>,
    has_received_response: bool,
    is_fetch: bool,
}

impl RemoteTrack {
    pub fn new_subscribe(
        subscribe_id: u64,
        full_track_name: FullTrackName,
        window: SubscribeWindow,
    ) -> Self {
        RemoteTrack {
            subscribe_id,
            full_track_name,
            window,
            data_stream_type: None,
            has_received_response: false,
            is_fetch: false,
        }
    }

    pub fn new_fetch(
        subscribe_id: u64,
        full_track_name: FullTrackName,
        window: SubscribeWindow,
    ) -> Self {
        RemoteTrack {
            subscribe_id,
            full_track_name,
            window,
            data_stream_type: Some(DataStreamType::FetchHeader),
            has_received_response: false,
            is_fetch: true,
        }
    }

    pub fn subscribe_id(&self) -> u64 {
        self.subscribe_id
    }

    pub fn full_track_name(&self) -> &FullTrackName {
        &self.full_track_name
    }

    pub fn in_window(&self, sequence: FullSequence) -> bool {
        self.window.contains(sequence)
    }

    pub fn is_fetch(&self) -> bool {
        self.is_fetch
    }

    /// The first packet locks the stream type; every later packet must
    /// match it.
    pub fn check_data_stream_type(&mut self, stream_type: DataStreamType) -> bool {
        match self.data_stream_type {
            Some(expected) => expected == stream_type,
            None => {
                self.data_stream_type = Some(stream_type);
                true
            }
        }
    }

    pub fn on_object_or_ok(&mut self) {
        self.has_received_response = true;
    }

    /// A terminal error is only acceptable before any OBJECT or OK.
    pub fn error_is_allowed(&self) -> bool {
        !self.has_received_response
    }
}

/// Subscriber-side state of one outstanding SUBSCRIBE. The original
/// message is kept so a RetryTrackAlias error can re-issue it.
pub struct SubscribeRemoteTrack {
    track: RemoteTrack,
    track_alias: u64,
    visitor: Option<SharedRemoteTrackVisitor>,
    subscribe: Subscribe,
}

impl SubscribeRemoteTrack {
    pub fn new(
        subscribe: Subscribe,
        window: SubscribeWindow,
        visitor: Option<SharedRemoteTrackVisitor>,
    ) -> Self {
        SubscribeRemoteTrack {
            track: RemoteTrack::new_subscribe(
                subscribe.subscribe_id(),
                subscribe.full_track_name(),
                window,
            ),
            track_alias: subscribe.track_alias(),
            visitor,
            subscribe,
        }
    }

    pub fn track(&self) -> &RemoteTrack {
        &self.track
    }

    pub fn track_mut(&mut self) -> &mut RemoteTrack {
        &mut self.track
    }

    pub fn track_alias(&self) -> u64 {
        self.track_alias
    }

    pub fn visitor(&self) -> Option<SharedRemoteTrackVisitor> {
        self.visitor.clone()
    }

    pub fn subscribe(&self) -> &Subscribe {
        &self.subscribe
    }
}

/// Subscriber-side state of one outstanding FETCH.
pub struct FetchRemoteTrack {
    track: RemoteTrack,
    visitor: Option<SharedRemoteTrackVisitor>,
}

impl FetchRemoteTrack {
    pub fn new(track: RemoteTrack, visitor: Option<SharedRemoteTrackVisitor>) -> Self {
        FetchRemoteTrack { track, visitor }
    }

    pub fn track(&self) -> &RemoteTrack {
        &self.track
    }

    pub fn track_mut(&mut self) -> &mut RemoteTrack {
        &mut self.track
    }

    pub fn visitor(&self) -> Option<SharedRemoteTrackVisitor> {
        self.visitor.clone()
    }
}

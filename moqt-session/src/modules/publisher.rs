use std::rc::Rc;

use anyhow::{bail, Result};
use bytes::Bytes;

use moqt_wire::{
    messages::{control_messages::group_order::GroupOrder, data_streams::object_status::ObjectStatus},
    models::{sequence::FullSequence, track::FullTrackName},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatusCode {
    NotYetBegun,
    InProgress,
    Finished,
    DoesNotExist,
    StatusNotAvailable,
}

impl TrackStatusCode {
    pub fn implies_having_data(&self) -> bool {
        matches!(self, TrackStatusCode::InProgress | TrackStatusCode::Finished)
    }
}

/// How a track maps object sequences onto transport streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingPreference {
    Track,
    Group,
    Subgroup,
    Datagram,
}

/// One cached object as handed out by a track publisher.
#[derive(Debug, Clone)]
pub struct PublishedObject {
    pub sequence: FullSequence,
    pub status: ObjectStatus,
    pub publisher_priority: u8,
    pub payload: Bytes,
    pub fin_after_this: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetNextObjectResult {
    Success,
    Pending,
    Eof,
    Error,
}

/// Pull task constructed by a track publisher for one FETCH.
pub trait FetchTask {
    /// On `Success` the object is stored into `object`.
    fn next_object(&mut self, object: &mut Option<PublishedObject>) -> GetNextObjectResult;
    /// Error code and reason once the task has failed, also queried right
    /// after construction to reject an unsatisfiable range.
    fn status(&self) -> Result<(), (u64, String)>;
    fn largest_id(&self) -> FullSequence;
}

/// Registry of locally published tracks.
pub trait MOQTPublisher {
    fn get_track(&self, track_name: &FullTrackName) -> Result<Rc<dyn MOQTTrackPublisher>>;
}

/// One locally published track. Shared between the registry and any number
/// of subscriptions; object arrival is reported to the session facade,
/// which routes it to the subscription for this track.
pub trait MOQTTrackPublisher {
    fn track_name(&self) -> &FullTrackName;
    fn track_status(&self) -> TrackStatusCode;
    /// Only meaningful while `track_status().implies_having_data()`.
    fn largest_sequence(&self) -> FullSequence;
    fn delivery_order(&self) -> GroupOrder;
    fn publisher_priority(&self) -> u8;
    fn forwarding_preference(&self) -> ForwardingPreference;
    /// Returns the first cached object at or after `sequence` within the
    /// same stream mapping unit, if any.
    fn get_cached_object(&self, sequence: FullSequence) -> Option<PublishedObject>;
    /// Sequences of all cached objects in `[start, end]`, ascending.
    fn cached_objects_in_range(&self, start: FullSequence, end: FullSequence) -> Vec<FullSequence>;
    fn fetch(
        &self,
        start: FullSequence,
        end_group: u64,
        end_object: Option<u64>,
        order: GroupOrder,
    ) -> Box<dyn FetchTask>;
}

pub fn publisher_has_data(publisher: &dyn MOQTTrackPublisher) -> bool {
    publisher.track_status().implies_having_data()
}

/// Installed until the application provides a registry. One per session.
pub struct DefaultPublisher;

impl MOQTPublisher for DefaultPublisher {
    fn get_track(&self, _track_name: &FullTrackName) -> Result<Rc<dyn MOQTTrackPublisher>> {
        bail!("No tracks published");
    }
}

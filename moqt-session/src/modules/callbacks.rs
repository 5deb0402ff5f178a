use moqt_wire::{
    constants::AnnounceErrorCode,
    messages::data_streams::object_status::ObjectStatus,
    models::{sequence::FullSequence, track::FullTrackName},
};

pub type AnnounceErrorReason = (AnnounceErrorCode, String);

pub type SessionEstablishedCallback = Box<dyn FnOnce()>;
pub type SessionTerminatedCallback = Box<dyn FnOnce(&str)>;
/// Returning None accepts the announced namespace.
pub type IncomingAnnounceCallback = Box<dyn FnMut(&[String]) -> Option<AnnounceErrorReason>>;
/// Resolution of one outgoing ANNOUNCE; None is success.
pub type OutgoingAnnounceCallback = Box<dyn FnOnce(&[String], Option<AnnounceErrorReason>)>;

/// Application hooks for session lifecycle events.
pub struct MOQTSessionCallbacks {
    pub session_established: Option<SessionEstablishedCallback>,
    pub session_terminated: Option<SessionTerminatedCallback>,
    pub incoming_announce: IncomingAnnounceCallback,
}

impl Default for MOQTSessionCallbacks {
    fn default() -> Self {
        MOQTSessionCallbacks {
            session_established: None,
            session_terminated: None,
            incoming_announce: Box::new(|_| {
                Some((
                    AnnounceErrorCode::AnnounceNotSupported,
                    "ANNOUNCE not supported".to_string(),
                ))
            }),
        }
    }
}

/// Subscriber-side observer of one remote track.
pub trait RemoteTrackVisitor {
    /// First answer for the request: SUBSCRIBE_OK/FETCH_OK carry the
    /// publisher's largest id, errors carry a reason.
    fn on_reply(
        &mut self,
        track_name: &FullTrackName,
        largest_id: Option<FullSequence>,
        error_reason: Option<&str>,
    );
    #[allow(clippy::too_many_arguments)]
    fn on_object_fragment(
        &mut self,
        track_name: &FullTrackName,
        sequence: FullSequence,
        publisher_priority: u8,
        status: ObjectStatus,
        payload: &[u8],
        end_of_message: bool,
    );
}

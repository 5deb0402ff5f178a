use anyhow::Result;
use bytes::Bytes;

pub type StreamId = u64;

/// One readable chunk pulled off a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadChunk {
    Data(Bytes),
    Fin,
    Blocked,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamWriteOptions {
    pub send_fin: bool,
    /// Accept the write even past the flow-control budget. Control streams
    /// rely on this to preserve message ordering.
    pub buffer_unconditionally: bool,
}

/// One stream of the underlying transport, as seen by the session.
pub trait StreamHandle {
    fn stream_id(&self) -> StreamId;
    fn can_write(&self) -> bool;
    fn writev(&mut self, slices: &[&[u8]], options: &StreamWriteOptions) -> Result<()>;
    fn send_fin(&mut self) -> bool;
    fn reset_with_user_code(&mut self, code: u64);
    fn send_stop_sending(&mut self, code: u64);
    fn set_priority(&mut self, send_group_id: u64, send_order: u64);
    fn read_chunk(&mut self) -> ReadChunk;
}

/// The underlying WebTransport or raw QUIC session. The session core only
/// holds stream ids; handles are re-resolved through `stream()` on every
/// use so a stream that the transport already dropped is simply absent.
pub trait SessionTransport {
    fn open_outgoing_bidirectional_stream(&mut self) -> Option<StreamId>;
    fn open_outgoing_unidirectional_stream(&mut self) -> Option<StreamId>;
    fn accept_incoming_bidirectional_stream(&mut self) -> Option<StreamId>;
    fn accept_incoming_unidirectional_stream(&mut self) -> Option<StreamId>;
    fn can_open_next_outgoing_unidirectional_stream(&self) -> bool;
    fn stream(&mut self, stream_id: StreamId) -> Option<&mut dyn StreamHandle>;
    fn send_or_queue_datagram(&mut self, datagram: Bytes);
    fn close_session(&mut self, error_code: u64, reason: &str);
}

use anyhow::Result;
use bytes::BytesMut;

// Each control message implements this trait.
pub trait MOQTPayload {
    // Reads one message payload from the cursor. The cursor is left at an
    // arbitrary position on failure; callers that need to retry once more
    // bytes arrive must reset it themselves.
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self>
    where
        Self: Sized;
    // Writes the payload into the buffer. The message type prefix is not
    // included; framing is the sender's job.
    fn packetize(&self, buf: &mut BytesMut);
}

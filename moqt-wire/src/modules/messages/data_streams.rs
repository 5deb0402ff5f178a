pub mod datagram;
pub mod fetch_stream;
pub mod object_status;
pub mod subgroup_stream;

use anyhow::Result;
use bytes::BytesMut;

pub trait DataStreams {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self>
    where
        Self: Sized;
    fn packetize(&self, buf: &mut BytesMut);
}

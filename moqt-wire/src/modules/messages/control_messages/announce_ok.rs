use anyhow::{Context, Result};
use bytes::BytesMut;
use serde::Serialize;

use crate::{
    messages::moqt_payload::MOQTPayload,
    variable_bytes::{read_variable_bytes, write_variable_bytes},
    variable_integer::{read_variable_integer, write_variable_integer},
};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct AnnounceOk {
    track_namespace: Vec<String>,
}

impl AnnounceOk {
    pub fn new(track_namespace: Vec<String>) -> AnnounceOk {
        AnnounceOk { track_namespace }
    }

    pub fn track_namespace(&self) -> &Vec<String> {
        &self.track_namespace
    }
}

impl MOQTPayload for AnnounceOk {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let track_namespace_tuple_length =
            read_variable_integer(read_cur).context("track namespace length")?;
        let mut track_namespace: Vec<String> = Vec::new();
        for _ in 0..track_namespace_tuple_length {
            let element =
                String::from_utf8(read_variable_bytes(read_cur)?).context("track namespace")?;
            track_namespace.push(element);
        }

        Ok(AnnounceOk { track_namespace })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.track_namespace.len() as u64));
        for element in &self.track_namespace {
            buf.extend(write_variable_bytes(element.as_bytes()));
        }
    }
}

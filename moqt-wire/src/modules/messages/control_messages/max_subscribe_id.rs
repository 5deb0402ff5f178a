use anyhow::{Context, Result};
use bytes::BytesMut;
use serde::Serialize;

use crate::{
    messages::moqt_payload::MOQTPayload,
    variable_integer::{read_variable_integer, write_variable_integer},
};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MaxSubscribeId {
    max_subscribe_id: u64,
}

impl MaxSubscribeId {
    pub fn new(max_subscribe_id: u64) -> MaxSubscribeId {
        MaxSubscribeId { max_subscribe_id }
    }

    pub fn max_subscribe_id(&self) -> u64 {
        self.max_subscribe_id
    }
}

impl MOQTPayload for MaxSubscribeId {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let max_subscribe_id = read_variable_integer(read_cur).context("max subscribe id")?;

        Ok(MaxSubscribeId { max_subscribe_id })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.max_subscribe_id));
    }
}

use anyhow::{Context, Result};
use bytes::BytesMut;
use serde::Serialize;

use crate::{
    messages::moqt_payload::MOQTPayload,
    variable_integer::{read_variable_integer, write_variable_integer},
};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Unsubscribe {
    subscribe_id: u64,
}

impl Unsubscribe {
    pub fn new(subscribe_id: u64) -> Unsubscribe {
        Unsubscribe { subscribe_id }
    }

    pub fn subscribe_id(&self) -> u64 {
        self.subscribe_id
    }
}

impl MOQTPayload for Unsubscribe {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let subscribe_id = read_variable_integer(read_cur).context("subscribe id")?;

        Ok(Unsubscribe { subscribe_id })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.subscribe_id));
    }
}

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use serde::Serialize;

use crate::{
    messages::data_streams::{object_status::ObjectStatus, DataStreams},
    variable_bytes::read_fixed_length_bytes,
    variable_integer::{read_variable_integer, write_variable_integer},
};

/// Object carried in a single datagram, preceded on the wire by the
/// OBJECT_DATAGRAM type.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Object {
    track_alias: u64,
    group_id: u64,
    object_id: u64,
    publisher_priority: u8,
    object_payload_length: u64,
    object_status: Option<ObjectStatus>,
    object_payload: Vec<u8>,
}

impl Object {
    pub fn new(
        track_alias: u64,
        group_id: u64,
        object_id: u64,
        publisher_priority: u8,
        object_status: Option<ObjectStatus>,
        object_payload: Vec<u8>,
    ) -> Result<Self> {
        let object_payload_length = object_payload.len() as u64;

        if object_status.is_some() && object_payload_length != 0 {
            bail!("The Object Status field is only sent if the Object Payload Length is zero.");
        }

        Ok(Object {
            track_alias,
            group_id,
            object_id,
            publisher_priority,
            object_payload_length,
            object_status,
            object_payload,
        })
    }

    pub fn track_alias(&self) -> u64 {
        self.track_alias
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    pub fn publisher_priority(&self) -> u8 {
        self.publisher_priority
    }

    pub fn object_status(&self) -> Option<ObjectStatus> {
        self.object_status
    }

    pub fn object_payload(&self) -> &Vec<u8> {
        &self.object_payload
    }
}

impl DataStreams for Object {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let track_alias = read_variable_integer(read_cur).context("track alias")?;
        let group_id = read_variable_integer(read_cur).context("group id")?;
        let object_id = read_variable_integer(read_cur).context("object id")?;
        let publisher_priority =
            read_fixed_length_bytes(read_cur, 1).context("publisher priority")?[0];
        let object_payload_length =
            read_variable_integer(read_cur).context("object payload length")?;
        let object_status = if object_payload_length == 0 {
            let status_u64 = read_variable_integer(read_cur).context("object status")?;
            Some(ObjectStatus::try_from(status_u64 as u8).context("object status")?)
        } else {
            None
        };
        let object_payload = read_fixed_length_bytes(read_cur, object_payload_length as usize)
            .context("object payload")?;

        tracing::trace!("Depacketized Object Datagram message.");

        Ok(Object {
            track_alias,
            group_id,
            object_id,
            publisher_priority,
            object_payload_length,
            object_status,
            object_payload,
        })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.track_alias));
        buf.extend(write_variable_integer(self.group_id));
        buf.extend(write_variable_integer(self.object_id));
        buf.extend(self.publisher_priority.to_be_bytes());
        buf.extend(write_variable_integer(self.object_payload_length));
        if let Some(object_status) = self.object_status {
            buf.extend(write_variable_integer(u8::from(object_status) as u64));
        }
        buf.extend_from_slice(&self.object_payload);

        tracing::trace!("Packetized Object Datagram message.");
    }
}

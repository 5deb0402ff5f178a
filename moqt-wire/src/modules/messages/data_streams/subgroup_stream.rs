use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use serde::Serialize;

use crate::{
    messages::data_streams::{object_status::ObjectStatus, DataStreams},
    variable_bytes::read_fixed_length_bytes,
    variable_integer::{read_variable_integer, write_variable_integer},
};

/// Header sent once at the start of a subgroup data stream, after the
/// stream type. Object messages follow.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct Header {
    track_alias: u64,
    group_id: u64,
    subgroup_id: u64,
    publisher_priority: u8,
}

impl Header {
    pub fn new(track_alias: u64, group_id: u64, subgroup_id: u64, publisher_priority: u8) -> Self {
        Header {
            track_alias,
            group_id,
            subgroup_id,
            publisher_priority,
        }
    }

    pub fn track_alias(&self) -> u64 {
        self.track_alias
    }

    pub fn group_id(&self) -> u64 {
        self.group_id
    }

    pub fn subgroup_id(&self) -> u64 {
        self.subgroup_id
    }

    pub fn publisher_priority(&self) -> u8 {
        self.publisher_priority
    }
}

impl DataStreams for Header {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let track_alias = read_variable_integer(read_cur).context("track alias")?;
        let group_id = read_variable_integer(read_cur).context("group id")?;
        let subgroup_id = read_variable_integer(read_cur).context("subgroup id")?;
        let publisher_priority =
            read_fixed_length_bytes(read_cur, 1).context("publisher priority")?[0];

        tracing::trace!("Depacketized Subgroup Stream Header message.");

        Ok(Header {
            track_alias,
            group_id,
            subgroup_id,
            publisher_priority,
        })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.track_alias));
        buf.extend(write_variable_integer(self.group_id));
        buf.extend(write_variable_integer(self.subgroup_id));
        buf.extend(self.publisher_priority.to_be_bytes());

        tracing::trace!("Packetized Subgroup Stream Header message.");
    }
}

/// Object message on a subgroup data stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Object {
    object_id: u64,
    object_payload_length: u64,
    object_status: Option<ObjectStatus>,
    object_payload: Vec<u8>,
}

impl Object {
    pub fn new(
        object_id: u64,
        object_status: Option<ObjectStatus>,
        object_payload: Vec<u8>,
    ) -> Result<Self> {
        let object_payload_length = object_payload.len() as u64;

        // The status field is only sent when the payload is empty.
        if object_status.is_some() && object_payload_length != 0 {
            bail!("The Object Status field is only sent if the Object Payload Length is zero.");
        }

        Ok(Object {
            object_id,
            object_payload_length,
            object_status,
            object_payload,
        })
    }

    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    pub fn object_payload_length(&self) -> u64 {
        self.object_payload_length
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
        let object_id = read_variable_integer(read_cur).context("object id")?;
        let object_payload_length =
            read_variable_integer(read_cur).context("object payload length")?;
        let object_status = if object_payload_length == 0 {
            let status_u64 = read_variable_integer(read_cur).context("object status")?;
            Some(ObjectStatus::try_from(status_u64 as u8).context("object status")?)
        } else {
            None
        };
        let object_payload =
            read_fixed_length_bytes(read_cur, object_payload_length as usize)
                .context("object payload")?;

        tracing::trace!("Depacketized Subgroup Stream Object message.");

        Ok(Object {
            object_id,
            object_payload_length,
            object_status,
            object_payload,
        })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.object_id));
        buf.extend(write_variable_integer(self.object_payload_length));
        if let Some(object_status) = self.object_status {
            buf.extend(write_variable_integer(u8::from(object_status) as u64));
        }
        buf.extend_from_slice(&self.object_payload);

        tracing::trace!("Packetized Subgroup Stream Object message.");
    }
}

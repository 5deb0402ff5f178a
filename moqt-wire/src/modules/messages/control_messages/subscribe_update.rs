use anyhow::{Context, Result};
use bytes::BytesMut;
use serde::Serialize;

use crate::{
    messages::moqt_payload::MOQTPayload,
    variable_bytes::read_fixed_length_bytes,
    variable_integer::{read_variable_integer, write_variable_integer},
};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct SubscribeUpdate {
    subscribe_id: u64,
    start_group: u64,
    start_object: u64,
    // 0 on the wire means no end; both fields share the offset encoding.
    end_group: Option<u64>,
    end_object: Option<u64>,
    subscriber_priority: u8,
}

impl SubscribeUpdate {
    pub fn new(
        subscribe_id: u64,
        start_group: u64,
        start_object: u64,
        end_group: Option<u64>,
        end_object: Option<u64>,
        subscriber_priority: u8,
    ) -> SubscribeUpdate {
        SubscribeUpdate {
            subscribe_id,
            start_group,
            start_object,
            end_group,
            end_object,
            subscriber_priority,
        }
    }

    pub fn subscribe_id(&self) -> u64 {
        self.subscribe_id
    }

    pub fn start_group(&self) -> u64 {
        self.start_group
    }

    pub fn start_object(&self) -> u64 {
        self.start_object
    }

    pub fn end_group(&self) -> Option<u64> {
        self.end_group
    }

    pub fn end_object(&self) -> Option<u64> {
        self.end_object
    }

    pub fn subscriber_priority(&self) -> u8 {
        self.subscriber_priority
    }
}

impl MOQTPayload for SubscribeUpdate {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let subscribe_id = read_variable_integer(read_cur).context("subscribe id")?;
        let start_group = read_variable_integer(read_cur).context("start group")?;
        let start_object = read_variable_integer(read_cur).context("start object")?;
        let end_group = match read_variable_integer(read_cur).context("end group")? {
            0 => None,
            group_id => Some(group_id - 1),
        };
        let end_object = match read_variable_integer(read_cur).context("end object")? {
            0 => None,
            object_id => Some(object_id - 1),
        };
        let subscriber_priority =
            read_fixed_length_bytes(read_cur, 1).context("subscriber priority")?[0];

        tracing::trace!("Depacketized Subscribe Update message.");

        Ok(SubscribeUpdate {
            subscribe_id,
            start_group,
            start_object,
            end_group,
            end_object,
            subscriber_priority,
        })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.subscribe_id));
        buf.extend(write_variable_integer(self.start_group));
        buf.extend(write_variable_integer(self.start_object));
        buf.extend(write_variable_integer(
            self.end_group.map_or(0, |group_id| group_id + 1),
        ));
        buf.extend(write_variable_integer(
            self.end_object.map_or(0, |object_id| object_id + 1),
        ));
        buf.extend(self.subscriber_priority.to_be_bytes());

        tracing::trace!("Packetized Subscribe Update message.");
    }
}

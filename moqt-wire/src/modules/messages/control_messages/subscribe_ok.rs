use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use serde::Serialize;

use crate::{
    messages::{control_messages::group_order::GroupOrder, moqt_payload::MOQTPayload},
    models::sequence::FullSequence,
    variable_bytes::read_fixed_length_bytes,
    variable_integer::{read_variable_integer, write_variable_integer},
};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct SubscribeOk {
    subscribe_id: u64,
    expires: u64,
    group_order: GroupOrder,
    content_exists: bool,
    largest_id: Option<FullSequence>,
}

impl SubscribeOk {
    pub fn new(
        subscribe_id: u64,
        expires: u64,
        group_order: GroupOrder,
        largest_id: Option<FullSequence>,
    ) -> SubscribeOk {
        SubscribeOk {
            subscribe_id,
            expires,
            group_order,
            content_exists: largest_id.is_some(),
            largest_id,
        }
    }

    pub fn subscribe_id(&self) -> u64 {
        self.subscribe_id
    }

    pub fn expires(&self) -> u64 {
        self.expires
    }

    pub fn group_order(&self) -> GroupOrder {
        self.group_order
    }

    pub fn content_exists(&self) -> bool {
        self.content_exists
    }

    pub fn largest_id(&self) -> Option<FullSequence> {
        self.largest_id
    }
}

impl MOQTPayload for SubscribeOk {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let subscribe_id = read_variable_integer(read_cur).context("subscribe id")?;
        let expires = read_variable_integer(read_cur).context("expires")?;
        let group_order_u8 = read_fixed_length_bytes(read_cur, 1).context("group order")?[0];
        let group_order = GroupOrder::try_from(group_order_u8).context("group order")?;
        let content_exists = match read_fixed_length_bytes(read_cur, 1).context("content exists")?[0]
        {
            0 => false,
            1 => true,
            value => bail!("invalid content exists value: {}", value),
        };
        let largest_id = if content_exists {
            let group_id = read_variable_integer(read_cur).context("largest group id")?;
            let object_id = read_variable_integer(read_cur).context("largest object id")?;
            Some(FullSequence::new(group_id, 0, object_id))
        } else {
            None
        };

        tracing::trace!("Depacketized Subscribe OK message.");

        Ok(SubscribeOk {
            subscribe_id,
            expires,
            group_order,
            content_exists,
            largest_id,
        })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.subscribe_id));
        buf.extend(write_variable_integer(self.expires));
        buf.extend(u8::from(self.group_order).to_be_bytes());
        buf.extend((self.content_exists as u8).to_be_bytes());
        if let Some(largest_id) = self.largest_id {
            buf.extend(write_variable_integer(largest_id.group_id));
            buf.extend(write_variable_integer(largest_id.object_id));
        }

        tracing::trace!("Packetized Subscribe OK message.");
    }
}

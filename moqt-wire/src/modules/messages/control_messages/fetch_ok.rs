use anyhow::{Context, Result};
use bytes::BytesMut;
use serde::Serialize;

use crate::{
    messages::{control_messages::group_order::GroupOrder, moqt_payload::MOQTPayload},
    models::sequence::FullSequence,
    variable_bytes::read_fixed_length_bytes,
    variable_integer::{read_variable_integer, write_variable_integer},
};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FetchOk {
    subscribe_id: u64,
    group_order: GroupOrder,
    largest_id: FullSequence,
}

impl FetchOk {
    pub fn new(subscribe_id: u64, group_order: GroupOrder, largest_id: FullSequence) -> FetchOk {
        FetchOk {
            subscribe_id,
            group_order,
            largest_id,
        }
    }

    pub fn subscribe_id(&self) -> u64 {
        self.subscribe_id
    }

    pub fn group_order(&self) -> GroupOrder {
        self.group_order
    }

    pub fn largest_id(&self) -> FullSequence {
        self.largest_id
    }
}

impl MOQTPayload for FetchOk {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let subscribe_id = read_variable_integer(read_cur).context("subscribe id")?;
        let group_order_u8 = read_fixed_length_bytes(read_cur, 1).context("group order")?[0];
        let group_order = GroupOrder::try_from(group_order_u8).context("group order")?;
        let group_id = read_variable_integer(read_cur).context("largest group id")?;
        let object_id = read_variable_integer(read_cur).context("largest object id")?;

        Ok(FetchOk {
            subscribe_id,
            group_order,
            largest_id: FullSequence::new(group_id, 0, object_id),
        })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.subscribe_id));
        buf.extend(u8::from(self.group_order).to_be_bytes());
        buf.extend(write_variable_integer(self.largest_id.group_id));
        buf.extend(write_variable_integer(self.largest_id.object_id));
    }
}

use anyhow::{Context, Result};
use bytes::BytesMut;
use serde::Serialize;

use crate::{
    messages::{control_messages::group_order::GroupOrder, moqt_payload::MOQTPayload},
    models::track::FullTrackName,
    variable_bytes::{read_fixed_length_bytes, read_variable_bytes, write_variable_bytes},
    variable_integer::{read_variable_integer, write_variable_integer},
};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Fetch {
    subscribe_id: u64,
    track_namespace: Vec<String>,
    track_name: String,
    subscriber_priority: u8,
    group_order: Option<GroupOrder>,
    start_group: u64,
    start_object: u64,
    end_group: u64,
    end_object: Option<u64>,
}

impl Fetch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subscribe_id: u64,
        track_namespace: Vec<String>,
        track_name: String,
        subscriber_priority: u8,
        group_order: Option<GroupOrder>,
        start_group: u64,
        start_object: u64,
        end_group: u64,
        end_object: Option<u64>,
    ) -> Fetch {
        Fetch {
            subscribe_id,
            track_namespace,
            track_name,
            subscriber_priority,
            group_order,
            start_group,
            start_object,
            end_group,
            end_object,
        }
    }

    pub fn subscribe_id(&self) -> u64 {
        self.subscribe_id
    }

    pub fn track_namespace(&self) -> &Vec<String> {
        &self.track_namespace
    }

    pub fn track_name(&self) -> &str {
        &self.track_name
    }

    pub fn full_track_name(&self) -> FullTrackName {
        FullTrackName::new(self.track_namespace.clone(), self.track_name.clone())
    }

    pub fn subscriber_priority(&self) -> u8 {
        self.subscriber_priority
    }

    pub fn group_order(&self) -> Option<GroupOrder> {
        self.group_order
    }

    pub fn start_group(&self) -> u64 {
        self.start_group
    }

    pub fn start_object(&self) -> u64 {
        self.start_object
    }

    pub fn end_group(&self) -> u64 {
        self.end_group
    }

    pub fn end_object(&self) -> Option<u64> {
        self.end_object
    }
}

impl MOQTPayload for Fetch {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let subscribe_id = read_variable_integer(read_cur).context("subscribe id")?;
        let track_namespace_tuple_length =
            read_variable_integer(read_cur).context("track namespace length")?;
        let mut track_namespace: Vec<String> = Vec::new();
        for _ in 0..track_namespace_tuple_length {
            let element =
                String::from_utf8(read_variable_bytes(read_cur)?).context("track namespace")?;
            track_namespace.push(element);
        }
        let track_name =
            String::from_utf8(read_variable_bytes(read_cur)?).context("track name")?;
        let subscriber_priority =
            read_fixed_length_bytes(read_cur, 1).context("subscriber priority")?[0];
        let group_order_u8 = read_fixed_length_bytes(read_cur, 1).context("group order")?[0];
        let group_order = match group_order_u8 {
            0x0 => None,
            _ => Some(GroupOrder::try_from(group_order_u8).context("group order")?),
        };
        let start_group = read_variable_integer(read_cur).context("start group")?;
        let start_object = read_variable_integer(read_cur).context("start object")?;
        let end_group = read_variable_integer(read_cur).context("end group")?;
        let end_object = match read_variable_integer(read_cur).context("end object")? {
            0 => None,
            object_id => Some(object_id - 1),
        };

        tracing::trace!("Depacketized Fetch message.");

        Ok(Fetch {
            subscribe_id,
            track_namespace,
            track_name,
            subscriber_priority,
            group_order,
            start_group,
            start_object,
            end_group,
            end_object,
        })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.subscribe_id));
        buf.extend(write_variable_integer(self.track_namespace.len() as u64));
        for element in &self.track_namespace {
            buf.extend(write_variable_bytes(element.as_bytes()));
        }
        buf.extend(write_variable_bytes(self.track_name.as_bytes()));
        buf.extend(self.subscriber_priority.to_be_bytes());
        buf.extend(self.group_order.map_or(0u8, u8::from).to_be_bytes());
        buf.extend(write_variable_integer(self.start_group));
        buf.extend(write_variable_integer(self.start_object));
        buf.extend(write_variable_integer(self.end_group));
        buf.extend(write_variable_integer(
            self.end_object.map_or(0, |object_id| object_id + 1),
        ));

        tracing::trace!("Packetized Fetch message.");
    }
}

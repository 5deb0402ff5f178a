use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

use crate::{
    messages::{control_messages::group_order::GroupOrder, moqt_payload::MOQTPayload},
    models::track::FullTrackName,
    variable_bytes::{
        read_fixed_length_bytes, read_variable_bytes, write_variable_bytes,
    },
    variable_integer::{read_variable_integer, write_variable_integer},
};

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FilterType {
    LatestGroup = 0x1,
    LatestObject = 0x2,
    AbsoluteStart = 0x3,
    AbsoluteRange = 0x4,
}

/// Derives the filter type from which of the range fields are present.
/// Returns None for combinations that cannot be expressed on the wire.
pub fn filter_type_for(
    start_group: Option<u64>,
    start_object: Option<u64>,
    end_group: Option<u64>,
    end_object: Option<u64>,
) -> Option<FilterType> {
    if end_group.is_none() && end_object.is_some() {
        return None;
    }
    let has_start = start_group.is_some() && start_object.is_some();
    if end_group.is_some() {
        if has_start {
            return Some(FilterType::AbsoluteRange);
        }
        return None;
    }
    if has_start {
        return Some(FilterType::AbsoluteStart);
    }
    if start_group.is_none() {
        if start_object.is_none() {
            return Some(FilterType::LatestObject);
        }
        if start_object == Some(0) {
            return Some(FilterType::LatestGroup);
        }
    }
    None
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Subscribe {
    subscribe_id: u64,
    track_alias: u64,
    track_namespace: Vec<String>,
    track_name: String,
    subscriber_priority: u8,
    group_order: Option<GroupOrder>,
    filter_type: FilterType,
    start_group: Option<u64>,
    start_object: Option<u64>,
    end_group: Option<u64>,
    end_object: Option<u64>,
}

impl Subscribe {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subscribe_id: u64,
        track_alias: u64,
        track_namespace: Vec<String>,
        track_name: String,
        subscriber_priority: u8,
        group_order: Option<GroupOrder>,
        filter_type: FilterType,
        start_group: Option<u64>,
        start_object: Option<u64>,
        end_group: Option<u64>,
        end_object: Option<u64>,
    ) -> Result<Subscribe> {
        match filter_type {
            FilterType::LatestGroup | FilterType::LatestObject => {
                if start_group.is_some() || end_group.is_some() || end_object.is_some() {
                    bail!("range fields must be None for {:?}", filter_type);
                }
            }
            FilterType::AbsoluteStart => {
                if start_group.is_none() || start_object.is_none() {
                    bail!("start must be Some for AbsoluteStart");
                }
                if end_group.is_some() || end_object.is_some() {
                    bail!("end must be None for AbsoluteStart");
                }
            }
            FilterType::AbsoluteRange => {
                if start_group.is_none() || start_object.is_none() {
                    bail!("start must be Some for AbsoluteRange");
                }
                if end_group.is_none() {
                    bail!("end_group must be Some for AbsoluteRange");
                }
            }
        }

        Ok(Subscribe {
            subscribe_id,
            track_alias,
            track_namespace,
            track_name,
            subscriber_priority,
            group_order,
            filter_type,
            start_group,
            start_object,
            end_group,
            end_object,
        })
    }

    pub fn subscribe_id(&self) -> u64 {
        self.subscribe_id
    }

    pub fn set_subscribe_id(&mut self, subscribe_id: u64) {
        self.subscribe_id = subscribe_id;
    }

    pub fn track_alias(&self) -> u64 {
        self.track_alias
    }

    pub fn set_track_alias(&mut self, track_alias: u64) {
        self.track_alias = track_alias;
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

    pub fn filter_type(&self) -> FilterType {
        self.filter_type
    }

    pub fn start_group(&self) -> Option<u64> {
        self.start_group
    }

    pub fn start_object(&self) -> Option<u64> {
        self.start_object
    }

    pub fn end_group(&self) -> Option<u64> {
        self.end_group
    }

    pub fn end_object(&self) -> Option<u64> {
        self.end_object
    }
}

impl MOQTPayload for Subscribe {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let subscribe_id = read_variable_integer(read_cur).context("subscribe id")?;
        let track_alias = read_variable_integer(read_cur).context("track alias")?;
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
        // 0x0 leaves the order to the publisher. Other values outside the
        // enum are a protocol violation.
        let group_order = match group_order_u8 {
            0x0 => None,
            _ => Some(GroupOrder::try_from(group_order_u8).context("group order")?),
        };

        let filter_type_u64 = read_variable_integer(read_cur).context("filter type")?;
        let filter_type = FilterType::try_from(filter_type_u64 as u8).context("filter type")?;

        let (start_group, start_object) = match filter_type {
            FilterType::AbsoluteStart | FilterType::AbsoluteRange => (
                Some(read_variable_integer(read_cur).context("start group")?),
                Some(read_variable_integer(read_cur).context("start object")?),
            ),
            _ => (None, None),
        };
        let (end_group, end_object) = match filter_type {
            FilterType::AbsoluteRange => {
                let end_group = read_variable_integer(read_cur).context("end group")?;
                // 0 means the end of the group.
                let end_object = match read_variable_integer(read_cur).context("end object")? {
                    0 => None,
                    object_id => Some(object_id - 1),
                };
                (Some(end_group), end_object)
            }
            _ => (None, None),
        };

        tracing::trace!("Depacketized Subscribe message.");

        Ok(Subscribe {
            subscribe_id,
            track_alias,
            track_namespace,
            track_name,
            subscriber_priority,
            group_order,
            filter_type,
            start_group,
            start_object,
            end_group,
            end_object,
        })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.subscribe_id));
        buf.extend(write_variable_integer(self.track_alias));
        buf.extend(write_variable_integer(self.track_namespace.len() as u64));
        for element in &self.track_namespace {
            buf.extend(write_variable_bytes(element.as_bytes()));
        }
        buf.extend(write_variable_bytes(self.track_name.as_bytes()));
        buf.extend(self.subscriber_priority.to_be_bytes());
        buf.extend(self.group_order.map_or(0u8, u8::from).to_be_bytes());
        buf.extend(write_variable_integer(u8::from(self.filter_type) as u64));
        match self.filter_type {
            FilterType::AbsoluteStart => {
                buf.extend(write_variable_integer(self.start_group.unwrap()));
                buf.extend(write_variable_integer(self.start_object.unwrap()));
            }
            FilterType::AbsoluteRange => {
                buf.extend(write_variable_integer(self.start_group.unwrap()));
                buf.extend(write_variable_integer(self.start_object.unwrap()));
                buf.extend(write_variable_integer(self.end_group.unwrap()));
                buf.extend(write_variable_integer(
                    self.end_object.map_or(0, |object_id| object_id + 1),
                ));
            }
            _ => {}
        }

        tracing::trace!("Packetized Subscribe message.");
    }
}

use moqt_wire::messages::control_messages::group_order::GroupOrder;

pub const DEFAULT_SUBSCRIBER_PRIORITY: u8 = 0x80;

/// WebTransport send groups are not used; every stream shares one group.
pub const SEND_GROUP_ID: u64 = 0;

/// The control stream outranks every data stream.
pub const CONTROL_STREAM_SEND_ORDER: u64 = u64::MAX;

const SUBSCRIBER_PRIORITY_SHIFT: u32 = 54;
const PUBLISHER_PRIORITY_SHIFT: u32 = 46;
const GROUP_SHIFT: u32 = 26;
const SUBGROUP_SHIFT: u32 = 6;
const SEQUENCE_BITS: u32 = 20;

fn flip(bits: u32, value: u64) -> u64 {
    ((1u64 << bits) - 1) - value
}

fn only_lowest_n_bits(bits: u32, value: u64) -> u64 {
    value & ((1u64 << bits) - 1)
}

/// Composes the 64-bit send order for a data stream. Priority fields
/// dominate; within one track, ascending delivery order puts lower
/// sequences first and descending puts higher sequences first.
pub fn send_order_for_stream(
    subscriber_priority: u8,
    publisher_priority: u8,
    group_id: u64,
    subgroup_id: u64,
    delivery_order: GroupOrder,
) -> u64 {
    let track_priority = ((subscriber_priority as u64) << SUBSCRIBER_PRIORITY_SHIFT)
        | ((publisher_priority as u64) << PUBLISHER_PRIORITY_SHIFT);
    let mut group_id = only_lowest_n_bits(SEQUENCE_BITS, group_id);
    let mut subgroup_id = only_lowest_n_bits(SEQUENCE_BITS, subgroup_id);
    if delivery_order == GroupOrder::Ascending {
        group_id = flip(SEQUENCE_BITS, group_id);
        subgroup_id = flip(SEQUENCE_BITS, subgroup_id);
    }
    track_priority | (group_id << GROUP_SHIFT) | (subgroup_id << SUBGROUP_SHIFT)
}

/// Replaces the subscriber-priority bits of an existing send order. Local
/// queues store send orders with these bits zeroed so a subscriber
/// priority change does not reorder them.
pub fn update_send_order_for_subscriber_priority(send_order: u64, subscriber_priority: u8) -> u64 {
    only_lowest_n_bits(SUBSCRIBER_PRIORITY_SHIFT, send_order)
        | ((subscriber_priority as u64) << SUBSCRIBER_PRIORITY_SHIFT)
}

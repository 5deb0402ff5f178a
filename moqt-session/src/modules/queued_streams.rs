use std::collections::BTreeSet;

/// Session-global ordered set of subscriptions and fetches that have at
/// least one data stream waiting for transport stream credit. The head is
/// the entry with the highest send order.
#[derive(Debug, Default)]
pub struct SubscriptionQueue {
    entries: BTreeSet<(u64, u64)>,
}

impl SubscriptionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the entry for `subscription_id` from `old_send_order` to
    /// `new_send_order`; either side may be absent.
    pub fn update(
        &mut self,
        subscription_id: u64,
        old_send_order: Option<u64>,
        new_send_order: Option<u64>,
    ) {
        if old_send_order == new_send_order {
            return;
        }
        if let Some(send_order) = old_send_order {
            self.entries.remove(&(send_order, subscription_id));
        }
        if let Some(send_order) = new_send_order {
            self.entries.insert((send_order, subscription_id));
        }
    }

    pub fn max(&self) -> Option<(u64, u64)> {
        self.entries.iter().next_back().copied()
    }

    pub fn remove(&mut self, send_order: u64, subscription_id: u64) {
        self.entries.remove(&(send_order, subscription_id));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, send_order: u64, subscription_id: u64) -> bool {
        self.entries.contains(&(send_order, subscription_id))
    }
}

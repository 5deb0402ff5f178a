use std::collections::BTreeMap;

use anyhow::{bail, Result};

use moqt_wire::models::sequence::FullSequence;

use crate::{publisher::ForwardingPreference, transport::StreamId};

/// A sequence reduced to the part that selects its delivery unit under a
/// forwarding preference. For datagram tracks every object is its own
/// unit; they never enter a stream map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReducedSequenceIndex(u64, u64);

impl ReducedSequenceIndex {
    pub fn new(sequence: FullSequence, preference: ForwardingPreference) -> Self {
        match preference {
            ForwardingPreference::Track => ReducedSequenceIndex(0, 0),
            ForwardingPreference::Group => ReducedSequenceIndex(sequence.group_id, 0),
            ForwardingPreference::Subgroup => {
                ReducedSequenceIndex(sequence.group_id, sequence.subgroup_id)
            }
            ForwardingPreference::Datagram => {
                ReducedSequenceIndex(sequence.group_id, sequence.object_id)
            }
        }
    }
}

/// Index from stream mapping unit to the currently open outgoing stream.
#[derive(Debug)]
pub struct SendStreamMap {
    preference: ForwardingPreference,
    streams: BTreeMap<ReducedSequenceIndex, StreamId>,
}

impl SendStreamMap {
    pub fn new(preference: ForwardingPreference) -> Self {
        Self {
            preference,
            streams: BTreeMap::new(),
        }
    }

    pub fn add_stream(&mut self, sequence: FullSequence, stream_id: StreamId) -> Result<()> {
        let index = ReducedSequenceIndex::new(sequence, self.preference);
        if self.streams.contains_key(&index) {
            bail!("stream already exists for {}", sequence);
        }
        self.streams.insert(index, stream_id);
        Ok(())
    }

    pub fn stream_for_sequence(&self, sequence: FullSequence) -> Option<StreamId> {
        self.streams
            .get(&ReducedSequenceIndex::new(sequence, self.preference))
            .copied()
    }

    pub fn remove_stream(&mut self, sequence: FullSequence, stream_id: StreamId) {
        let index = ReducedSequenceIndex::new(sequence, self.preference);
        match self.streams.get(&index) {
            Some(&existing) if existing == stream_id => {
                self.streams.remove(&index);
            }
            _ => {
                tracing::warn!(
                    "attempt to remove stream {} which is not in the map",
                    stream_id
                );
            }
        }
    }

    pub fn all_streams(&self) -> Vec<StreamId> {
        self.streams.values().copied().collect()
    }

    pub fn streams_for_group(&self, group_id: u64) -> Vec<StreamId> {
        self.streams
            .range(ReducedSequenceIndex(group_id, 0)..=ReducedSequenceIndex(group_id, u64::MAX))
            .map(|(_, &stream_id)| stream_id)
            .collect()
    }
}

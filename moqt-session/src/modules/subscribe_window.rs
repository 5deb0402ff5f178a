use moqt_wire::models::sequence::FullSequence;

/// Range of objects a subscription has asked for. The end is inclusive and
/// open when absent. Containment addresses objects by (group, object);
/// subgroups do not take part in the comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeWindow {
    start: FullSequence,
    end: Option<FullSequence>,
}

impl SubscribeWindow {
    pub fn new(start: FullSequence) -> Self {
        Self { start, end: None }
    }

    pub fn new_with_end(start: FullSequence, end: FullSequence) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn start(&self) -> FullSequence {
        self.start
    }

    pub fn end(&self) -> Option<FullSequence> {
        self.end
    }

    pub fn contains(&self, sequence: FullSequence) -> bool {
        if sequence.group_object() < self.start.group_object() {
            return false;
        }
        match self.end {
            None => true,
            Some(end) => sequence.group_object() <= end.group_object(),
        }
    }

    pub fn update_start_end(&mut self, start: FullSequence, end: Option<FullSequence>) {
        self.start = start;
        self.end = end;
    }
}

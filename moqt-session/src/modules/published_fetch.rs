use crate::{publisher::FetchTask, transport::StreamId};

/// Publisher-side state for one accepted FETCH. The fetch task is pulled
/// from on stream write opportunities; all output goes onto one
/// unidirectional stream.
pub struct PublishedFetch {
    fetch_id: u64,
    fetch_task: Box<dyn FetchTask>,
    stream_id: Option<StreamId>,
    stream_header_written: bool,
}

impl PublishedFetch {
    pub fn new(fetch_id: u64, fetch_task: Box<dyn FetchTask>) -> Self {
        PublishedFetch {
            fetch_id,
            fetch_task,
            stream_id: None,
            stream_header_written: false,
        }
    }

    pub fn fetch_id(&self) -> u64 {
        self.fetch_id
    }

    pub fn fetch_task(&self) -> &dyn FetchTask {
        self.fetch_task.as_ref()
    }

    pub fn fetch_task_mut(&mut self) -> &mut dyn FetchTask {
        self.fetch_task.as_mut()
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        self.stream_id
    }

    pub fn set_stream_id(&mut self, stream_id: StreamId) {
        self.stream_id = Some(stream_id);
    }

    pub fn stream_header_written(&self) -> bool {
        self.stream_header_written
    }

    pub fn set_stream_header_written(&mut self) {
        self.stream_header_written = true;
    }
}

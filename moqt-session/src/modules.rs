pub mod callbacks;
pub mod config;
pub mod control_stream;
pub mod data_streams;
pub mod parsers;
pub mod priority;
pub mod published_fetch;
pub mod published_subscription;
pub mod publisher;
pub mod queued_streams;
pub mod remote_track;
pub mod send_stream_map;
pub mod session;
pub mod subscribe_window;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_helper;

pub mod control_message;
pub mod data_stream;

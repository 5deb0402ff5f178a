pub mod constants;
pub mod control_message_type;
pub mod data_stream_type;
pub mod messages;
pub mod models;
pub mod variable_bytes;
pub mod variable_integer;

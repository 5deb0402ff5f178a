use anyhow::{Context, Result};
use bytes::BytesMut;
use serde::Serialize;

use crate::{
    constants::SubscribeErrorCode,
    messages::moqt_payload::MOQTPayload,
    variable_bytes::{read_variable_bytes, write_variable_bytes},
    variable_integer::{read_variable_integer, write_variable_integer},
};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct SubscribeError {
    subscribe_id: u64,
    error_code: SubscribeErrorCode,
    reason_phrase: String,
    track_alias: u64,
}

impl SubscribeError {
    pub fn new(
        subscribe_id: u64,
        error_code: SubscribeErrorCode,
        reason_phrase: String,
        track_alias: u64,
    ) -> SubscribeError {
        SubscribeError {
            subscribe_id,
            error_code,
            reason_phrase,
            track_alias,
        }
    }

    pub fn subscribe_id(&self) -> u64 {
        self.subscribe_id
    }

    pub fn error_code(&self) -> SubscribeErrorCode {
        self.error_code
    }

    pub fn reason_phrase(&self) -> &str {
        &self.reason_phrase
    }

    pub fn track_alias(&self) -> u64 {
        self.track_alias
    }
}

impl MOQTPayload for SubscribeError {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let subscribe_id = read_variable_integer(read_cur).context("subscribe id")?;
        let error_code_u64 = read_variable_integer(read_cur).context("error code")?;
        let error_code = SubscribeErrorCode::try_from(error_code_u64).context("error code")?;
        let reason_phrase =
            String::from_utf8(read_variable_bytes(read_cur)?).context("reason phrase")?;
        let track_alias = read_variable_integer(read_cur).context("track alias")?;

        tracing::trace!("Depacketized Subscribe Error message.");

        Ok(SubscribeError {
            subscribe_id,
            error_code,
            reason_phrase,
            track_alias,
        })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.subscribe_id));
        buf.extend(write_variable_integer(self.error_code.into()));
        buf.extend(write_variable_bytes(self.reason_phrase.as_bytes()));
        buf.extend(write_variable_integer(self.track_alias));

        tracing::trace!("Packetized Subscribe Error message.");
    }
}

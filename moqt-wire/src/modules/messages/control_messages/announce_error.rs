use anyhow::{Context, Result};
use bytes::BytesMut;
use serde::Serialize;

use crate::{
    constants::AnnounceErrorCode,
    messages::moqt_payload::MOQTPayload,
    variable_bytes::{read_variable_bytes, write_variable_bytes},
    variable_integer::{read_variable_integer, write_variable_integer},
};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct AnnounceError {
    track_namespace: Vec<String>,
    error_code: AnnounceErrorCode,
    reason_phrase: String,
}

impl AnnounceError {
    pub fn new(
        track_namespace: Vec<String>,
        error_code: AnnounceErrorCode,
        reason_phrase: String,
    ) -> AnnounceError {
        AnnounceError {
            track_namespace,
            error_code,
            reason_phrase,
        }
    }

    pub fn track_namespace(&self) -> &Vec<String> {
        &self.track_namespace
    }

    pub fn error_code(&self) -> AnnounceErrorCode {
        self.error_code
    }

    pub fn reason_phrase(&self) -> &str {
        &self.reason_phrase
    }
}

impl MOQTPayload for AnnounceError {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let track_namespace_tuple_length =
            read_variable_integer(read_cur).context("track namespace length")?;
        let mut track_namespace: Vec<String> = Vec::new();
        for _ in 0..track_namespace_tuple_length {
            let element =
                String::from_utf8(read_variable_bytes(read_cur)?).context("track namespace")?;
            track_namespace.push(element);
        }
        let error_code_u64 = read_variable_integer(read_cur).context("error code")?;
        let error_code = AnnounceErrorCode::try_from(error_code_u64).context("error code")?;
        let reason_phrase =
            String::from_utf8(read_variable_bytes(read_cur)?).context("reason phrase")?;

        Ok(AnnounceError {
            track_namespace,
            error_code,
            reason_phrase,
        })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.track_namespace.len() as u64));
        for element in &self.track_namespace {
            buf.extend(write_variable_bytes(element.as_bytes()));
        }
        buf.extend(write_variable_integer(self.error_code.into()));
        buf.extend(write_variable_bytes(self.reason_phrase.as_bytes()));
    }
}

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use serde::Serialize;

use crate::{
    constants::SubscribeDoneCode,
    messages::moqt_payload::MOQTPayload,
    models::sequence::FullSequence,
    variable_bytes::{read_fixed_length_bytes, read_variable_bytes, write_variable_bytes},
    variable_integer::{read_variable_integer, write_variable_integer},
};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct SubscribeDone {
    subscribe_id: u64,
    status_code: SubscribeDoneCode,
    reason_phrase: String,
    content_exists: bool,
    final_id: Option<FullSequence>,
}

impl SubscribeDone {
    pub fn new(
        subscribe_id: u64,
        status_code: SubscribeDoneCode,
        reason_phrase: String,
        final_id: Option<FullSequence>,
    ) -> SubscribeDone {
        SubscribeDone {
            subscribe_id,
            status_code,
            reason_phrase,
            content_exists: final_id.is_some(),
            final_id,
        }
    }

    pub fn subscribe_id(&self) -> u64 {
        self.subscribe_id
    }

    pub fn status_code(&self) -> SubscribeDoneCode {
        self.status_code
    }

    pub fn reason_phrase(&self) -> &str {
        &self.reason_phrase
    }

    pub fn final_id(&self) -> Option<FullSequence> {
        self.final_id
    }
}

impl MOQTPayload for SubscribeDone {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let subscribe_id = read_variable_integer(read_cur).context("subscribe id")?;
        let status_code_u64 = read_variable_integer(read_cur).context("status code")?;
        let status_code = SubscribeDoneCode::try_from(status_code_u64).context("status code")?;
        let reason_phrase =
            String::from_utf8(read_variable_bytes(read_cur)?).context("reason phrase")?;
        let content_exists = match read_fixed_length_bytes(read_cur, 1).context("content exists")?[0]
        {
            0 => false,
            1 => true,
            value => bail!("invalid content exists value: {}", value),
        };
        let final_id = if content_exists {
            let group_id = read_variable_integer(read_cur).context("final group id")?;
            let object_id = read_variable_integer(read_cur).context("final object id")?;
            Some(FullSequence::new(group_id, 0, object_id))
        } else {
            None
        };

        tracing::trace!("Depacketized Subscribe Done message.");

        Ok(SubscribeDone {
            subscribe_id,
            status_code,
            reason_phrase,
            content_exists,
            final_id,
        })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.subscribe_id));
        buf.extend(write_variable_integer(self.status_code.into()));
        buf.extend(write_variable_bytes(self.reason_phrase.as_bytes()));
        buf.extend((self.content_exists as u8).to_be_bytes());
        if let Some(final_id) = self.final_id {
            buf.extend(write_variable_integer(final_id.group_id));
            buf.extend(write_variable_integer(final_id.object_id));
        }

        tracing::trace!("Packetized Subscribe Done message.");
    }
}

use std::io::Cursor;

use bytes::{Buf, BytesMut};

use moqt_wire::{
    constants::SessionErrorCode,
    control_message_type::ControlMessageType,
    messages::{
        control_messages::{
            announce::Announce, announce_error::AnnounceError, announce_ok::AnnounceOk,
            client_setup::ClientSetup, fetch::Fetch, fetch_error::FetchError, fetch_ok::FetchOk,
            max_subscribe_id::MaxSubscribeId, server_setup::ServerSetup, subscribe::Subscribe,
            subscribe_done::SubscribeDone, subscribe_error::SubscribeError,
            subscribe_ok::SubscribeOk, subscribe_update::SubscribeUpdate,
            unsubscribe::Unsubscribe,
        },
        moqt_payload::MOQTPayload,
    },
    variable_integer::read_variable_integer,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    ClientSetup(ClientSetup),
    ServerSetup(ServerSetup),
    Subscribe(Subscribe),
    SubscribeOk(SubscribeOk),
    SubscribeError(SubscribeError),
    SubscribeUpdate(SubscribeUpdate),
    SubscribeDone(SubscribeDone),
    Unsubscribe(Unsubscribe),
    Announce(Announce),
    AnnounceOk(AnnounceOk),
    AnnounceError(AnnounceError),
    MaxSubscribeId(MaxSubscribeId),
    Fetch(Fetch),
    FetchOk(FetchOk),
    FetchError(FetchError),
}

impl ControlMessage {
    pub fn message_type(&self) -> ControlMessageType {
        match self {
            ControlMessage::ClientSetup(_) => ControlMessageType::ClientSetup,
            ControlMessage::ServerSetup(_) => ControlMessageType::ServerSetup,
            ControlMessage::Subscribe(_) => ControlMessageType::Subscribe,
            ControlMessage::SubscribeOk(_) => ControlMessageType::SubscribeOk,
            ControlMessage::SubscribeError(_) => ControlMessageType::SubscribeError,
            ControlMessage::SubscribeUpdate(_) => ControlMessageType::SubscribeUpdate,
            ControlMessage::SubscribeDone(_) => ControlMessageType::SubscribeDone,
            ControlMessage::Unsubscribe(_) => ControlMessageType::UnSubscribe,
            ControlMessage::Announce(_) => ControlMessageType::Announce,
            ControlMessage::AnnounceOk(_) => ControlMessageType::AnnounceOk,
            ControlMessage::AnnounceError(_) => ControlMessageType::AnnounceError,
            ControlMessage::MaxSubscribeId(_) => ControlMessageType::MaxSubscribeId,
            ControlMessage::Fetch(_) => ControlMessageType::Fetch,
            ControlMessage::FetchOk(_) => ControlMessageType::FetchOk,
            ControlMessage::FetchError(_) => ControlMessageType::FetchError,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum ControlMessageProcessResult {
    Success(ControlMessage),
    Continue,
    Failure(SessionErrorCode, String),
}

/// Serializes a control message with its type prefix.
pub fn serialize_control_message(message: &ControlMessage) -> BytesMut {
    use moqt_wire::variable_integer::write_variable_integer;

    let mut buf = write_variable_integer(u8::from(message.message_type()) as u64);
    match message {
        ControlMessage::ClientSetup(message) => message.packetize(&mut buf),
        ControlMessage::ServerSetup(message) => message.packetize(&mut buf),
        ControlMessage::Subscribe(message) => message.packetize(&mut buf),
        ControlMessage::SubscribeOk(message) => message.packetize(&mut buf),
        ControlMessage::SubscribeError(message) => message.packetize(&mut buf),
        ControlMessage::SubscribeUpdate(message) => message.packetize(&mut buf),
        ControlMessage::SubscribeDone(message) => message.packetize(&mut buf),
        ControlMessage::Unsubscribe(message) => message.packetize(&mut buf),
        ControlMessage::Announce(message) => message.packetize(&mut buf),
        ControlMessage::AnnounceOk(message) => message.packetize(&mut buf),
        ControlMessage::AnnounceError(message) => message.packetize(&mut buf),
        ControlMessage::MaxSubscribeId(message) => message.packetize(&mut buf),
        ControlMessage::Fetch(message) => message.packetize(&mut buf),
        ControlMessage::FetchOk(message) => message.packetize(&mut buf),
        ControlMessage::FetchError(message) => message.packetize(&mut buf),
    }
    buf
}

/// Reads one control message off the front of `buf`. Leaves the buffer
/// untouched when the message is not complete yet.
pub fn try_read_message(buf: &mut BytesMut) -> ControlMessageProcessResult {
    if buf.is_empty() {
        return ControlMessageProcessResult::Continue;
    }

    let mut read_cur = Cursor::new(&buf[..]);

    let type_value = match read_variable_integer(&mut read_cur) {
        Ok(value) => value,
        Err(_) => {
            return ControlMessageProcessResult::Continue;
        }
    };
    let message_type = match ControlMessageType::try_from(type_value as u8) {
        Ok(message_type) => message_type,
        Err(_) => {
            return ControlMessageProcessResult::Failure(
                SessionErrorCode::ProtocolViolation,
                format!("Unknown message type: {:#04x}", type_value),
            );
        }
    };

    let message = match message_type {
        ControlMessageType::ClientSetup => {
            ClientSetup::depacketize(&mut read_cur).map(ControlMessage::ClientSetup)
        }
        ControlMessageType::ServerSetup => {
            ServerSetup::depacketize(&mut read_cur).map(ControlMessage::ServerSetup)
        }
        ControlMessageType::Subscribe => {
            Subscribe::depacketize(&mut read_cur).map(ControlMessage::Subscribe)
        }
        ControlMessageType::SubscribeOk => {
            SubscribeOk::depacketize(&mut read_cur).map(ControlMessage::SubscribeOk)
        }
        ControlMessageType::SubscribeError => {
            SubscribeError::depacketize(&mut read_cur).map(ControlMessage::SubscribeError)
        }
        ControlMessageType::SubscribeUpdate => {
            SubscribeUpdate::depacketize(&mut read_cur).map(ControlMessage::SubscribeUpdate)
        }
        ControlMessageType::SubscribeDone => {
            SubscribeDone::depacketize(&mut read_cur).map(ControlMessage::SubscribeDone)
        }
        ControlMessageType::UnSubscribe => {
            Unsubscribe::depacketize(&mut read_cur).map(ControlMessage::Unsubscribe)
        }
        ControlMessageType::Announce => {
            Announce::depacketize(&mut read_cur).map(ControlMessage::Announce)
        }
        ControlMessageType::AnnounceOk => {
            AnnounceOk::depacketize(&mut read_cur).map(ControlMessage::AnnounceOk)
        }
        ControlMessageType::AnnounceError => {
            AnnounceError::depacketize(&mut read_cur).map(ControlMessage::AnnounceError)
        }
        ControlMessageType::MaxSubscribeId => {
            MaxSubscribeId::depacketize(&mut read_cur).map(ControlMessage::MaxSubscribeId)
        }
        ControlMessageType::Fetch => Fetch::depacketize(&mut read_cur).map(ControlMessage::Fetch),
        ControlMessageType::FetchOk => {
            FetchOk::depacketize(&mut read_cur).map(ControlMessage::FetchOk)
        }
        ControlMessageType::FetchError => {
            FetchError::depacketize(&mut read_cur).map(ControlMessage::FetchError)
        }
    };

    match message {
        Ok(message) => {
            buf.advance(read_cur.position() as usize);
            ControlMessageProcessResult::Success(message)
        }
        Err(err) => {
            // The message has not fully arrived; wait for more bytes.
            tracing::trace!("control message incomplete: {:?}", err);
            ControlMessageProcessResult::Continue
        }
    }
}

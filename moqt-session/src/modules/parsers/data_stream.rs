use std::io::Cursor;

use anyhow::{bail, Context, Result};
use bytes::{Buf, Bytes, BytesMut};

use moqt_wire::{
    constants::SessionErrorCode,
    control_message_type::ControlMessageType,
    data_stream_type::DataStreamType,
    messages::data_streams::{datagram, object_status::ObjectStatus, subgroup_stream, DataStreams},
    variable_bytes::read_fixed_length_bytes,
    variable_integer::read_variable_integer,
};

/// Unified view of one object on a data stream or datagram. For fetch
/// streams the alias field carries the subscribe id of the FETCH.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectHeader {
    pub track_alias: u64,
    pub group_id: u64,
    pub subgroup_id: u64,
    pub object_id: u64,
    pub publisher_priority: u8,
    pub object_status: ObjectStatus,
    pub payload_length: u64,
    pub stream_type: DataStreamType,
}

/// One payload fragment of an object. `end_of_message` marks the last
/// fragment; objects that fit in the buffer produce exactly one fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEvent {
    pub header: ObjectHeader,
    pub payload: Bytes,
    pub end_of_message: bool,
}

/// Incremental parser for one incoming unidirectional data stream.
#[derive(Default)]
pub struct DataStreamParser {
    buf: BytesMut,
    stream_type: Option<DataStreamType>,
    subgroup_header: Option<subgroup_stream::Header>,
    fetch_subscribe_id: Option<u64>,
    // Object whose payload is still being received.
    current: Option<(ObjectHeader, u64)>,
}

impl DataStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn stream_type(&self) -> Option<DataStreamType> {
        self.stream_type
    }

    /// Consumes as much buffered data as possible, producing payload
    /// fragments. A returned error terminates the session.
    pub fn parse(&mut self) -> (Vec<ObjectEvent>, Option<(SessionErrorCode, String)>) {
        let mut events = Vec::new();

        loop {
            // Drain the payload of the object in progress first.
            if let Some((header, mut remaining)) = self.current.take() {
                let take = remaining.min(self.buf.len() as u64) as usize;
                if take == 0 {
                    self.current = Some((header, remaining));
                    break;
                }
                let payload = self.buf.split_to(take).freeze();
                remaining -= take as u64;
                let end_of_message = remaining == 0;
                events.push(ObjectEvent {
                    header: header.clone(),
                    payload,
                    end_of_message,
                });
                if !end_of_message {
                    self.current = Some((header, remaining));
                }
                continue;
            }

            if self.buf.is_empty() {
                break;
            }

            let stream_type = match self.stream_type {
                Some(stream_type) => stream_type,
                None => {
                    let mut read_cur = Cursor::new(&self.buf[..]);
                    let type_value = match read_variable_integer(&mut read_cur) {
                        Ok(value) => value,
                        Err(_) => break,
                    };
                    let stream_type = match DataStreamType::try_from(type_value as u8) {
                        Ok(DataStreamType::ObjectDatagram) => {
                            return (
                                events,
                                Some((
                                    SessionErrorCode::ProtocolViolation,
                                    "Received datagram header on a data stream".to_string(),
                                )),
                            );
                        }
                        Ok(stream_type) => stream_type,
                        Err(_) => {
                            let reason = if ControlMessageType::try_from(type_value as u8).is_ok() {
                                "Received a control message on a data stream".to_string()
                            } else {
                                format!("Unknown data stream type: {:#04x}", type_value)
                            };
                            return (events, Some((SessionErrorCode::ProtocolViolation, reason)));
                        }
                    };
                    self.buf.advance(read_cur.position() as usize);
                    self.stream_type = Some(stream_type);
                    continue;
                }
            };

            match stream_type {
                DataStreamType::SubgroupHeader => {
                    if self.subgroup_header.is_none() {
                        let mut read_cur = Cursor::new(&self.buf[..]);
                        match subgroup_stream::Header::depacketize(&mut read_cur) {
                            Ok(header) => {
                                self.buf.advance(read_cur.position() as usize);
                                self.subgroup_header = Some(header);
                                continue;
                            }
                            Err(_) => break,
                        }
                    }
                    match self.try_read_subgroup_object(&mut events) {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(err) => {
                            return (
                                events,
                                Some((
                                    SessionErrorCode::ProtocolViolation,
                                    format!("Parse error: {}", err),
                                )),
                            );
                        }
                    }
                }
                DataStreamType::FetchHeader => {
                    if self.fetch_subscribe_id.is_none() {
                        let mut read_cur = Cursor::new(&self.buf[..]);
                        match read_variable_integer(&mut read_cur) {
                            Ok(subscribe_id) => {
                                self.buf.advance(read_cur.position() as usize);
                                self.fetch_subscribe_id = Some(subscribe_id);
                                continue;
                            }
                            Err(_) => break,
                        }
                    }
                    match self.try_read_fetch_object(&mut events) {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(err) => {
                            return (
                                events,
                                Some((
                                    SessionErrorCode::ProtocolViolation,
                                    format!("Parse error: {}", err),
                                )),
                            );
                        }
                    }
                }
                DataStreamType::ObjectDatagram => unreachable!(),
            }
        }

        (events, None)
    }

    // Ok(true): made progress. Ok(false): need more bytes. Err: malformed.
    fn try_read_subgroup_object(&mut self, events: &mut Vec<ObjectEvent>) -> Result<bool> {
        let header = self.subgroup_header.as_ref().unwrap().clone();
        let mut read_cur = Cursor::new(&self.buf[..]);

        let object_id = match read_variable_integer(&mut read_cur) {
            Ok(value) => value,
            Err(_) => return Ok(false),
        };
        let payload_length = match read_variable_integer(&mut read_cur) {
            Ok(value) => value,
            Err(_) => return Ok(false),
        };
        let object_status = if payload_length == 0 {
            let status_value = match read_variable_integer(&mut read_cur) {
                Ok(value) => value,
                Err(_) => return Ok(false),
            };
            ObjectStatus::try_from(status_value as u8).context("object status")?
        } else {
            ObjectStatus::Normal
        };
        self.buf.advance(read_cur.position() as usize);

        let object_header = ObjectHeader {
            track_alias: header.track_alias(),
            group_id: header.group_id(),
            subgroup_id: header.subgroup_id(),
            object_id,
            publisher_priority: header.publisher_priority(),
            object_status,
            payload_length,
            stream_type: DataStreamType::SubgroupHeader,
        };
        self.start_object(object_header, payload_length, events);
        Ok(true)
    }

    fn try_read_fetch_object(&mut self, events: &mut Vec<ObjectEvent>) -> Result<bool> {
        let subscribe_id = self.fetch_subscribe_id.unwrap();
        let mut read_cur = Cursor::new(&self.buf[..]);

        let group_id = match read_variable_integer(&mut read_cur) {
            Ok(value) => value,
            Err(_) => return Ok(false),
        };
        let subgroup_id = match read_variable_integer(&mut read_cur) {
            Ok(value) => value,
            Err(_) => return Ok(false),
        };
        let object_id = match read_variable_integer(&mut read_cur) {
            Ok(value) => value,
            Err(_) => return Ok(false),
        };
        let publisher_priority = match read_fixed_length_bytes(&mut read_cur, 1) {
            Ok(value) => value[0],
            Err(_) => return Ok(false),
        };
        let payload_length = match read_variable_integer(&mut read_cur) {
            Ok(value) => value,
            Err(_) => return Ok(false),
        };
        let object_status = if payload_length == 0 {
            let status_value = match read_variable_integer(&mut read_cur) {
                Ok(value) => value,
                Err(_) => return Ok(false),
            };
            ObjectStatus::try_from(status_value as u8).context("object status")?
        } else {
            ObjectStatus::Normal
        };
        self.buf.advance(read_cur.position() as usize);

        let object_header = ObjectHeader {
            track_alias: subscribe_id,
            group_id,
            subgroup_id,
            object_id,
            publisher_priority,
            object_status,
            payload_length,
            stream_type: DataStreamType::FetchHeader,
        };
        self.start_object(object_header, payload_length, events);
        Ok(true)
    }

    fn start_object(
        &mut self,
        header: ObjectHeader,
        payload_length: u64,
        events: &mut Vec<ObjectEvent>,
    ) {
        if payload_length == 0 {
            events.push(ObjectEvent {
                header,
                payload: Bytes::new(),
                end_of_message: true,
            });
        } else {
            self.current = Some((header, payload_length));
        }
    }
}

/// Parses one datagram into its object header and payload.
pub fn parse_datagram(data: &[u8]) -> Result<(ObjectHeader, Bytes)> {
    let mut read_cur = Cursor::new(data);

    let type_value = read_variable_integer(&mut read_cur).context("datagram type")?;
    match DataStreamType::try_from(type_value as u8) {
        Ok(DataStreamType::ObjectDatagram) => {}
        _ => bail!("not an OBJECT_DATAGRAM: {:#04x}", type_value),
    }
    let object = datagram::Object::depacketize(&mut read_cur)?;

    let header = ObjectHeader {
        track_alias: object.track_alias(),
        group_id: object.group_id(),
        subgroup_id: 0,
        object_id: object.object_id(),
        publisher_priority: object.publisher_priority(),
        object_status: object.object_status().unwrap_or(ObjectStatus::Normal),
        payload_length: object.object_payload().len() as u64,
        stream_type: DataStreamType::ObjectDatagram,
    };
    Ok((header, Bytes::copy_from_slice(object.object_payload())))
}

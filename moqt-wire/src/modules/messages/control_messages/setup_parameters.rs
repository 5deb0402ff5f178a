use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

use crate::{
    variable_bytes::{read_variable_bytes, write_variable_bytes},
    variable_integer::{read_variable_integer, write_variable_integer},
};

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RoleCase {
    Publisher = 0x1,
    Subscriber = 0x2,
    PubSub = 0x3,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum SetupParameterType {
    Role = 0x0,
    Path = 0x1,
    MaxSubscribeId = 0x2,
    // Experimental object-ack extension parameter.
    SupportObjectAcks = 0xbbf1439,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum SetupParameter {
    Role(RoleCase),
    Path(String),
    MaxSubscribeId(u64),
    SupportObjectAcks(bool),
    Unknown(u64),
}

impl SetupParameter {
    pub fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let key = read_variable_integer(read_cur).context("parameter type")?;
        let value = read_variable_bytes(read_cur).context("parameter value")?;

        let parameter = match SetupParameterType::try_from(key) {
            Ok(SetupParameterType::Role) => {
                if value.len() != 1 {
                    bail!("invalid ROLE parameter length: {}", value.len());
                }
                let role = RoleCase::try_from(value[0]).context("role")?;
                SetupParameter::Role(role)
            }
            Ok(SetupParameterType::Path) => {
                let path = String::from_utf8(value).context("path")?;
                SetupParameter::Path(path)
            }
            Ok(SetupParameterType::MaxSubscribeId) => {
                let mut value_cur = std::io::Cursor::new(&value[..]);
                let max = read_variable_integer(&mut value_cur).context("max subscribe id")?;
                SetupParameter::MaxSubscribeId(max)
            }
            Ok(SetupParameterType::SupportObjectAcks) => {
                let mut value_cur = std::io::Cursor::new(&value[..]);
                let flag = read_variable_integer(&mut value_cur).context("support object acks")?;
                SetupParameter::SupportObjectAcks(flag == 1)
            }
            Err(_) => {
                tracing::warn!("unknown setup parameter {}", key);
                SetupParameter::Unknown(key)
            }
        };

        Ok(parameter)
    }

    pub fn packetize(&self, buf: &mut BytesMut) {
        match self {
            SetupParameter::Role(role) => {
                buf.extend(write_variable_integer(SetupParameterType::Role.into()));
                buf.extend(write_variable_bytes(&[(*role).into()]));
            }
            SetupParameter::Path(path) => {
                buf.extend(write_variable_integer(SetupParameterType::Path.into()));
                buf.extend(write_variable_bytes(path.as_bytes()));
            }
            SetupParameter::MaxSubscribeId(max) => {
                buf.extend(write_variable_integer(
                    SetupParameterType::MaxSubscribeId.into(),
                ));
                buf.extend(write_variable_bytes(&write_variable_integer(*max)));
            }
            SetupParameter::SupportObjectAcks(flag) => {
                buf.extend(write_variable_integer(
                    SetupParameterType::SupportObjectAcks.into(),
                ));
                buf.extend(write_variable_bytes(&write_variable_integer(*flag as u64)));
            }
            SetupParameter::Unknown(key) => {
                unreachable!("Unknown setup parameter must not be sent: {}", key);
            }
        }
    }
}

use anyhow::{Context, Result};
use bytes::BytesMut;
use serde::Serialize;

use crate::{
    messages::{control_messages::setup_parameters::SetupParameter, moqt_payload::MOQTPayload},
    variable_integer::{read_variable_integer, write_variable_integer},
};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ServerSetup {
    selected_version: u32,
    setup_parameters: Vec<SetupParameter>,
}

impl ServerSetup {
    pub fn new(selected_version: u32, setup_parameters: Vec<SetupParameter>) -> ServerSetup {
        ServerSetup {
            selected_version,
            setup_parameters,
        }
    }

    pub fn selected_version(&self) -> u32 {
        self.selected_version
    }

    pub fn setup_parameters(&self) -> &Vec<SetupParameter> {
        &self.setup_parameters
    }
}

impl MOQTPayload for ServerSetup {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let selected_version = read_variable_integer(read_cur).context("selected version")? as u32;

        let number_of_parameters =
            read_variable_integer(read_cur).context("number of parameters")?;
        let mut setup_parameters = Vec::new();
        for _ in 0..number_of_parameters {
            setup_parameters.push(SetupParameter::depacketize(read_cur)?);
        }

        tracing::trace!("Depacketized Server Setup message.");

        Ok(ServerSetup {
            selected_version,
            setup_parameters,
        })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.selected_version as u64));
        buf.extend(write_variable_integer(self.setup_parameters.len() as u64));
        for setup_parameter in &self.setup_parameters {
            setup_parameter.packetize(buf);
        }

        tracing::trace!("Packetized Server Setup message.");
    }
}

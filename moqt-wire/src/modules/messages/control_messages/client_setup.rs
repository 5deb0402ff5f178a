use anyhow::{Context, Result};
use bytes::BytesMut;
use serde::Serialize;

use crate::{
    messages::{control_messages::setup_parameters::SetupParameter, moqt_payload::MOQTPayload},
    variable_integer::{read_variable_integer, write_variable_integer},
};

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ClientSetup {
    supported_versions: Vec<u32>,
    setup_parameters: Vec<SetupParameter>,
}

impl ClientSetup {
    pub fn new(supported_versions: Vec<u32>, setup_parameters: Vec<SetupParameter>) -> ClientSetup {
        ClientSetup {
            supported_versions,
            setup_parameters,
        }
    }

    pub fn supported_versions(&self) -> &Vec<u32> {
        &self.supported_versions
    }

    pub fn setup_parameters(&self) -> &Vec<SetupParameter> {
        &self.setup_parameters
    }
}

impl MOQTPayload for ClientSetup {
    fn depacketize(read_cur: &mut std::io::Cursor<&[u8]>) -> Result<Self> {
        let number_of_supported_versions =
            read_variable_integer(read_cur).context("number of supported versions")?;
        let mut supported_versions = Vec::with_capacity(number_of_supported_versions as usize);
        for _ in 0..number_of_supported_versions {
            let version = read_variable_integer(read_cur).context("supported version")?;
            supported_versions.push(version as u32);
        }

        let number_of_parameters =
            read_variable_integer(read_cur).context("number of parameters")?;
        let mut setup_parameters = Vec::new();
        for _ in 0..number_of_parameters {
            setup_parameters.push(SetupParameter::depacketize(read_cur)?);
        }

        tracing::trace!("Depacketized Client Setup message.");

        Ok(ClientSetup {
            supported_versions,
            setup_parameters,
        })
    }

    fn packetize(&self, buf: &mut BytesMut) {
        buf.extend(write_variable_integer(self.supported_versions.len() as u64));
        for version in &self.supported_versions {
            buf.extend(write_variable_integer(*version as u64));
        }
        buf.extend(write_variable_integer(self.setup_parameters.len() as u64));
        for setup_parameter in &self.setup_parameters {
            setup_parameter.packetize(buf);
        }

        tracing::trace!("Packetized Client Setup message.");
    }
}

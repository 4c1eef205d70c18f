//! OPEN and OPENED bodies
//!
//! Both bodies are configuration text. OPEN tells the server who the client
//! is and how it wants to talk; OPENED returns the session id and, when the
//! client's configuration digest is stale, the configuration it should use.

use trap_core::{
    Configuration, Message, Operation, CONFIG_HASH, CONNECTION_TOKEN, ENDPOINT_ID,
    OPTION_AUTO_HOSTNAME, OPTION_ENABLE_COMPRESSION, OPTION_MAX_CHUNK_SIZE,
};

/// Body of a client OPEN
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenBody {
    pub endpoint_id: Option<String>,
    pub connection_token: Option<String>,
    pub max_chunk_size: Option<i32>,
    pub compression: Option<bool>,
    pub auto_hostname: Option<String>,
    pub config_hash: Option<String>,
}

impl OpenBody {
    pub fn parse(payload: &[u8]) -> Self {
        let config = Configuration::parse(&String::from_utf8_lossy(payload));
        Self {
            endpoint_id: config.option(ENDPOINT_ID).map(str::to_string),
            connection_token: config.option(CONNECTION_TOKEN).map(str::to_string),
            max_chunk_size: config
                .option(OPTION_MAX_CHUNK_SIZE)
                .and_then(|v| v.trim().parse().ok()),
            compression: config
                .option(OPTION_ENABLE_COMPRESSION)
                .map(|_| config.bool_option(OPTION_ENABLE_COMPRESSION, false)),
            auto_hostname: config.option(OPTION_AUTO_HOSTNAME).map(str::to_string),
            config_hash: config.option(CONFIG_HASH).map(str::to_string),
        }
    }

    pub fn to_configuration(&self) -> Configuration {
        let mut config = Configuration::new();
        if let Some(id) = &self.endpoint_id {
            config.set_option(ENDPOINT_ID, id);
        }
        if let Some(token) = &self.connection_token {
            config.set_option(CONNECTION_TOKEN, token);
        }
        if let Some(size) = self.max_chunk_size {
            config.set_option(OPTION_MAX_CHUNK_SIZE, size);
        }
        if let Some(compression) = self.compression {
            config.set_option(OPTION_ENABLE_COMPRESSION, compression);
        }
        if let Some(host) = &self.auto_hostname {
            config.set_option(OPTION_AUTO_HOSTNAME, host);
        }
        if let Some(hash) = &self.config_hash {
            config.set_option(CONFIG_HASH, hash);
        }
        config
    }

    pub fn to_message(&self) -> Message {
        Message::new(Operation::Open).with_payload(self.to_configuration().to_string())
    }
}

/// Body of an OPENED reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenedBody {
    pub endpoint_id: Option<String>,
    /// Client configuration to adopt, when the client's was out of date
    pub configuration: Option<Configuration>,
}

impl OpenedBody {
    pub fn parse(payload: &[u8]) -> Self {
        let mut config = Configuration::parse(&String::from_utf8_lossy(payload));
        let endpoint_id = config.remove_option(ENDPOINT_ID);
        Self {
            endpoint_id,
            configuration: (!config.is_empty()).then_some(config),
        }
    }

    pub fn to_message(&self) -> Message {
        let mut config = self.configuration.clone().unwrap_or_default();
        if let Some(id) = &self.endpoint_id {
            config.set_option(ENDPOINT_ID, id);
        }
        Message::new(Operation::Opened).with_payload(config.to_string())
    }
}

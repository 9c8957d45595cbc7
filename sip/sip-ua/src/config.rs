use media::MediaConfig;

/// Transport variant used for signaling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportType {
    #[default]
    Udp,
    Tcp,
    Mqtt,
}

/// Broker settings for [`TransportType::Mqtt`]
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
}

/// Account and stack configuration of an [`Agent`](crate::Agent)
#[derive(Clone)]
pub struct AgentConfig {
    pub username: String,
    pub password: String,
    pub display_name: Option<String>,

    /// Domain of the address-of-record (`sip:user@domain`)
    pub domain: String,
    /// Registrar host, defaults to the domain when empty
    pub registrar: String,
    pub registrar_port: u16,
    /// Requested binding lifetime in seconds
    pub register_expires: u32,

    pub transport_type: TransportType,
    /// 0 lets the OS assign the signaling port
    pub local_port: u16,

    /// Media, codec and ICE parameters passed to each call's session
    pub media: MediaConfig,

    /// Required when `transport_type` is MQTT
    pub mqtt: Option<MqttConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            display_name: None,
            domain: String::new(),
            registrar: String::new(),
            registrar_port: 5060,
            register_expires: 3600,
            transport_type: TransportType::Udp,
            local_port: 0,
            media: MediaConfig::default(),
            mqtt: None,
        }
    }
}

impl AgentConfig {
    pub(crate) fn registrar_host(&self) -> &str {
        if self.registrar.is_empty() {
            &self.domain
        } else {
            &self.registrar
        }
    }
}

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    #[serde(with = "millis")]
    pub ring_timeout: Duration,
    #[serde(with = "millis")]
    pub key_exchange_timeout: Duration,
    #[serde(with = "millis")]
    pub peer_left_grace: Duration,
    #[serde(with = "millis")]
    pub health_check_interval: Duration,
    #[serde(with = "millis")]
    pub token_refresh_margin: Duration,
    #[serde(with = "millis")]
    pub group_token_check_interval: Duration,
    #[serde(with = "millis")]
    pub group_token_refresh_threshold: Duration,
    #[serde(with = "millis")]
    pub speaking_poll_interval: Duration,
    pub incoming_queue_capacity: usize,
    pub sender_key_attempts: u32,
    #[serde(with = "millis")]
    pub sender_key_retry_step: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            key_exchange_timeout: Duration::from_secs(30),
            peer_left_grace: Duration::from_secs(5 * 60),
            health_check_interval: Duration::from_secs(30),
            token_refresh_margin: Duration::from_secs(2 * 60),
            group_token_check_interval: Duration::from_secs(60),
            group_token_refresh_threshold: Duration::from_secs(15 * 60),
            speaking_poll_interval: Duration::from_millis(500),
            incoming_queue_capacity: 3,
            sender_key_attempts: 3,
            sender_key_retry_step: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub url: String,
    pub auth_token: String,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    pub auth_close_codes: Vec<u16>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auth_token: String::new(),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            heartbeat_interval: Duration::from_secs(25),
            auth_close_codes: vec![4001, 4003, 1008],
        }
    }
}

impl TransportConfig {
    pub fn new(url: &str, auth_token: &str) -> Self {
        Self {
            url: url.to_string(),
            auth_token: auth_token.to_string(),
            ..Default::default()
        }
    }

    pub fn is_auth_rejection(&self, code: u16) -> bool {
        self.auth_close_codes.contains(&code)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

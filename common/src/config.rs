use std::net::{Ipv4Addr, SocketAddrV4};

use serde::{Deserialize, Serialize};

use crate::dns::DNS_PORT;

pub const REQUEST_BUFFER_SIZE: usize = 1024;
pub const RESPONSE_BUFFER_SIZE: usize = 1024;
pub const SSID_BUFFER_SIZE: usize = 32;
pub const PASSWORD_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub backlog: u8,
    pub poll_interval_ms: u64,
    pub idle_poll_ticks: u32,
    pub max_connections: usize,
    pub gateway: [u8; 4],
    pub netmask: [u8; 4],
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
}

fn default_dns_port() -> u16 {
    DNS_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 80,
            backlog: 1,
            poll_interval_ms: 500,
            idle_poll_ticks: 10,
            max_connections: 4,
            gateway: [192, 168, 4, 1],
            netmask: [255, 255, 255, 0],
            dns_port: default_dns_port(),
        }
    }
}

impl ServerConfig {
    pub fn sanitize(&mut self) {
        self.backlog = self.backlog.max(1);
        self.poll_interval_ms = self.poll_interval_ms.clamp(100, 5_000);
        self.idle_poll_ticks = self.idle_poll_ticks.max(1);
        self.max_connections = self.max_connections.clamp(1, 16);
        let mask = u32::from_be_bytes(self.netmask);
        if mask.leading_ones() != mask.count_ones() || !(8..=30).contains(&mask.count_ones()) {
            self.netmask = Self::default().netmask;
        }
    }

    pub fn gateway_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.gateway)
    }

    pub fn netmask_prefix(&self) -> u8 {
        u32::from_be_bytes(self.netmask).leading_ones() as u8
    }

    pub fn bind_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port)
    }

    pub fn idle_timeout_ms(&self) -> u64 {
        self.poll_interval_ms
            .saturating_mul(u64::from(self.idle_poll_ticks))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            ssid: "PICO_W_AP".to_string(),
            password: "raspberry".to_string(),
            channel: 1,
        }
    }
}

impl AccessPointConfig {
    pub fn sanitize(&mut self) {
        self.channel = self.channel.clamp(1, 13);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub access_point: AccessPointConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default = "default_led_pin")]
    pub led_pin: i32,
}

fn default_led_pin() -> i32 {
    2
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            access_point: AccessPointConfig::default(),
            network: NetworkConfig::default(),
            led_pin: default_led_pin(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.server.sanitize();
        self.access_point.sanitize();
        if self.led_pin < 0 {
            self.led_pin = default_led_pin();
        }
    }
}

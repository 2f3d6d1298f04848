use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::metadata::MediaSettings;
use crate::sdp::BandwidthCaps;
use crate::signaling::{SignalingEndpoint, TransportKind, TransportOptions};

const DEFAULT_LOG_FILTER: &str = "info,room_rtc=debug";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoomConfig {
    pub signaling: SignalingConfig,
    pub media: MediaConfig,
    pub ice_servers: Vec<String>,
    pub poll_interval_ms: u64,
    pub log_filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    pub host: String,
    pub path: String,
    pub secure: bool,
    pub secure_ports: Vec<u16>,
    pub insecure_ports: Vec<u16>,
    pub connect_timeout_ms: u64,
    pub max_reconnect_attempts: Option<u32>,
    pub transport: TransportKind,
    pub flush_interval_ms: u64,
    pub throughput_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MediaConfig {
    pub audio: bool,
    pub video: bool,
    pub stereo: bool,
    pub audio_kbps: Option<u32>,
    pub video_kbps: Option<u32>,
    pub data_kbps: Option<u32>,
    pub strip_video_codec: Option<String>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            media: MediaConfig::default(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            poll_interval_ms: 250,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            path: "signaling".to_string(),
            secure: false,
            secure_ports: vec![443, 3443],
            insecure_ports: vec![80, 3000],
            connect_timeout_ms: 20_000,
            max_reconnect_attempts: None,
            transport: TransportKind::Primary,
            flush_interval_ms: 1_000,
            throughput_cap: 16,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            stereo: false,
            audio_kbps: None,
            video_kbps: None,
            data_kbps: None,
            strip_video_codec: Some("H264".to_string()),
        }
    }
}

impl RoomConfig {
    /// Loads the optional TOML file, then applies `ROOM_RTC_*` overrides
    /// from the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var("ROOM_RTC_CONFIG") {
                Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(&path))?,
                _ => Self::default(),
            },
        };
        base.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let signaling = &mut self.signaling;
        if let Some(host) = var("ROOM_RTC_SIGNALING_HOST") {
            signaling.host = host;
        }
        if let Some(path) = var("ROOM_RTC_SIGNALING_PATH") {
            signaling.path = path;
        }
        if let Some(value) = var("ROOM_RTC_SECURE") {
            signaling.secure = parse_flag("ROOM_RTC_SECURE", &value)?;
        }
        if let Some(value) = var("ROOM_RTC_SECURE_PORTS") {
            signaling.secure_ports = parse_ports("ROOM_RTC_SECURE_PORTS", &value)?;
        }
        if let Some(value) = var("ROOM_RTC_INSECURE_PORTS") {
            signaling.insecure_ports = parse_ports("ROOM_RTC_INSECURE_PORTS", &value)?;
        }
        if let Some(value) = var("ROOM_RTC_CONNECT_TIMEOUT_MS") {
            signaling.connect_timeout_ms = parse_number("ROOM_RTC_CONNECT_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("ROOM_RTC_MAX_RECONNECT_ATTEMPTS") {
            signaling.max_reconnect_attempts =
                Some(parse_number("ROOM_RTC_MAX_RECONNECT_ATTEMPTS", &value)?);
        }
        if let Some(value) = var("ROOM_RTC_TRANSPORT") {
            signaling.transport = match value.as_str() {
                "primary" | "websocket" => TransportKind::Primary,
                "fallback" | "polling" => TransportKind::Fallback,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "ROOM_RTC_TRANSPORT",
                        value,
                    });
                }
            };
        }

        let media = &mut self.media;
        if let Some(value) = var("ROOM_RTC_STEREO") {
            media.stereo = parse_flag("ROOM_RTC_STEREO", &value)?;
        }
        if let Some(value) = var("ROOM_RTC_AUDIO_KBPS") {
            media.audio_kbps = Some(parse_number("ROOM_RTC_AUDIO_KBPS", &value)?);
        }
        if let Some(value) = var("ROOM_RTC_VIDEO_KBPS") {
            media.video_kbps = Some(parse_number("ROOM_RTC_VIDEO_KBPS", &value)?);
        }
        if let Some(value) = var("ROOM_RTC_DATA_KBPS") {
            media.data_kbps = Some(parse_number("ROOM_RTC_DATA_KBPS", &value)?);
        }
        if let Some(value) = var("ROOM_RTC_STRIP_VIDEO_CODEC") {
            media.strip_video_codec = match value.as_str() {
                "none" | "off" => None,
                _ => Some(value),
            };
        }

        if let Some(value) = var("ROOM_RTC_ICE_SERVERS") {
            self.ice_servers = value
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = var("ROOM_RTC_POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_number("ROOM_RTC_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(filter) = var("RUST_LOG") {
            self.log_filter = filter;
        }
        Ok(self)
    }

    pub fn transport_options(&self) -> TransportOptions {
        let signaling = &self.signaling;
        TransportOptions {
            endpoint: SignalingEndpoint {
                host: signaling.host.clone(),
                path: signaling.path.clone(),
                secure: signaling.secure,
                secure_ports: signaling.secure_ports.clone(),
                insecure_ports: signaling.insecure_ports.clone(),
            },
            connect_timeout: Duration::from_millis(signaling.connect_timeout_ms),
            max_reconnect_attempts: signaling.max_reconnect_attempts,
            preferred: signaling.transport,
            flush_interval: Duration::from_millis(signaling.flush_interval_ms),
            throughput_cap: signaling.throughput_cap.max(1),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl MediaConfig {
    pub fn settings(&self) -> MediaSettings {
        MediaSettings {
            audio: self.audio,
            video: self.video,
            stereo: self.stereo,
            bandwidth: BandwidthCaps {
                audio: self.audio_kbps,
                video: self.video_kbps,
                data: self.data_kbps,
            },
            strip_video_codec: self.strip_video_codec.clone(),
        }
    }
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" | "TRUE" | "yes" | "on" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_ports(key: &'static str, value: &str) -> Result<Vec<u16>, ConfigError> {
    let ports = value
        .split(',')
        .map(|port| parse_number(key, port))
        .collect::<Result<Vec<u16>, _>>()?;
    if ports.is_empty() {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        });
    }
    Ok(ports)
}

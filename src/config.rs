//! Application configuration
//!
//! Loaded from TOML. Every section falls back to defaults, so an empty file
//! (or no file at all) yields a working stereo 48kHz listener.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::audio::buffer::MAX_CAPACITY_SAMPLES;
use crate::constants::*;
use crate::error::{Error, NetworkError, SessionError};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub server: ServerConfig,
    pub status: StatusConfig,
}

impl AppConfig {
    /// Platform config location, e.g. `~/.config/aux-listener/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "aux-listener").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location when it exists.
    ///
    /// An explicit path that cannot be read is an error; a missing default
    /// file is not.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let config = match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => {
                    tracing::info!("Loading config from {}", path.display());
                    Self::from_toml_str(&std::fs::read_to_string(&path)?)?
                }
                _ => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.session.validate()?;
        Ok(())
    }
}

/// Per-session audio and lifecycle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Seconds of audio the ring holds
    pub buffered_seconds: f32,
    /// Frames per render callback when the host lets us choose
    pub render_quantum: usize,
    /// How long `start` waits for the first READY
    pub ready_timeout_secs: u64,
    /// Interval between sampled stats log lines
    pub stats_interval_secs: u64,
    /// Make one reconnect attempt when the stream drops after READY
    pub reconnect_on_loss: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            buffered_seconds: DEFAULT_BUFFERED_SECONDS,
            render_quantum: DEFAULT_RENDER_QUANTUM,
            ready_timeout_secs: 30,
            stats_interval_secs: 5,
            reconnect_on_loss: true,
        }
    }
}

impl SessionConfig {
    /// Ring capacity in samples: channels × sample rate × buffered seconds,
    /// rounded down to whole frames
    pub fn buffer_capacity(&self) -> usize {
        let frames = (self.sample_rate as f64 * self.buffered_seconds as f64) as usize;
        frames * self.channels as usize
    }

    /// Ring capacity in bytes, as carried by the INIT message
    pub fn buffer_capacity_bytes(&self) -> usize {
        self.buffer_capacity() * std::mem::size_of::<f32>()
    }

    /// Audio that must arrive before playback starts
    pub fn priming_seconds(&self) -> f64 {
        let samples_per_second = self.sample_rate as f64 * self.channels as f64;
        (self.buffer_capacity() / 2) as f64 / samples_per_second
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(SessionError::InvalidConfig(format!(
                "sample rate {} outside {}..={}",
                self.sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            )));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(SessionError::InvalidConfig(format!(
                "channel count {} outside 1..={}",
                self.channels, MAX_CHANNELS
            )));
        }
        if !(self.buffered_seconds > 0.0) {
            return Err(SessionError::InvalidConfig(
                "buffered_seconds must be positive".into(),
            ));
        }
        let capacity = self.buffer_capacity();
        if capacity < 2 * self.channels as usize || capacity > MAX_CAPACITY_SAMPLES {
            return Err(SessionError::InvalidConfig(format!(
                "buffer capacity {} samples outside 2 frames..={}",
                capacity, MAX_CAPACITY_SAMPLES
            )));
        }
        if self.render_quantum == 0 || self.render_quantum > MAX_RENDER_QUANTUM {
            return Err(SessionError::InvalidConfig(format!(
                "render quantum {} outside 1..={}",
                self.render_quantum, MAX_RENDER_QUANTUM
            )));
        }
        Ok(())
    }
}

/// Upstream stream server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `ws://` or `wss://` base, without the room path
    pub base_url: String,
    pub connect_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: format!("ws://localhost:{}", DEFAULT_SERVER_PORT),
            connect_timeout_ms: 5000,
        }
    }
}

impl ServerConfig {
    /// `{base}/{room}/users/{user}/music/listen`
    pub fn listen_url(&self, room_id: &str, user_id: &str) -> Result<Url, NetworkError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| NetworkError::InvalidUrl(e.to_string()))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(NetworkError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        url.path_segments_mut()
            .map_err(|_| NetworkError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend([room_id, "users", user_id, "music", "listen"]);

        Ok(url)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Status HTTP API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_STATUS_PORT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_capacity_matches_five_seconds_stereo() {
        let config = SessionConfig::default();
        assert_eq!(config.buffer_capacity(), 480_000);
        assert_eq!(config.buffer_capacity_bytes(), 1_920_000);
        assert!((config.priming_seconds() - 2.5).abs() < 1e-9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_capacity_rounds_to_whole_frames() {
        let config = SessionConfig {
            sample_rate: 44_100,
            channels: 2,
            buffered_seconds: 0.333,
            ..Default::default()
        };
        assert_eq!(config.buffer_capacity() % 2, 0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_channels = SessionConfig {
            channels: 0,
            ..Default::default()
        };
        assert!(zero_channels.validate().is_err());

        let negative = SessionConfig {
            buffered_seconds: -1.0,
            ..Default::default()
        };
        assert!(negative.validate().is_err());

        let huge = SessionConfig {
            buffered_seconds: 3600.0,
            ..Default::default()
        };
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [session]
            channels = 1

            [server]
            base_url = "wss://rooms.example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.session.channels, 1);
        assert_eq!(config.session.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(config.server.base_url, "wss://rooms.example.com");
        assert_eq!(config.status, StatusConfig::default());
    }

    #[test]
    fn test_load_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session]\nbuffered_seconds = 2.0").unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.session.buffer_capacity(), 192_000);

        let missing = AppConfig::load(Some(Path::new("/nonexistent/aux.toml")));
        assert!(matches!(missing, Err(Error::Io(_))));
    }

    #[test]
    fn test_listen_url() {
        let server = ServerConfig {
            base_url: "ws://localhost:8080/".to_string(),
            ..Default::default()
        };
        let url = server.listen_url("room-1", "user-9").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8080/room-1/users/user-9/music/listen");

        let http = ServerConfig {
            base_url: "http://localhost:8080".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            http.listen_url("r", "u"),
            Err(NetworkError::InvalidUrl(_))
        ));
    }
}

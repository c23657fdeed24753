use std::time::Duration;

use serde::Deserialize;

use tankfall_core::entity::SpawnPose;
use tankfall_core::frame::DEFAULT_MAX_FRAME_LEN;
use tankfall_core::net::protocol::DEFAULT_TICK_RATE_HZ;
use tankfall_core::session::SessionConfig;

/// Top-level server configuration, loaded from `tankfall.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(rename = "match")]
    pub match_rules: MatchConfig,
    pub side_channel: SideChannelConfig,
    pub external_address: ExternalAddressConfig,
    pub limits: LimitsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7777".to_string(),
            match_rules: MatchConfig::default(),
            side_channel: SideChannelConfig::default(),
            external_address: ExternalAddressConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

/// Match rules and pacing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub num_rounds_to_win: u32,
    pub start_delay_secs: f64,
    pub end_delay_secs: f64,
    pub tick_rate_hz: u32,
    pub min_participants: usize,
    pub max_participants: usize,
    /// Start a fresh match once the previous one has ended.
    pub restart_on_end: bool,
    pub spawn_points: Vec<SpawnPose>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            num_rounds_to_win: 5,
            start_delay_secs: 3.0,
            end_delay_secs: 3.0,
            tick_rate_hz: DEFAULT_TICK_RATE_HZ,
            min_participants: 2,
            max_participants: 4,
            restart_on_end: true,
            spawn_points: default_spawn_points(),
        }
    }
}

fn default_spawn_points() -> Vec<SpawnPose> {
    vec![
        SpawnPose {
            x: -20.0,
            z: -20.0,
            heading: 45.0,
        },
        SpawnPose {
            x: 20.0,
            z: 20.0,
            heading: 225.0,
        },
        SpawnPose {
            x: -20.0,
            z: 20.0,
            heading: 135.0,
        },
        SpawnPose {
            x: 20.0,
            z: -20.0,
            heading: 315.0,
        },
    ]
}

impl MatchConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            num_rounds_to_win: self.num_rounds_to_win,
            start_delay: Duration::from_secs_f64(self.start_delay_secs),
            end_delay: Duration::from_secs_f64(self.end_delay_secs),
            min_participants: self.min_participants,
            max_participants: self.max_participants,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz.max(1)))
    }

    /// Spawn point for the `id`-th admitted participant (round-robin).
    pub fn spawn_point_for(&self, id: u64) -> SpawnPose {
        if self.spawn_points.is_empty() {
            return SpawnPose::default();
        }
        let idx = (id.saturating_sub(1) as usize) % self.spawn_points.len();
        self.spawn_points[idx]
    }
}

/// Per-participant side channel listeners.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SideChannelConfig {
    /// Participant `k` listens on `base_port + k`.
    pub base_port: u16,
    pub bind_host: String,
    pub accept_timeout_ms: u64,
    /// An accepted peer that sends nothing for this long is dropped and the
    /// listener re-armed.
    pub idle_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for SideChannelConfig {
    fn default() -> Self {
        Self {
            base_port: 11000,
            bind_host: "127.0.0.1".to_string(),
            accept_timeout_ms: 1000,
            idle_timeout_ms: 30_000,
            write_timeout_ms: 5000,
            backoff_initial_ms: 50,
            backoff_max_ms: 5000,
            max_frame_bytes: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl SideChannelConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// How the externally reachable host is discovered at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExternalAddressConfig {
    /// Skip the lookup and advertise this host verbatim.
    pub advertised_host: Option<String>,
    pub lookup_url: String,
    pub lookup_timeout_ms: u64,
}

impl Default for ExternalAddressConfig {
    fn default() -> Self {
        Self {
            advertised_host: None,
            lookup_url: "http://icanhazip.com".to_string(),
            lookup_timeout_ms: 3000,
        }
    }
}

/// Infrastructure limits (buffer sizes, rate limits).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub broadcast_capacity: usize,
    pub player_message_buffer: usize,
    /// Queue depth in front of the coordinator task.
    pub command_buffer: usize,
    pub input_rate_limit_per_sec: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
            player_message_buffer: 256,
            command_buffer: 1024,
            input_rate_limit_per_sec: 60.0,
        }
    }
}

impl ServerConfig {
    /// Validate configuration, logging warnings for issues.
    pub fn validate(&self) {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            tracing::error!(
                addr = %self.listen_addr,
                "listen_addr is not a valid socket address"
            );
            std::process::exit(1);
        }
        if let Err(reason) = self.check() {
            tracing::error!("{reason}");
            std::process::exit(1);
        }
        if self.match_rules.spawn_points.len() < self.match_rules.max_participants {
            tracing::warn!(
                spawn_points = self.match_rules.spawn_points.len(),
                max_participants = self.match_rules.max_participants,
                "Fewer spawn points than participants; tanks will share spawns"
            );
        }
    }

    /// Hard constraints checked by `validate`.
    pub fn check(&self) -> Result<(), String> {
        let m = &self.match_rules;
        if m.num_rounds_to_win == 0 {
            return Err("match.num_rounds_to_win must be > 0".into());
        }
        if m.tick_rate_hz == 0 {
            return Err("match.tick_rate_hz must be > 0".into());
        }
        if !(m.start_delay_secs.is_finite() && m.start_delay_secs >= 0.0)
            || !(m.end_delay_secs.is_finite() && m.end_delay_secs >= 0.0)
        {
            return Err("match delays must be finite and >= 0".into());
        }
        if m.min_participants < 2 {
            return Err("match.min_participants must be >= 2".into());
        }
        if m.max_participants < m.min_participants {
            return Err("match.max_participants must be >= match.min_participants".into());
        }
        let sc = &self.side_channel;
        let highest = u32::from(sc.base_port) + m.max_participants as u32;
        if highest > u32::from(u16::MAX) {
            return Err(format!(
                "side_channel.base_port {} leaves no room for {} participants",
                sc.base_port, m.max_participants
            ));
        }
        if sc.bind_host.parse::<std::net::IpAddr>().is_err() {
            return Err(format!(
                "side_channel.bind_host {:?} is not an IP address",
                sc.bind_host
            ));
        }
        if sc.accept_timeout_ms == 0 || sc.idle_timeout_ms == 0 || sc.write_timeout_ms == 0 {
            return Err("side_channel timeouts must be > 0".into());
        }
        if sc.backoff_initial_ms == 0 || sc.backoff_max_ms < sc.backoff_initial_ms {
            return Err("side_channel backoff must satisfy 0 < initial <= max".into());
        }
        if sc.max_frame_bytes == 0 {
            return Err("side_channel.max_frame_bytes must be > 0".into());
        }
        if self.limits.broadcast_capacity == 0 {
            return Err("limits.broadcast_capacity must be > 0".into());
        }
        if self.limits.player_message_buffer == 0 {
            return Err("limits.player_message_buffer must be > 0".into());
        }
        if self.limits.command_buffer == 0 {
            return Err("limits.command_buffer must be > 0".into());
        }
        if self.limits.input_rate_limit_per_sec <= 0.0 {
            return Err("limits.input_rate_limit_per_sec must be > 0".into());
        }
        Ok(())
    }

    /// Load config from `tankfall.toml` if it exists, then apply env var overrides.
    pub fn load() -> Self {
        let mut config = match std::fs::read_to_string("tankfall.toml") {
            Ok(content) => match toml::from_str::<ServerConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!("Loaded configuration from tankfall.toml");
                    cfg
                },
                Err(e) => {
                    tracing::warn!("Failed to parse tankfall.toml: {e}, using defaults");
                    ServerConfig::default()
                },
            },
            Err(_) => {
                tracing::info!("No tankfall.toml found, using defaults");
                ServerConfig::default()
            },
        };

        if let Ok(addr) = std::env::var("TANKFALL_LISTEN_ADDR")
            && !addr.is_empty()
        {
            config.listen_addr = addr;
        }
        if let Ok(host) = std::env::var("TANKFALL_ADVERTISED_HOST")
            && !host.is_empty()
        {
            config.external_address.advertised_host = Some(host);
        }
        if let Ok(val) = std::env::var("TANKFALL_BASE_PORT")
            && let Ok(n) = val.parse::<u16>()
        {
            config.side_channel.base_port = n;
        }
        if let Ok(val) = std::env::var("TANKFALL_ROUNDS_TO_WIN")
            && let Ok(n) = val.parse::<u32>()
        {
            config.match_rules.num_rounds_to_win = n;
        }
        if let Ok(val) = std::env::var("TANKFALL_MAX_PARTICIPANTS")
            && let Ok(n) = val.parse::<usize>()
        {
            config.match_rules.max_participants = n;
        }

        config
    }
}

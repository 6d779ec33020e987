use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_reconnect_delay_max_secs")]
    pub reconnect_delay_max_secs: u64,
    #[serde(default = "default_randomization_factor")]
    pub randomization_factor: f64,
    #[serde(default = "default_call_trials")]
    pub call_trials: u32,
    #[serde(default = "default_call_retry_delay_ms")]
    pub call_retry_delay_ms: u64,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// Pause after every successful write call so posts are not bunched up.
    #[serde(default = "default_call_spacing_ms")]
    pub call_spacing_ms: u64,
}

fn default_reconnect_delay_secs() -> u64 {
    1
}

fn default_reconnect_delay_max_secs() -> u64 {
    1000
}

fn default_randomization_factor() -> f64 {
    0.5
}

fn default_call_trials() -> u32 {
    5
}

fn default_call_retry_delay_ms() -> u64 {
    10_000
}

fn default_ack_timeout_secs() -> u64 {
    30
}

fn default_call_spacing_ms() -> u64 {
    1000
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay_secs(),
            reconnect_delay_max_secs: default_reconnect_delay_max_secs(),
            randomization_factor: default_randomization_factor(),
            call_trials: default_call_trials(),
            call_retry_delay_ms: default_call_retry_delay_ms(),
            ack_timeout_secs: default_ack_timeout_secs(),
            call_spacing_ms: default_call_spacing_ms(),
        }
    }
}

impl RealtimeConfig {
    pub fn call_retry_delay(&self) -> Duration {
        Duration::from_millis(self.call_retry_delay_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn call_spacing(&self) -> Duration {
        Duration::from_millis(self.call_spacing_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_horde_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_image_model")]
    pub model_name: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f32,
    #[serde(default = "default_sampler")]
    pub sampler: String,
    #[serde(default = "default_generation_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_horde_url() -> String {
    "https://aihorde.net/api/v2".to_string()
}

fn default_image_model() -> String {
    "AlbedoBase XL (SDXL)".to_string()
}

fn default_width() -> u32 {
    1024
}

fn default_height() -> u32 {
    768
}

fn default_steps() -> u32 {
    40
}

fn default_cfg_scale() -> f32 {
    7.5
}

fn default_sampler() -> String {
    "k_euler_a".to_string()
}

fn default_generation_poll_secs() -> u64 {
    5
}

fn default_generation_timeout_secs() -> u64 {
    600
}

impl Default for ImageGenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: default_horde_url(),
            api_key: None,
            model_name: default_image_model(),
            width: default_width(),
            height: default_height(),
            steps: default_steps(),
            cfg_scale: default_cfg_scale(),
            sampler: default_sampler(),
            poll_interval_secs: default_generation_poll_secs(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Forum identity
    #[serde(default = "default_forum_url")]
    pub forum_url: String,
    #[serde(default = "default_username")]
    pub username: String,
    /// Normally supplied through `NODEBB_PASSWORD` rather than the config file.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Floor applied on top of any robots.txt crawl delay.
    #[serde(default)]
    pub min_request_interval_ms: u64,

    // Language model
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default, skip_serializing)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_max_tokens")]
    pub llm_max_tokens: u32,
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    // Dispatch cadence
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_activity_wait_secs")]
    pub activity_wait_secs: u64,
    #[serde(default = "default_restart_delay_max_secs")]
    pub restart_delay_max_secs: u64,

    // Memory and database
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_memory_high_water")]
    pub memory_high_water: usize,
    #[serde(default = "default_memory_low_water")]
    pub memory_low_water: usize,

    // Tools
    #[serde(default = "default_search_url")]
    pub search_url: String,
    #[serde(default = "default_search_results")]
    pub search_max_results: usize,
    #[serde(default)]
    pub image_generation: ImageGenConfig,

    #[serde(default)]
    pub realtime: RealtimeConfig,
}

fn default_forum_url() -> String {
    "https://what.thedailywtf.com".to_string()
}

fn default_username() -> String {
    "clippy".to_string()
}

fn default_user_agent() -> String {
    "clippy".to_string()
}

fn default_llm_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_llm_model() -> String {
    "meta-llama/llama-3.3-70b-instruct".to_string()
}

fn default_llm_max_tokens() -> u32 {
    16384
}

fn default_vision_model() -> String {
    "meta-llama/llama-3.2-90b-vision-instruct".to_string()
}

fn default_system_prompt() -> String {
    "You are an assistant called {username} in the NodeBB forum at {forum_url}. \
     If you want a user to be notified that you replied or mentioned them, put an @ before \
     their username, like @{username} would be used to mention you.\n\n\
     When asked to draw something, use the generate_image tool. The image is posted to the \
     topic by itself once it is ready, so just tell the user it is on its way.\n\n\
     You receive the users' messages prefixed with \"username said: ...\", but you reply with \
     only the markdown text of your reply post, the way it should appear on the forum."
        .to_string()
}

fn default_max_iterations() -> usize {
    10
}

fn default_poll_interval() -> u64 {
    60
}

fn default_activity_wait_secs() -> u64 {
    5
}

fn default_restart_delay_max_secs() -> u64 {
    20 * 60
}

fn default_database_path() -> String {
    "clippy_memory.db".to_string()
}

fn default_memory_high_water() -> usize {
    4000
}

fn default_memory_low_water() -> usize {
    2000
}

fn default_search_url() -> String {
    "https://html.duckduckgo.com/html/".to_string()
}

fn default_search_results() -> usize {
    5
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            forum_url: default_forum_url(),
            username: default_username(),
            password: None,
            user_agent: default_user_agent(),
            min_request_interval_ms: 0,
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            llm_max_tokens: default_llm_max_tokens(),
            vision_model: default_vision_model(),
            system_prompt: default_system_prompt(),
            max_iterations: default_max_iterations(),
            poll_interval_secs: default_poll_interval(),
            activity_wait_secs: default_activity_wait_secs(),
            restart_delay_max_secs: default_restart_delay_max_secs(),
            database_path: default_database_path(),
            memory_high_water: default_memory_high_water(),
            memory_low_water: default_memory_low_water(),
            search_url: default_search_url(),
            search_max_results: default_search_results(),
            image_generation: ImageGenConfig::default(),
            realtime: RealtimeConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("clippy_config.toml")
    }

    /// Load config from clippy_config.toml (next to executable), then overlay
    /// secrets and overrides from the environment.
    pub fn load() -> Self {
        let path = Self::config_path();

        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<AgentConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::warn!("No config file found, using defaults + env vars");
                Self::default()
            }
        };

        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(url) = env::var("NODEBB_URL") {
            self.forum_url = url;
        }

        if let Ok(name) = env::var("NODEBB_USERNAME") {
            self.username = name;
        }

        if let Ok(password) = env::var("NODEBB_PASSWORD") {
            self.password = Some(password);
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        // LANGUAGE_MODEL is the historical name; an empty value keeps the default.
        for var in ["LLM_MODEL", "LANGUAGE_MODEL"] {
            if let Ok(model) = env::var(var) {
                if !model.trim().is_empty() {
                    self.llm_model = model;
                }
            }
        }

        for var in ["LLM_API_KEY", "OPENROUTER_API_KEY"] {
            if let Ok(key) = env::var(var) {
                if !key.trim().is_empty() {
                    self.llm_api_key = Some(key);
                }
            }
        }

        if let Ok(key) = env::var("AI_HORDE_API_KEY") {
            if !key.trim().is_empty() {
                self.image_generation.api_key = Some(key);
            }
        }

        if let Ok(interval) = env::var("CLIPPY_POLL_INTERVAL") {
            if let Ok(seconds) = interval.parse() {
                self.poll_interval_secs = seconds;
            }
        }

        if let Ok(path) = env::var("CLIPPY_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        if let Ok(enabled) = env::var("CLIPPY_ENABLE_IMAGE_GENERATION") {
            self.image_generation.enabled = enabled.eq_ignore_ascii_case("1")
                || enabled.eq_ignore_ascii_case("true")
                || enabled.eq_ignore_ascii_case("yes");
        }
    }

    /// System prompt with `{username}` / `{forum_url}` placeholders filled in.
    pub fn persona_prompt(&self) -> String {
        self.system_prompt
            .replace("{username}", &self.username)
            .replace("{forum_url}", &self.forum_url)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn activity_wait(&self) -> Duration {
        Duration::from_secs(self.activity_wait_secs.max(1))
    }

    pub fn min_request_interval(&self) -> Option<Duration> {
        if self.min_request_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.min_request_interval_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = AgentConfig::default();
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.realtime.call_trials, 5);
        assert_eq!(config.realtime.reconnect_delay_max_secs, 1000);
        assert_eq!(config.realtime.randomization_factor, 0.5);
        assert!(config.memory_low_water < config.memory_high_water);
        assert!(config.min_request_interval().is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: AgentConfig = toml::from_str(
            r#"
            forum_url = "https://forum.example"
            poll_interval_secs = 30

            [realtime]
            call_trials = 3
            "#,
        )
        .unwrap();
        assert_eq!(parsed.forum_url, "https://forum.example");
        assert_eq!(parsed.poll_interval_secs, 30);
        assert_eq!(parsed.realtime.call_trials, 3);
        assert_eq!(parsed.realtime.call_retry_delay_ms, 10_000);
        assert_eq!(parsed.username, "clippy");
    }

    #[test]
    fn secrets_are_not_serialized() {
        let mut config = AgentConfig::default();
        config.password = Some("hunter2".to_string());
        config.llm_api_key = Some("sk-secret".to_string());
        let rendered = toml::to_string_pretty(&config).unwrap();
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("sk-secret"));
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let config = AgentConfig {
            poll_interval_secs: 0,
            activity_wait_secs: 0,
            ..AgentConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.activity_wait(), Duration::from_secs(1));
    }

    #[test]
    fn persona_prompt_fills_placeholders() {
        let mut config = AgentConfig::default();
        config.username = "bot".to_string();
        config.forum_url = "https://forum.example".to_string();
        let prompt = config.persona_prompt();
        assert!(prompt.contains("called bot"));
        assert!(prompt.contains("https://forum.example"));
        assert!(!prompt.contains("{username}"));
    }
}

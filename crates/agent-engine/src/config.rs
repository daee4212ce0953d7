//! Engine configuration

/// Settings for [`crate::engine::AgentEngine`]
///
/// Defaults match a stock PJSIP deployment; override per site with the
/// builder-style setters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Channel technology prefix used to build interface strings
    pub channel_technology: String,
    /// Dialplan context for redirects and originated calls
    pub dial_context: String,
    /// Queues targeted when a pause request names none
    pub default_queues: Vec<String>,
    /// How long originated legs may ring before Asterisk gives up
    pub originate_timeout_ms: u64,
    /// Pause session log location
    pub database_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_technology: "PJSIP".to_string(),
            dial_context: "from-internal".to_string(),
            default_queues: vec!["default".to_string()],
            originate_timeout_ms: 30_000,
            database_url: "sqlite::memory:".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel_technology(mut self, technology: impl Into<String>) -> Self {
        self.channel_technology = technology.into();
        self
    }

    pub fn with_dial_context(mut self, context: impl Into<String>) -> Self {
        self.dial_context = context.into();
        self
    }

    pub fn with_default_queues(mut self, queues: Vec<String>) -> Self {
        self.default_queues = queues;
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Interface string for a queue member, e.g. `PJSIP/1016`
    pub fn interface_for(&self, extension: &str) -> String {
        format!("{}/{}", self.channel_technology, extension)
    }
}

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// OTLP/HTTP endpoint for span export. `OTEL_EXPORTER_OTLP_ENDPOINT` wins when set.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    pub fn otlp_endpoint(&self) -> Option<String> {
        std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.otlp_endpoint.clone())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LoggingConfig::default_level(),
            json: false,
            otlp_endpoint: None,
        }
    }
}

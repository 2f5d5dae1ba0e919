use config::{Config, ConfigError, Environment, File};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub http_bind: String,
    pub http_port: u16,
    /// External device broker endpoint. Absent means the in-process broker.
    pub device_ws_url: Option<String>,
    #[serde(deserialize_with = "deserialize_list")]
    pub device_topic_filters: Vec<String>,
    pub ingest_topic: String,
    /// Topic filters whose messages fan out to subject subscribers, in
    /// addition to the measure topic. Defaults to the ingest namespace.
    #[serde(deserialize_with = "deserialize_list")]
    pub live_fanout_filters: Vec<String>,
    pub measure_topic: String,
    pub direct_topic: String,
    pub broadcast_topic: String,
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    pub connection_queue_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub token_lifetime: Duration,
    #[serde(with = "humantime_serde")]
    pub token_sweep_interval: Duration,
    /// Message ledger database. Absent means the in-memory ledger.
    pub ledger_db_path: Option<PathBuf>,
    /// Telemetry batch database. Absent means the in-memory store.
    pub telemetry_db_path: Option<PathBuf>,
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value
                .split(|c| c == ',' || c == ';')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect())
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element()? {
                vec.push(element);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

impl NodeConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("http_bind", "0.0.0.0")?
            .set_default("http_port", 8080)?
            .set_default("device_ws_url", None::<String>)?
            .set_default("device_topic_filters", vec!["devices/#".to_string()])?
            .set_default("ingest_topic", "ingest/deviceData")?
            .set_default("live_fanout_filters", vec!["ingest/#".to_string()])?
            .set_default("measure_topic", "stream/measure")?
            .set_default("direct_topic", "stream/direct")?
            .set_default("broadcast_topic", "stream/broadcast")?
            .set_default("batch_size", 100)?
            .set_default("flush_interval", "5s")?
            .set_default("connection_queue_capacity", 256)?
            .set_default("heartbeat_interval", "30s")?
            .set_default("token_lifetime", "60s")?
            .set_default("token_sweep_interval", "30s")?
            .set_default("ledger_db_path", None::<String>)?
            .set_default("telemetry_db_path", None::<String>)?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(Environment::with_prefix("FIELDLINE").try_parsing(true));

        builder.build()?.try_deserialize()
    }
}

use std::str::FromStr;
use std::time;

use cdc_common::kafka::KafkaConfig;
use cdc_common::schema::ObjectType;
use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    /// Required unless `PRINT_SINK` is set.
    pub database_url: Option<String>,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(default = "cdc-worker")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "cdc_events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "cdc_data_quality_alerts")]
    pub kafka_alerts_topic: String,

    #[envconfig(default = "0.05")]
    pub alert_threshold: f64,

    #[envconfig(default = "true")]
    pub alerts_enabled: bool,

    #[envconfig(default = "raw_")]
    pub raw_table_prefix: String,

    #[envconfig(default = "_history")]
    pub history_table_suffix: String,

    #[envconfig(default = "3600")]
    pub history_window_secs: u64,

    #[envconfig(default = "60")]
    pub history_flush_interval_secs: u64,

    #[envconfig(default = "30000")]
    pub store_timeout_ms: EnvMsDuration,

    #[envconfig(default = "8")]
    pub max_concurrent_groups: usize,

    #[envconfig(default = "Account,Contact,Opportunity,Case")]
    pub enabled_objects: ObjectTypeList,

    #[envconfig(default = "Account,Contact,Opportunity,Case")]
    pub history_objects: ObjectTypeList,

    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Comma-separated object type names, such as `Account,Case`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectTypeList(pub Vec<ObjectType>);

impl ObjectTypeList {
    pub fn contains(&self, object_type: ObjectType) -> bool {
        self.0.contains(&object_type)
    }
}

impl FromStr for ObjectTypeList {
    type Err = cdc_common::schema::ParseObjectTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut types = Vec::new();
        for name in s.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            let object_type = name.parse::<ObjectType>()?;
            if !types.contains(&object_type) {
                types.push(object_type);
            }
        }
        Ok(ObjectTypeList(types))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_type_lists() {
        let list: ObjectTypeList = " Account, Case,,Account ".parse().unwrap();
        assert_eq!(list.0, vec![ObjectType::Account, ObjectType::Case]);
        assert!(list.contains(ObjectType::Case));
        assert!(!list.contains(ObjectType::Contact));

        let empty: ObjectTypeList = "".parse().unwrap();
        assert!(empty.0.is_empty());

        assert!("Account,Lead".parse::<ObjectTypeList>().is_err());
    }

    #[test]
    fn parses_millisecond_durations() {
        let EnvMsDuration(duration) = "1500".parse().unwrap();
        assert_eq!(duration, time::Duration::from_millis(1500));
        assert_eq!(
            "soon".parse::<EnvMsDuration>().unwrap_err(),
            ParseEnvMsDurationError
        );
    }
}

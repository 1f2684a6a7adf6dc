use std::num::NonZeroU32;

use cdc_common::kafka::KafkaConfig;
use cdc_common::schema::ObjectType;
use envconfig::Envconfig;

use crate::simulator::EventDistribution;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "cdc_events")]
    pub kafka_topic: String,

    #[envconfig(default = "Account")]
    pub object_type: ObjectType,

    #[envconfig(default = "100")]
    pub count: usize,

    #[envconfig(default = "50")]
    pub preload: usize,

    /// Events per second. Unset publishes as fast as the producer accepts.
    pub rate_limit: Option<NonZeroU32>,

    #[envconfig(default = "false")]
    pub continuous: bool,

    #[envconfig(default = "5")]
    pub interval_secs: u64,

    #[envconfig(default = "30000")]
    pub publish_timeout_ms: u64,

    #[envconfig(default = "0.5")]
    pub insert_ratio: f64,

    #[envconfig(default = "0.4")]
    pub update_ratio: f64,

    #[envconfig(default = "0.1")]
    pub delete_ratio: f64,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    pub fn distribution(&self) -> EventDistribution {
        EventDistribution {
            insert: self.insert_ratio,
            update: self.update_ratio,
            delete: self.delete_ratio,
        }
    }
}

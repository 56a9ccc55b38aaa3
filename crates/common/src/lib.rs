pub mod clickhouse;
pub mod domain;
pub mod elasticsearch;
pub mod nats;
pub mod telemetry;

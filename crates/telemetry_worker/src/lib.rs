pub mod clickhouse;
pub mod domain;
pub mod elasticsearch;
pub mod nats;
pub mod telemetry_worker;

pub use self::clickhouse::*;
pub use self::domain::*;
pub use self::elasticsearch::*;
pub use self::nats::*;
pub use self::telemetry_worker::*;

pub mod config;
pub mod fsutil;
pub mod http;
pub mod id;
pub mod job;
pub mod mihomo;
pub mod pipeline;
pub mod probe;
pub mod proxy_env;
pub mod reload;
pub mod scheduler;
pub mod subscription;
pub mod verify;
pub mod version;

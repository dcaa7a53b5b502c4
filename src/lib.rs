pub mod broadcast_hub;
pub mod cli;
pub mod config;
pub mod datagram_source;
pub mod error;
pub mod kv_parser;
pub mod line_source;
pub mod metrics;
pub mod nmea_parser;
pub mod orchestrator;
pub mod sim_model;
pub mod telemetry;

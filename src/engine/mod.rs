pub mod builder;
pub mod config;
pub mod differ;
pub mod risk;
pub mod stops;

pub use builder::PortfolioBuilder;
pub use config::MirrorConfig;
pub use differ::ExecutionDiffer;
pub use risk::RiskOverlay;
pub use stops::{CloseReason, StopMonitor};

//! Trader scoring: composite score and style classification.

mod scorer;

pub use scorer::TraderScorer;

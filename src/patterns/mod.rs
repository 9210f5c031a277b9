// src/patterns/mod.rs
pub mod harmonic;
pub mod pivots;
pub mod zones;

pub use harmonic::PatternMatcher;
pub use pivots::PivotScanner;
pub use zones::{PatternStore, TrackedPattern, ZoneCalculator};

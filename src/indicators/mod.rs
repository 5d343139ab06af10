// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators backing the regime
// monitor and the dynamic grid interval. Every public function returns
// `Option<f64>` so callers must handle insufficient data and numerical edge
// cases.

pub mod atr;
pub mod rsi;

pub use atr::atr;
pub use rsi::rsi;

// =============================================================================
// Market Monitors — funding-rate cache and regime classification
// =============================================================================

pub mod funding;
pub mod regime;

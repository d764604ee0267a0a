//! Risk management for the grid engine.
//!
//! Provides the cross-symbol risk posture:
//! - Dynamic safety reserve and the reserve pre-check
//! - Early-freeze and panic transitions
//! - Adaptive rebalancing plans and trend-side TP management
//! - Emergency stop flag files

pub mod controller;
pub mod emergency;

pub use controller::{
    ImBand, ImStatus, RebalanceLeg, RebalancePlan, ReserveDecision, ReserveProbe, RiskController,
    RiskDirective, SymbolExposure,
};
pub use emergency::{EmergencyFlag, EmergencyFlagStore};

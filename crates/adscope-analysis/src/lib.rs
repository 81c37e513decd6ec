//! Client for the remote ad-analysis service.
//!
//! The analysis service is an opaque external capability: it accepts an
//! image or video plus context fields and returns structured results, or an
//! error. Calls are bounded by a long timeout (the service can take on the
//! order of minutes for video).

pub mod client;
pub mod error;

pub use client::{AnalysisClient, AnalysisConfig, AnalysisFields, COMPREHENSIVE_ANALYSIS};
pub use error::{AnalysisError, AnalysisResult};

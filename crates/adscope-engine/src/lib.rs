//! Subscription and plan-quota entitlement engine.
//!
//! Owns the lifecycle of a user's ad-analysis entitlement: plan creation,
//! monthly usage rollover, topups, upgrades, and the atomic consumption of
//! one analysis unit when a remote analysis succeeds.
//!
//! The engine writes two places: the authoritative `PlanRecord` and a
//! best-effort `subscription.*` projection on the user profile. Projection
//! writes never gate a request; drift is repaired by
//! [`projection::ProjectionSync`] and the reconciliation sweep.
//!
//! Consumption is a two-phase gate ([`gate::ConsumptionGate`]): a read-only
//! `try_consume` before the external analysis call and a `commit` after it
//! reported a usable result. No lock or transaction spans the external call
//! (it can run for minutes), which leaves a documented race window; the
//! commit narrows it with an optimistic-concurrency check on the record
//! revision.

pub mod billing;
pub mod clock;
pub mod error;
pub mod gate;
pub mod mutation;
pub mod projection;
pub mod reconcile;
pub mod service;
pub mod store;

pub use billing::{BillingPeriodPolicy, Rollover};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{EngineError, EngineResult};
pub use gate::{CommitReceipt, ConsumptionGate, ConsumptionTicket};
pub use mutation::PlanMutationEngine;
pub use projection::ProjectionSync;
pub use reconcile::ReconciliationJob;
pub use service::{AdAnalysisService, AnalysisReport, AnalysisRequest};
pub use store::{
    AnalysisArchive, FirestoreStores, MemoryStores, MirrorPatch, PlanPatch, PlanStore,
    ProfileMirrorStore, VersionedPlan,
};

//! Carbon credit calculation and verification engine.
//!
//! Computes per-period credit estimates for agricultural plots, gates them on
//! data sufficiency, and runs the verifier workflow that turns an estimate
//! into verified credits. State lives in sled; records are CBOR encoded.

pub mod clock;
pub mod config;
pub mod error;
pub mod farm;
pub mod ledger;
pub mod methodology;
pub mod period;
pub mod service;
pub mod store;
pub mod utils;
pub mod validation;
pub mod verification;

pub use clock::{Clock, FixedClock, SystemClock, TimeStamp};
pub use config::MethodologyConfig;
pub use error::{EngineError, RecordKind};
pub use farm::{CropType, Farm, FarmDetails, GroundTruthObservation, Practice, SatelliteObservation};
pub use ledger::{CreditRecord, CreditStatus, RecalculationPolicy};
pub use period::Period;
pub use service::{CalculationOutcome, CarbonService, PendingVerification};
pub use validation::{ValidationIssue, ValidationReport};
pub use verification::{Evidence, EvidenceKind, TransitionFields, Verification, VerificationStatus};

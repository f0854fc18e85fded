//! Hypothesis estimators over the wallet and hour panels.
//!
//! Each estimator returns its own `EstimationResult`; a failure in one stage
//! never blocks the others.

pub mod event_study;
pub mod hazard;
pub mod linalg;
pub mod losses;

pub use event_study::{event_window, lag_regression, EventWindow, LagRegression};
pub use hazard::{
    fit_cox, hazard_report, kaplan_meier_by_quartile, survival_records, CoxFit, HazardReport,
    KaplanMeierCurve, SurvivalRecord,
};
pub use losses::{estimate_losses, ExitBucket, LossInputs, LossReport};

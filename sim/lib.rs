#![deny(unused_variables)]
#![deny(dead_code)]

//! Data generation and exact population summaries for survival simulation studies under
//! non-proportional hazards.
//!
//! The crate is organised leaves first: [`hazard`] and [`multistate`] describe the event-time
//! models, [`simulate`] draws and censors patient-level data from them, [`truth`] integrates the
//! same models to obtain the population values that estimators are scored against, and
//! [`rates`] turns interpretable design targets into model rates.

pub mod config;
pub mod design;
pub mod hazard;
pub mod linalg;
pub mod multistate;
pub mod quadrature;
pub mod rates;
pub mod roots;
pub mod scenarios;
pub mod simulate;
pub mod summary;
pub mod truth;

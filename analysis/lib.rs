//! Penalized additive modelling of the heat increment of feeding.
//!
//! The crate is a single forward pipeline: [`data`] loads the observation
//! set, [`estimate`] fits the additive model described by a
//! [`model::ModelSpec`], [`diagnostics`] and [`inference`] interrogate the
//! fitted model, [`predict`] derives partial, conditional and marginal
//! curves, and [`integrate`] turns the marginal curve into a cumulative
//! area under the curve. [`pipeline`] wires the steps together and
//! [`report`] writes the tabular results.

#![deny(dead_code)]
#![deny(unused_imports)]

pub mod basis;
pub mod construction;
pub mod data;
pub mod diagnostics;
pub mod estimate;
pub mod inference;
pub mod integrate;
pub mod model;
pub mod pipeline;
pub mod predict;
pub mod report;
pub mod test_fixtures;

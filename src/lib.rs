//! Grade rollup engine and the workspace sidecar around it.
//!
//! [`calc`] holds the pure scoring rules (bands, semester/final averages,
//! certificate averages). [`report`] turns a stored section roster into the
//! sábana and certificate models and their CSV renderings. [`ipc`] exposes
//! everything over the line-delimited JSON protocol used by `notasd`.

pub mod backup;
pub mod calc;
pub mod consolidado;
pub mod db;
pub mod ipc;
pub mod report;

//! HTTP admin surface

pub mod api;

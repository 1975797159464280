//! Batch processors built on the fetch client

pub mod batch;

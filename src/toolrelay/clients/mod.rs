//! Concrete [`InferenceBackend`](crate::client_wrapper::InferenceBackend) implementations.
//!
//! Each submodule speaks a particular vendor's API while conforming to the uniform gateway
//! contract.

pub mod anthropic;

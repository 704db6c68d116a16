//! Admission / concurrency control.

pub mod controller;

pub use controller::{
    AdmissionController, AdmissionError, AdmissionLimits, AdmissionSnapshot, AdmissionTicket,
};

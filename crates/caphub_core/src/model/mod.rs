//! Catalog domain model exports.

pub mod catalog;

pub use catalog::{
    AuthSpec, Capability, CapabilityType, InstallationRecord, Organization, OutputDescriptor,
    Parameter, ParameterType, UsageRecord, ValidationError,
};

//! Cloud provisioning for kiln
//!
//! [`CloudFactory`] is what the orchestrator provisions through;
//! [`Provisioner`] implements it on top of any [`CloudClient`], keeping every
//! step idempotent against the state document.

#![deny(missing_docs)]

pub mod client;
pub mod factory;
pub mod memory;
pub mod provision;
pub mod rules;

use std::sync::Arc;

use kiln_common::credentials::CredentialsDocument;
use kiln_common::{CloudProvider, Error, Result};

pub use client::{CloudClient, Instance, Network, ResourceStatus};
pub use factory::CloudFactory;
pub use memory::MemoryCloud;
pub use provision::{all_required_ready, vm_name, Provisioner, VmSizes};
pub use rules::{rules_for, FirewallRule, RuleContext};

/// Client for the provider the credentials belong to.
///
/// The `local` provider, and every provider in fake mode, is served by
/// [`MemoryCloud`]. Provider SDK bindings plug in here.
pub fn connect(credentials: &CredentialsDocument, fake: bool) -> Result<Arc<dyn CloudClient>> {
    let provider = credentials.provider();
    if fake || provider == CloudProvider::Local {
        return Ok(Arc::new(MemoryCloud::new(provider)));
    }
    Err(Error::provider_permanent(
        provider.as_str(),
        "no API client is compiled into this build; use the local provider or fake mode",
    ))
}

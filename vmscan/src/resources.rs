//! The ephemeral cloud resources a scan job creates, and their removal.
//!
//! A job creates at most one keypair, one floating IP and one instance, in that order.
//! Whatever subset exists when the job fails or finishes is removed through [`rollback`].

use log::debug;
use stable_eyre::{eyre::Context, Result};

use crate::api::{Compute, FloatingIp, FloatingIpId, Instance, InstanceId, Keypair, Network};

/// Remove whichever of the given resources exist, in the order instance, keypair, floating IP.
///
/// The instance goes first since it holds references to both the keypair and the address.
///
/// # Partial failure
///
/// The first removal error is returned immediately; removals after it are not attempted.
/// Callers that need a full cleanup guarantee must retry the remaining resources themselves.
pub async fn rollback(
    compute: &dyn Compute,
    network: &dyn Network,
    instance: Option<&InstanceId>,
    keypair: Option<&str>,
    floating_ip: Option<&FloatingIpId>,
) -> Result<()> {
    if let Some(id) = instance {
        debug!("removing instance {id}");
        compute
            .remove_instance(id)
            .await
            .with_context(|| format!("remove instance {id}"))?;
    }
    if let Some(name) = keypair {
        debug!("removing keypair {name}");
        compute
            .remove_keypair(name)
            .await
            .with_context(|| format!("remove keypair {name}"))?;
    }
    if let Some(id) = floating_ip {
        debug!("releasing floating ip {id}");
        network
            .release_floating_ip(id)
            .await
            .with_context(|| format!("release floating ip {id}"))?;
    }
    Ok(())
}

/// The resources owned by one scan job.
///
/// Each member is `None` until the job creates it.
#[derive(Debug, Default)]
pub struct ResourceSet {
    keypair: Option<Keypair>,
    floating_ip: Option<FloatingIp>,
    instance: Option<Instance>,
}

impl ResourceSet {
    /// The keypair, once created.
    pub fn keypair(&self) -> Option<&Keypair> {
        self.keypair.as_ref()
    }

    /// The floating IP, once acquired.
    pub fn floating_ip(&self) -> Option<&FloatingIp> {
        self.floating_ip.as_ref()
    }

    /// The instance, once created.
    pub fn instance(&self) -> Option<&Instance> {
        self.instance.as_ref()
    }

    /// Record the keypair.
    pub fn set_keypair(&mut self, keypair: Keypair) {
        self.keypair = Some(keypair);
    }

    /// Record the floating IP.
    pub fn set_floating_ip(&mut self, floating_ip: FloatingIp) {
        self.floating_ip = Some(floating_ip);
    }

    /// Record the instance.
    pub fn set_instance(&mut self, instance: Instance) {
        self.instance = Some(instance);
    }

    /// Whether nothing is held.
    pub fn is_empty(&self) -> bool {
        self.keypair.is_none() && self.floating_ip.is_none() && self.instance.is_none()
    }

    /// Remove every held resource through [`rollback`].
    ///
    /// Members are taken out of the set before removal is attempted,
    /// so a second call is a no-op even if the first one failed part way.
    pub async fn teardown(&mut self, compute: &dyn Compute, network: &dyn Network) -> Result<()> {
        let instance = self.instance.take();
        let keypair = self.keypair.take();
        let floating_ip = self.floating_ip.take();
        rollback(
            compute,
            network,
            instance.as_ref().map(Instance::id),
            keypair.as_ref().map(|k| k.name().as_str()),
            floating_ip.as_ref().map(FloatingIp::id),
        )
        .await
    }
}

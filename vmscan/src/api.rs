//! Capabilities the pipeline consumes from the cloud it runs against.
//!
//! Each trait is a narrow view of one backend service: compute, networking, the image registry,
//! remote execution on an instance, and object storage.
//! The pipeline is written only against these traits; which concrete clients back them
//! is decided once, when the [`Backend`] is built.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use derive_more::{Display, From};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use stable_eyre::Result;
use tokio::io::AsyncRead;
use typed_builder::TypedBuilder;

#[cfg(test)]
use mockall::automock;

use crate::image::{Image, ImageId, PropertyOp, Visibility};

mod devnull;

pub use devnull::*;

/// Identifies a compute instance. This is an opaque string.
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Deserialize, Serialize,
)]
pub struct InstanceId(String);

/// Identifies a floating IP allocation. This is an opaque string.
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Deserialize, Serialize,
)]
pub struct FloatingIpId(String);

/// Identifies a compute flavor. This is an opaque string.
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Deserialize, Serialize,
)]
pub struct FlavorId(String);

/// An SSH keypair registered with the compute service.
#[derive(Clone, Eq, PartialEq, Debug, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct Keypair {
    /// The name the compute service knows the keypair by.
    #[builder(setter(into))]
    name: String,

    /// The private half, returned only when the keypair is created.
    #[builder(setter(into))]
    private_key: String,
}

/// A routable address allocated from a network.
#[derive(Clone, Eq, PartialEq, Debug, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct FloatingIp {
    /// The allocation, used to release it.
    #[builder(setter(into))]
    id: FloatingIpId,

    /// The address itself, used to attach it and to reach the instance.
    #[builder(setter(into))]
    address: String,
}

/// A compute instance.
#[derive(Clone, Eq, PartialEq, Debug, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct Instance {
    /// The compute service's identifier for the instance.
    #[builder(setter(into))]
    id: InstanceId,
}

/// Everything needed to boot an instance.
#[derive(Clone, Eq, PartialEq, Debug, Getters, CopyGetters, TypedBuilder)]
pub struct InstanceSpec {
    /// The keypair injected into the instance.
    #[getset(get = "pub")]
    #[builder(setter(into))]
    keypair: String,

    /// The flavor to boot with.
    #[getset(get = "pub")]
    flavor: FlavorId,

    /// The network the instance is attached to.
    #[getset(get = "pub")]
    #[builder(setter(into))]
    network: String,

    /// Whether to attach a config drive.
    #[getset(get_copy = "pub")]
    #[builder(default)]
    config_drive: bool,

    /// The boot script run by the instance on first boot.
    #[getset(get = "pub")]
    #[builder(setter(into))]
    user_data: Vec<u8>,

    /// The image to boot.
    #[getset(get = "pub")]
    image: ImageId,

    /// Security groups applied to the instance.
    #[getset(get = "pub")]
    #[builder(default)]
    security_groups: Vec<String>,
}

/// How to reach a freshly booted instance.
#[derive(Clone, Eq, PartialEq, Getters, CopyGetters, TypedBuilder)]
pub struct SessionTarget {
    /// The login user.
    #[getset(get = "pub")]
    #[builder(setter(into))]
    user: String,

    /// The private key used to authenticate.
    #[getset(get = "pub")]
    #[builder(setter(into))]
    private_key: String,

    /// The host to connect to.
    #[getset(get = "pub")]
    #[builder(setter(into))]
    host: String,

    /// The port to connect to.
    #[getset(get_copy = "pub")]
    #[builder(default = 22)]
    port: u16,
}

impl std::fmt::Debug for SessionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTarget")
            .field("user", &self.user)
            .field("private_key", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

/// Keypair and instance lifecycle.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Compute: Send + Sync {
    /// Create a keypair with the given name.
    async fn create_keypair(&self, name: &str) -> Result<Keypair>;

    /// Remove a keypair.
    async fn remove_keypair(&self, name: &str) -> Result<()>;

    /// Boot an instance.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance>;

    /// Whether the instance has finished booting.
    async fn instance_active(&self, id: &InstanceId) -> Result<bool>;

    /// Bind a floating address to an instance.
    async fn attach_floating_ip(&self, id: &InstanceId, address: &str) -> Result<()>;

    /// Remove an instance.
    async fn remove_instance(&self, id: &InstanceId) -> Result<()>;

    /// Look up the id of a flavor by its name.
    async fn resolve_flavor(&self, name: &str) -> Result<FlavorId>;
}

/// Floating IP lifecycle.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Network: Send + Sync {
    /// Allocate a floating IP from the named network.
    async fn acquire_floating_ip(&self, network: &str) -> Result<FloatingIp>;

    /// Release a floating IP allocation.
    async fn release_floating_ip(&self, id: &FloatingIpId) -> Result<()>;
}

/// Image lookup and metadata.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// List every image whose name contains `substring`.
    async fn list_images(&self, substring: &str) -> Result<Vec<Image>>;

    /// Fetch an image by id, if it exists.
    async fn fetch_image(&self, id: &ImageId) -> Result<Option<Image>>;

    /// Apply a single property write, returning the updated image.
    async fn modify_property(
        &self,
        id: &ImageId,
        op: PropertyOp,
        key: &str,
        value: &str,
    ) -> Result<Image>;

    /// Delete an image.
    async fn delete_image(&self, id: &ImageId) -> Result<()>;

    /// Change who may boot the image.
    async fn set_visibility(&self, id: &ImageId, visibility: Visibility) -> Result<()>;
}

/// Opens sessions to instances.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Open a shell and file transfer session.
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn Session>>;
}

/// An open session to an instance.
#[async_trait]
pub trait Session: Send {
    /// Copy `remote` on the instance to `local`, returning the local path written.
    async fn copy_from_remote(&mut self, remote: &Path, local: &Path) -> Result<PathBuf>;

    /// Close the file transfer channel.
    async fn close_transfer(&mut self) -> Result<()>;

    /// Close the shell channel.
    async fn close_shell(&mut self) -> Result<()>;
}

/// Opaque blob storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store the stream under `key`, replacing anything already there.
    async fn put(&self, key: &str, body: Box<dyn AsyncRead + Send + Unpin>) -> Result<()>;

    /// Read the blob stored under `key`.
    async fn fetch(&self, key: &str) -> Result<Vec<u8>>;
}

/// The set of capability clients a run uses.
///
/// Built once at startup; jobs only ever see these trait objects.
#[derive(Clone, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct Backend {
    /// Keypairs and instances.
    compute: Arc<dyn Compute>,

    /// Floating IPs.
    network: Arc<dyn Network>,

    /// Image lookup and metadata.
    images: Arc<dyn ImageRegistry>,

    /// Sessions to instances.
    remote: Arc<dyn Remote>,

    /// Result uploads.
    storage: Arc<dyn ObjectStore>,
}

impl Backend {
    /// Build a backend where a single client provides every capability.
    pub fn uniform<C>(client: Arc<C>) -> Self
    where
        C: Compute + Network + ImageRegistry + Remote + ObjectStore + 'static,
    {
        Self {
            compute: client.clone(),
            network: client.clone(),
            images: client.clone(),
            remote: client.clone(),
            storage: client,
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

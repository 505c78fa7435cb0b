//! A backend that simulates a cloud in memory and logs everything it is asked to do.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use log::info;
use stable_eyre::{
    eyre::{bail, eyre, Context},
    Result,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::Mutex,
};

use crate::{
    api::{
        Compute, FlavorId, FloatingIp, FloatingIpId, ImageRegistry, Instance, InstanceId,
        InstanceSpec, Keypair, Network, ObjectStore, Remote, Session, SessionTarget,
    },
    image::{Image, ImageId, PropertyOp, Visibility},
    userdata::{REMOTE_MARKER, REMOTE_RESULTS},
};

/// Simulates every capability in memory, logging each call.
/// Every instance boots immediately and its scanner reports the same results document.
/// Meant for basic sanity testing.
#[derive(Debug)]
pub struct Devnull {
    images: Mutex<BTreeMap<ImageId, Image>>,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    report: Arc<Vec<u8>>,
}

impl Devnull {
    /// Create a simulated cloud holding `images`, whose scanner reports `report` for every image.
    pub fn new(images: impl IntoIterator<Item = Image>, report: impl Into<Vec<u8>>) -> Self {
        Self {
            images: Mutex::new(
                images
                    .into_iter()
                    .map(|image| (image.id().clone(), image))
                    .collect(),
            ),
            objects: Mutex::new(BTreeMap::new()),
            report: Arc::new(report.into()),
        }
    }

    /// Preload an object into the simulated object storage.
    pub async fn with_object(self, key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.objects.lock().await.insert(key.into(), body.into());
        self
    }

    /// The images the simulated registry currently holds.
    pub async fn images(&self) -> Vec<Image> {
        self.images.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl Compute for Devnull {
    async fn create_keypair(&self, name: &str) -> Result<Keypair> {
        info!("[dryrun] create keypair {name}");
        Ok(Keypair::builder()
            .name(name)
            .private_key("dryrun-private-key")
            .build())
    }

    async fn remove_keypair(&self, name: &str) -> Result<()> {
        info!("[dryrun] remove keypair {name}");
        Ok(())
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance> {
        let id = InstanceId::from(format!("dryrun-instance-{}", spec.image()));
        info!(
            "[dryrun] create instance {id} from image {} with flavor {} on network {} ({} byte(s) of user data)",
            spec.image(),
            spec.flavor(),
            spec.network(),
            spec.user_data().len()
        );
        Ok(Instance::builder().id(id).build())
    }

    async fn instance_active(&self, id: &InstanceId) -> Result<bool> {
        info!("[dryrun] instance {id} is active");
        Ok(true)
    }

    async fn attach_floating_ip(&self, id: &InstanceId, address: &str) -> Result<()> {
        info!("[dryrun] attach {address} to instance {id}");
        Ok(())
    }

    async fn remove_instance(&self, id: &InstanceId) -> Result<()> {
        info!("[dryrun] remove instance {id}");
        Ok(())
    }

    async fn resolve_flavor(&self, name: &str) -> Result<FlavorId> {
        info!("[dryrun] resolve flavor {name}");
        Ok(FlavorId::from(format!("dryrun-flavor-{name}")))
    }
}

#[async_trait]
impl Network for Devnull {
    async fn acquire_floating_ip(&self, network: &str) -> Result<FloatingIp> {
        info!("[dryrun] acquire floating ip from network {network}");
        Ok(FloatingIp::builder()
            .id(FloatingIpId::from(String::from("dryrun-fip")))
            .address("192.0.2.1")
            .build())
    }

    async fn release_floating_ip(&self, id: &FloatingIpId) -> Result<()> {
        info!("[dryrun] release floating ip {id}");
        Ok(())
    }
}

#[async_trait]
impl ImageRegistry for Devnull {
    async fn list_images(&self, substring: &str) -> Result<Vec<Image>> {
        info!("[dryrun] list images matching '{substring}'");
        Ok(self
            .images
            .lock()
            .await
            .values()
            .filter(|image| image.name().contains(substring))
            .cloned()
            .collect())
    }

    async fn fetch_image(&self, id: &ImageId) -> Result<Option<Image>> {
        info!("[dryrun] fetch image {id}");
        Ok(self.images.lock().await.get(id).cloned())
    }

    async fn modify_property(
        &self,
        id: &ImageId,
        op: PropertyOp,
        key: &str,
        value: &str,
    ) -> Result<Image> {
        info!("[dryrun] {op} property {key}={value} on image {id}");
        let mut images = self.images.lock().await;
        let image = images
            .get_mut(id)
            .ok_or_else(|| eyre!("image {id} not found"))?;
        let properties = image.properties_mut();
        match op {
            PropertyOp::Add if properties.contains(key) => bail!("property {key} already exists"),
            PropertyOp::Replace | PropertyOp::Remove if !properties.contains(key) => {
                bail!("property {key} does not exist")
            }
            PropertyOp::Remove => {
                properties.remove(key);
            }
            PropertyOp::Add | PropertyOp::Replace => {
                properties.insert(key, value);
            }
        }
        Ok(image.clone())
    }

    async fn delete_image(&self, id: &ImageId) -> Result<()> {
        info!("[dryrun] delete image {id}");
        self.images
            .lock()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| eyre!("image {id} not found"))
    }

    async fn set_visibility(&self, id: &ImageId, visibility: Visibility) -> Result<()> {
        info!("[dryrun] set visibility of image {id} to {visibility}");
        Ok(())
    }
}

#[async_trait]
impl Remote for Devnull {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn Session>> {
        info!(
            "[dryrun] connect to {}@{}:{}",
            target.user(),
            target.host(),
            target.port()
        );
        Ok(Box::new(DevnullSession {
            report: self.report.clone(),
        }))
    }
}

#[async_trait]
impl ObjectStore for Devnull {
    async fn put(&self, key: &str, mut body: Box<dyn AsyncRead + Send + Unpin>) -> Result<()> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf)
            .await
            .with_context(|| format!("read body for {key}"))?;
        info!("[dryrun] store {} byte(s) at {key}", buf.len());
        self.objects.lock().await.insert(key.to_string(), buf);
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        info!("[dryrun] fetch {key}");
        self.objects
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| eyre!("no object stored at {key}"))
    }
}

/// A session to a simulated instance whose scan has already finished.
struct DevnullSession {
    report: Arc<Vec<u8>>,
}

#[async_trait]
impl Session for DevnullSession {
    async fn copy_from_remote(&mut self, remote: &Path, local: &Path) -> Result<PathBuf> {
        info!("[dryrun] copy {remote:?} to {local:?}");
        let content: &[u8] = if remote == Path::new(REMOTE_MARKER) {
            b"done\n"
        } else if remote == Path::new(REMOTE_RESULTS) {
            self.report.as_slice()
        } else {
            bail!("no such file on instance: {remote:?}");
        };
        tokio::fs::write(local, content)
            .await
            .with_context(|| format!("write {local:?}"))?;
        Ok(local.to_path_buf())
    }

    async fn close_transfer(&mut self) -> Result<()> {
        info!("[dryrun] close file transfer channel");
        Ok(())
    }

    async fn close_shell(&mut self) -> Result<()> {
        info!("[dryrun] close shell channel");
        Ok(())
    }
}

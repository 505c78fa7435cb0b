//! An in-memory cloud that records every call and fails on request.

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use stable_eyre::{
    eyre::{bail, eyre},
    Result,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::Mutex,
};
use vmscan::{
    api::{
        Compute, FlavorId, FloatingIp, FloatingIpId, ImageRegistry, Instance, InstanceId,
        InstanceSpec, Keypair, Network, ObjectStore, Remote, Session, SessionTarget,
    },
    image::{Image, ImageId, PropertyOp, Visibility},
    userdata::{REMOTE_MARKER, REMOTE_RESULTS},
};

/// Something the pipeline asked the cloud to do.
#[derive(Clone, PartialEq, Debug)]
pub enum Event {
    CreateKeypair(String),
    RemoveKeypair(String),
    AcquireFip(FloatingIpId),
    ReleaseFip(FloatingIpId),
    CreateInstance {
        instance: InstanceId,
        image: ImageId,
        user_data: String,
    },
    RemoveInstance(InstanceId),
    AttachFip(InstanceId, String),
    SetVisibility(ImageId, Visibility),
    ModifyProperty(ImageId, PropertyOp, String, String),
    DeleteImage(ImageId),
    Put(String),
    CloseTransfer(ImageId),
    CloseShell(ImageId),
}

#[derive(Default)]
struct State {
    images: BTreeMap<ImageId, Image>,
    objects: BTreeMap<String, Vec<u8>>,
    events: Vec<Event>,
    fip_calls: usize,
    instances: BTreeMap<InstanceId, ImageId>,
    attached: BTreeMap<String, InstanceId>,
}

/// Which calls fail, and what each image's scanner reports.
#[derive(Default)]
struct Faults {
    fail_fip_call: Option<usize>,
    fail_remove_instance: bool,
    fail_keypair: HashSet<String>,
    panic_keypair: HashSet<String>,
    fail_instance: HashSet<ImageId>,
    fail_attach: HashSet<ImageId>,
    fail_close: bool,
    never_active: HashSet<ImageId>,
    never_completes: HashSet<ImageId>,
    reports: BTreeMap<ImageId, Vec<u8>>,
}

/// The fake cloud. Images scan clean unless given a report.
#[derive(Default)]
pub struct FakeCloud {
    state: Arc<Mutex<State>>,
    faults: Faults,
}

impl FakeCloud {
    pub fn new(images: impl IntoIterator<Item = Image>) -> Self {
        let state = State {
            images: images
                .into_iter()
                .map(|image| (image.id().clone(), image))
                .collect(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            faults: Faults::default(),
        }
    }

    /// Fail the `n`th floating IP request, counting from 1.
    pub fn fail_fip_call(mut self, n: usize) -> Self {
        self.faults.fail_fip_call = Some(n);
        self
    }

    /// Fail every instance removal.
    pub fn fail_remove_instance(mut self) -> Self {
        self.faults.fail_remove_instance = true;
        self
    }

    /// Fail creating the keypair for this image.
    pub fn fail_keypair(mut self, id: &str) -> Self {
        self.faults.fail_keypair.insert(format!("vmscan-{id}"));
        self
    }

    /// Panic while creating the keypair for this image.
    pub fn panic_keypair(mut self, id: &str) -> Self {
        self.faults.panic_keypair.insert(format!("vmscan-{id}"));
        self
    }

    /// Fail booting an instance of this image.
    pub fn fail_instance(mut self, id: &str) -> Self {
        self.faults.fail_instance.insert(ImageId::from(id));
        self
    }

    /// Fail attaching a floating IP to instances of this image.
    pub fn fail_attach(mut self, id: &str) -> Self {
        self.faults.fail_attach.insert(ImageId::from(id));
        self
    }

    /// Fail closing the transfer channel of every session.
    pub fn fail_close(mut self) -> Self {
        self.faults.fail_close = true;
        self
    }

    /// Instances of this image never become active.
    pub fn never_active(mut self, id: &str) -> Self {
        self.faults.never_active.insert(ImageId::from(id));
        self
    }

    /// The scanner never finishes on instances of this image.
    pub fn never_completes(mut self, id: &str) -> Self {
        self.faults.never_completes.insert(ImageId::from(id));
        self
    }

    /// Instances of this image report `report`.
    pub fn report(mut self, id: &str, report: impl Into<Vec<u8>>) -> Self {
        self.faults.reports.insert(ImageId::from(id), report.into());
        self
    }

    /// Store an object before the run.
    pub async fn object(self, key: &str, body: impl Into<Vec<u8>>) -> Self {
        self.state
            .lock()
            .await
            .objects
            .insert(key.to_string(), body.into());
        self
    }

    pub async fn events(&self) -> Vec<Event> {
        self.state.lock().await.events.clone()
    }

    pub async fn image(&self, id: &str) -> Option<Image> {
        self.state.lock().await.images.get(&ImageId::from(id)).cloned()
    }

    pub async fn stored(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().await.objects.get(key).cloned()
    }

    async fn record(&self, event: Event) {
        self.state.lock().await.events.push(event);
    }
}

#[async_trait]
impl Compute for FakeCloud {
    async fn create_keypair(&self, name: &str) -> Result<Keypair> {
        if self.faults.panic_keypair.contains(name) {
            panic!("keypair service crashed on {name}");
        }
        if self.faults.fail_keypair.contains(name) {
            bail!("keypair quota exceeded");
        }
        self.record(Event::CreateKeypair(name.to_string())).await;
        Ok(Keypair::builder()
            .name(name)
            .private_key(format!("private-key-{name}"))
            .build())
    }

    async fn remove_keypair(&self, name: &str) -> Result<()> {
        self.record(Event::RemoveKeypair(name.to_string())).await;
        Ok(())
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance> {
        if self.faults.fail_instance.contains(spec.image()) {
            bail!("no valid host was found");
        }
        let instance = InstanceId::from(format!("instance-{}", spec.image()));
        let mut state = self.state.lock().await;
        state
            .instances
            .insert(instance.clone(), spec.image().clone());
        state.events.push(Event::CreateInstance {
            instance: instance.clone(),
            image: spec.image().clone(),
            user_data: String::from_utf8_lossy(spec.user_data()).into_owned(),
        });
        Ok(Instance::builder().id(instance).build())
    }

    async fn instance_active(&self, id: &InstanceId) -> Result<bool> {
        let state = self.state.lock().await;
        let image = state
            .instances
            .get(id)
            .ok_or_else(|| eyre!("no instance {id}"))?;
        Ok(!self.faults.never_active.contains(image))
    }

    async fn attach_floating_ip(&self, id: &InstanceId, address: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(image) = state.instances.get(id) {
            if self.faults.fail_attach.contains(image) {
                bail!("port for instance {id} is not ready");
            }
        }
        state.attached.insert(address.to_string(), id.clone());
        state
            .events
            .push(Event::AttachFip(id.clone(), address.to_string()));
        Ok(())
    }

    async fn remove_instance(&self, id: &InstanceId) -> Result<()> {
        if self.faults.fail_remove_instance {
            bail!("instance {id} is locked");
        }
        self.record(Event::RemoveInstance(id.clone())).await;
        Ok(())
    }

    async fn resolve_flavor(&self, name: &str) -> Result<FlavorId> {
        Ok(FlavorId::from(format!("flavor-id-{name}")))
    }
}

#[async_trait]
impl Network for FakeCloud {
    async fn acquire_floating_ip(&self, _network: &str) -> Result<FloatingIp> {
        let mut state = self.state.lock().await;
        state.fip_calls += 1;
        let n = state.fip_calls;
        if self.faults.fail_fip_call == Some(n) {
            bail!("floating ip pool exhausted");
        }

        let id = FloatingIpId::from(format!("fip-{n}"));
        state.events.push(Event::AcquireFip(id.clone()));
        Ok(FloatingIp::builder()
            .id(id)
            .address(format!("198.51.100.{n}"))
            .build())
    }

    async fn release_floating_ip(&self, id: &FloatingIpId) -> Result<()> {
        self.record(Event::ReleaseFip(id.clone())).await;
        Ok(())
    }
}

#[async_trait]
impl ImageRegistry for FakeCloud {
    async fn list_images(&self, substring: &str) -> Result<Vec<Image>> {
        Ok(self
            .state
            .lock()
            .await
            .images
            .values()
            .filter(|image| image.name().contains(substring))
            .cloned()
            .collect())
    }

    async fn fetch_image(&self, id: &ImageId) -> Result<Option<Image>> {
        Ok(self.state.lock().await.images.get(id).cloned())
    }

    async fn modify_property(
        &self,
        id: &ImageId,
        op: PropertyOp,
        key: &str,
        value: &str,
    ) -> Result<Image> {
        let mut state = self.state.lock().await;
        state.events.push(Event::ModifyProperty(
            id.clone(),
            op,
            key.to_string(),
            value.to_string(),
        ));
        let image = state
            .images
            .get_mut(id)
            .ok_or_else(|| eyre!("no image {id}"))?;
        let properties = image.properties_mut();
        match op {
            PropertyOp::Add if properties.contains(key) => bail!("{key} already exists"),
            PropertyOp::Replace | PropertyOp::Remove if !properties.contains(key) => {
                bail!("{key} does not exist")
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
        let mut state = self.state.lock().await;
        state.events.push(Event::DeleteImage(id.clone()));
        state
            .images
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| eyre!("no image {id}"))
    }

    async fn set_visibility(&self, id: &ImageId, visibility: Visibility) -> Result<()> {
        self.record(Event::SetVisibility(id.clone(), visibility))
            .await;
        Ok(())
    }
}

#[async_trait]
impl Remote for FakeCloud {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn Session>> {
        let state = self.state.lock().await;
        let instance = state
            .attached
            .get(target.host())
            .ok_or_else(|| eyre!("nothing attached at {}", target.host()))?;
        let image = state
            .instances
            .get(instance)
            .ok_or_else(|| eyre!("no instance {instance}"))?
            .clone();

        let report = self
            .faults
            .reports
            .get(&image)
            .cloned()
            .unwrap_or_else(|| b"{}".to_vec());
        Ok(Box::new(FakeSession {
            completes: !self.faults.never_completes.contains(&image),
            fail_close: self.faults.fail_close,
            image,
            report,
            state: self.state.clone(),
        }))
    }
}

#[async_trait]
impl ObjectStore for FakeCloud {
    async fn put(&self, key: &str, mut body: Box<dyn AsyncRead + Send + Unpin>) -> Result<()> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).await?;
        let mut state = self.state.lock().await;
        state.events.push(Event::Put(key.to_string()));
        state.objects.insert(key.to_string(), buf);
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        self.state
            .lock()
            .await
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| eyre!("no object at {key}"))
    }
}

struct FakeSession {
    image: ImageId,
    report: Vec<u8>,
    completes: bool,
    fail_close: bool,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Session for FakeSession {
    async fn copy_from_remote(&mut self, remote: &Path, local: &Path) -> Result<PathBuf> {
        if remote == Path::new(REMOTE_MARKER) {
            if !self.completes {
                bail!("{remote:?} does not exist");
            }
            tokio::fs::write(local, b"done\n").await?;
        } else if remote == Path::new(REMOTE_RESULTS) {
            tokio::fs::write(local, &self.report).await?;
        } else {
            bail!("{remote:?} does not exist");
        }
        Ok(local.to_path_buf())
    }

    async fn close_transfer(&mut self) -> Result<()> {
        self.state
            .lock()
            .await
            .events
            .push(Event::CloseTransfer(self.image.clone()));
        if self.fail_close {
            bail!("transfer channel already closed");
        }
        Ok(())
    }

    async fn close_shell(&mut self) -> Result<()> {
        self.state
            .lock()
            .await
            .events
            .push(Event::CloseShell(self.image.clone()));
        Ok(())
    }
}

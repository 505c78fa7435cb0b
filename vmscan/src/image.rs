//! Images held by the cloud image registry, and the metadata the pipeline reads and writes on them.

use std::collections::BTreeMap;

use derive_more::{Display, From};
use getset::Getters;
use serde::{Deserialize, Serialize};
use stable_eyre::{eyre::Context, Result};
use strum::{AsRefStr, Display as StrumDisplay};
use typed_builder::TypedBuilder;

use crate::{api::ImageRegistry, error::MissingImage};

/// The default property key under which the scan classification is recorded.
pub const DEFAULT_TAG_KEY: &str = "security_scan";

/// Identifies an image in the registry. This is an opaque string.
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Deserialize, Serialize,
)]
pub struct ImageId(String);

impl From<&str> for ImageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl ImageId {
    /// View the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The property bag attached to an image.
///
/// Registries store arbitrary values here; the pipeline only ever reads and writes strings,
/// so that's all this type admits.
#[derive(Clone, Eq, PartialEq, Debug, Default, From, Deserialize, Serialize)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    /// Look up a property.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether the property is set.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Set a property, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Remove a property, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// An image in the registry.
#[derive(Clone, Eq, PartialEq, Debug, Getters, TypedBuilder, Deserialize, Serialize)]
#[getset(get = "pub")]
pub struct Image {
    /// The registry's identifier for the image.
    #[builder(setter(into))]
    id: ImageId,

    /// The human readable name.
    #[builder(setter(into))]
    name: String,

    /// Arbitrary metadata on the image.
    #[builder(default)]
    properties: Properties,
}

impl Image {
    /// Mutable access to the property bag, for registries applying an update.
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }
}

/// Who may boot an image.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, StrumDisplay, AsRefStr, clap::ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum Visibility {
    /// Every tenant.
    Public,
    /// Only the owning tenant.
    Private,
}

/// How a property write is applied to the property bag.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, StrumDisplay, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum PropertyOp {
    /// Create a property that doesn't exist yet.
    Add,
    /// Overwrite a property that already exists.
    Replace,
    /// Delete a property.
    Remove,
}

impl PropertyOp {
    /// Pick the write operation for `key`: registries reject `Replace` on a missing key
    /// and `Add` on an existing one, so the current properties must be checked first.
    pub fn for_key(properties: &Properties, key: &str) -> Self {
        if properties.contains(key) {
            Self::Replace
        } else {
            Self::Add
        }
    }
}

/// Compose a property key, namespacing it under `prefix` when one is configured.
pub fn property_key(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}:{key}"),
        _ => key.to_string(),
    }
}

/// Chooses which images a run processes.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Selector {
    /// Exactly the image with this id.
    Id(ImageId),
    /// Every image whose name contains this substring.
    Search(String),
}

impl Selector {
    /// Resolve the selector into images using the registry.
    pub async fn resolve(&self, registry: &dyn ImageRegistry) -> Result<Vec<Image>> {
        match self {
            Selector::Id(id) => {
                let image = registry
                    .fetch_image(id)
                    .await
                    .with_context(|| format!("fetch image {id}"))?
                    .ok_or_else(|| MissingImage { id: id.clone() })?;
                Ok(vec![image])
            }
            Selector::Search(substring) => registry
                .list_images(substring)
                .await
                .with_context(|| format!("search images matching '{substring}'")),
        }
    }
}

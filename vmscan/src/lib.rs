//! The library portion of the VM image scanner.
//!
//! The overall process for a run is as follows:
//!
//! 1. The images to scan are resolved from the image registry, either a single image by id
//!    or every image whose name contains a search string.
//! 2. A boot script is generated once for the run. It installs the scanner, scans the root
//!    filesystem of the instance it runs on, and writes the results followed by a completion marker.
//! 3. Images are handed to a fixed pool of workers. Each worker scans one image at a time.
//! 4. Once every image has been processed, any per-image failures are reported together.
//!
//! Scanning a single image (step 3) is also composed of multiple steps:
//!
//! 1. A keypair and a floating IP are created, then an instance is booted from the image
//!    with the boot script.
//! 2. Once the instance is active and reachable, the job connects to it
//!    and waits for the scanner's completion marker.
//! 3. The results document is copied locally, parsed, and the image is classified
//!    as `passed` (no findings) or `failed`.
//! 4. The classification is recorded on the image as a property, or the image is deleted
//!    if configured to do so; visibility follows the classification unless overridden.
//! 5. The normalized results are uploaded to object storage.
//! 6. The instance, keypair and floating IP are removed. This happens on failure too.
//!
//! The cloud itself is reached only through the capability traits in [`api`].

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(clippy::unwrap_used)]

pub mod api;
pub mod config;
pub mod error;
pub mod image;
pub mod job;
pub mod orchestrator;
pub mod resources;
pub mod userdata;

//! # virtkit Hypervisor
//!
//! VM management over libvirt-style hypervisor control planes.
//!
//! The crate turns named profiles into validated domain and volume
//! documents, reads live domain descriptors back into structured device
//! information and aggregates per-VM and host statistics:
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 VirtManager                   │
//! │   (init, purge, setmem, lifecycle, stats)     │
//! └──────┬──────────────┬──────────────┬──────────┘
//!        ▼              ▼              ▼
//! ┌─────────────┐ ┌───────────┐ ┌───────────────┐
//! │ Profile     │ │ Document  │ │ Descriptor    │
//! │ Resolver    │ │ Builders  │ │ Parser, Stats │
//! └─────────────┘ └───────────┘ └───────┬───────┘
//!                                       ▼
//!                           ┌───────────────────────┐
//!                           │   Hypervisor Trait    │
//!                           ├───────────┬───────────┤
//!                           │  Libvirt  │   Mock    │
//!                           └───────────┴───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use virtkit_hypervisor::{HypervisorFamily, InitRequest, MockBackend, ProfileSettings, VirtManager};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = Arc::new(MockBackend::new());
//!     let manager = VirtManager::new(backend, HypervisorFamily::Kvm, ProfileSettings::default());
//!
//!     manager.init(InitRequest::new("web01", 2, 1024)).await.unwrap();
//!     println!("{:?}", manager.stats().vm_info(Some("web01")).await.unwrap());
//! }
//! ```

pub mod descriptor;
pub mod error;
pub mod family;
pub mod image;
pub mod libvirt;
pub mod manager;
pub mod mock;
pub mod profile;
pub mod provision;
pub mod stats;
pub mod traits;
pub mod types;
pub mod xml;

pub use descriptor::{DomainDescriptor, InterfaceDescriptor};
pub use error::{HypervisorError, Result};
pub use family::{FamilyProfile, HypervisorFamily};
pub use image::{DiskDetails, ImageInfo, ImageInspector, QemuImgInspector};
pub use manager::{InitOutcome, InitRequest, VirtManager};
pub use mock::MockBackend;
pub use profile::{MacOverrides, ProfileCatalog, ProfileResolver, ProfileSettings};
pub use provision::{ImageProvisioner, LocalProvisioner};
pub use stats::{CpuTime, FullInfo, PerVm, StatsAggregator, VmInfo, VmState};
pub use traits::Hypervisor;
pub use types::*;
pub use xml::{DomainDocumentBuilder, SerialTemplateRegistry, VolumeDocumentBuilder};

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtBackend;

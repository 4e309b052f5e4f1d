//! Libvirt control-plane backend.
//!
//! Requires the `libvirt` feature and a system libvirt installation.

#[cfg(feature = "libvirt")]
mod backend;

#[cfg(feature = "libvirt")]
pub use backend::LibvirtBackend;

/// Check if the libvirt backend is compiled in.
pub fn is_available() -> bool {
    cfg!(feature = "libvirt")
}

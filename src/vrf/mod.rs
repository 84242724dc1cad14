//! VRF keypairs and VRF/Poisson-seeded delay injection.

#[cfg(feature = "vrf")]
pub mod keypair;
pub mod poisson_delay;

#[cfg(feature = "vrf")]
pub use keypair::VrfKeyPair;
pub use poisson_delay::{DelayInjector, PoissonDelayGenerator};

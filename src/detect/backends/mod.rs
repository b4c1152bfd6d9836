pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{StubAccelerator, StubConfig, StubControl};

#[cfg(feature = "backend-tract")]
pub use tract::{TractAccelerator, TractConfig};

//! layerbake: cached, dependency-scheduled container image builds
//!
//! Turns an application's build output into image layers, keeps them in a
//! local cache that tracks staleness per layer, and publishes the image to
//! a Docker Registry V2 endpoint.
//!
//! # Key Features
//!
//! - **Task graph**: every build phase is an [`step::AsyncStep`] that starts
//!   once its dependencies finish, so independent layers build and push
//!   concurrently
//! - **Layer cache**: unchanged layers are reused across builds
//! - **Registry client**: manifest and blob transfer with bearer-token auth
//!
//! # Example
//!
//! ```no_run
//! use layerbake::{build::ImageBuild, spec::load_spec};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let spec = load_spec("layerbake.yaml".as_ref())?;
//!     let report = ImageBuild::new(spec)?.run()?;
//!     println!("pushed {} ({})", report.image, report.manifest_digest);
//!     Ok(())
//! }
//! ```

pub mod build;
pub mod error;
pub mod spec;
pub mod step;

pub use error::{Error, Result};

/// Image, cache and registry building blocks.
pub use layerbake_oci as oci;

//! # Conveyor API
//!
//! Contracts shared between the `conveyor` runtime and the code plugged into
//! it. Stage implementations, package factories, filters and observers only
//! need this crate.
//!
//! ## Core Components
//!
//! - **Work packages**: [`WorkPackage`] with its [`PackageId`] and
//!   [`ProcessFlags`]
//! - **Stages**: the [`Stage`] trait and the [`Outlet`] a stage reports
//!   completion through
//! - **Lifecycle**: [`ActorState`], [`DeactivatingMode`] and [`Priority`]
//! - **Intake**: [`PackageFactory`] and [`Filter`]
//! - **Notifications**: [`PipelineEvent`], [`Observer`] and [`PipelineSignal`]
//!
//! ## Usage Example
//!
//! ```rust
//! use conveyor_api::{Outlet, Stage, WorkPackage};
//!
//! struct Uppercase;
//!
//! impl Stage for Uppercase {
//!     type Payload = String;
//!
//!     fn process(&mut self, mut package: WorkPackage<String>, outlet: &Outlet<String>) {
//!         let upper = package.payload().to_uppercase();
//!         *package.payload_mut() = upper;
//!         outlet.emit(package);
//!     }
//! }
//! ```

pub mod events;
pub mod intake;
pub mod package;
pub mod priority;
pub mod stage;
pub mod state;

pub use events::{Observer, PipelineEvent, PipelineSignal};
pub use intake::{Filter, PackageFactory};
pub use package::{PackageId, ProcessFlags, WorkPackage};
pub use priority::Priority;
pub use stage::{Interrupt, Outlet, Route, Stage};
pub use state::{ActorState, DeactivatingMode};

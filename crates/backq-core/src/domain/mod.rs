//! Domain model (ids, key names, tunables, progress records, package state, errors).

pub mod config;
pub mod errors;
pub mod events;
pub mod ids;
pub mod progress;
pub mod state;

pub use self::config::{ConstantKey, ConstantsSet, EventKeyNames, ProcessPlan, TimedKey, UnknownConstantKey};
pub use self::errors::{BackqError, StoreError};
pub use self::events::{KeyEvent, KeyEventKind};
pub use self::ids::{CapturedPackage, PackageId, ServerId};
pub use self::progress::{NOT_STARTED, PackageProgress, TaskProgress};
pub use self::state::PackageState;

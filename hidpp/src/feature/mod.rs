//! Specific device feature implementations.
//!
//! A feature client is a cheap handle holding the session and the feature
//! index. Clients are created through [`Device::get_feature`], which resolves
//! the index once per session.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::{device::Device, transport::TransactError};

pub mod adjustable_dpi;
pub mod change_host;
pub mod device_name;
pub mod registry;
pub mod root;
pub mod smartshift;
pub mod wireless_device_status;

/// Represents a concrete implementation of a HID++2.0 device feature.
pub trait Feature: Send + Sync {
    fn device(&self) -> &Arc<Device>;

    /// The index of the feature in the feature table of the device.
    fn index(&self) -> u8;
}

/// Represents a [`Feature`] that can be instantiated automatically.
pub trait CreatableFeature: Feature + Sized {
    /// The protocol ID of the implemented feature.
    const ID: u16;

    /// Creates a new instance of the feature implementation.
    ///
    /// Clients covering several versions of a feature may query the device
    /// here to pick the functions they use.
    fn attach(device: Arc<Device>, index: u8) -> Result<Self, FeatureError>;
}

/// Attaches a feature client, logging and omitting features the device does
/// not support.
pub fn attach<F: CreatableFeature>(device: &Arc<Device>) -> Option<F> {
    match device.get_feature::<F>() {
        Ok(feature) => Some(feature),
        Err(FeatureError::Unsupported(id)) => {
            debug!(
                name = %device.name(),
                feature = %registry::describe(id),
                "feature not supported, omitting"
            );
            None
        },
        Err(err) => {
            warn!(
                name = %device.name(),
                feature = %registry::describe(F::ID),
                %err,
                "could not attach feature"
            );
            None
        },
    }
}

/// The type flags a device reports for every feature in the root feature's
/// `getFeature` reply.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FeatureType {
    /// Superseded by a newer feature, still listed for older software.
    pub obsolete: bool,

    /// Not meant to be exposed in user configuration tools.
    pub hidden: bool,

    /// Reserved for testing and manufacturing.
    pub engineering: bool,
}

impl FeatureType {
    const OBSOLETE: u8 = 1 << 7;
    const HIDDEN: u8 = 1 << 6;
    const ENGINEERING: u8 = 1 << 5;
}

impl From<u8> for FeatureType {
    fn from(flags: u8) -> Self {
        Self {
            obsolete: flags & Self::OBSOLETE != 0,
            hidden: flags & Self::HIDDEN != 0,
            engineering: flags & Self::ENGINEERING != 0,
        }
    }
}

/// Represents an error that occurred when using a feature.
#[derive(Debug, Error)]
pub enum FeatureError {
    /// The device does not have the feature with the given ID.
    #[error("the device does not support feature {}", registry::describe(*.0))]
    Unsupported(u16),

    #[error("a transaction with the device failed")]
    Transact(#[from] TransactError),

    /// The device answered with data that could not be interpreted.
    #[error("the device returned an unsupported response")]
    UnsupportedResponse,
}

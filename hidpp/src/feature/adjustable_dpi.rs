//! Implements the `AdjustableDpi` / `0x2201` feature.

use std::sync::Arc;

use super::{CreatableFeature, Feature, FeatureError};
use crate::{device::Device, nibble::U4};

/// Marks an entry of the DPI list as the step of a range. The lower 13 bits
/// hold the step width.
const RANGE_STEP_MARKER: u16 = 0b111 << 13;

/// Reads and changes the sensor resolution of a mouse.
#[derive(Clone, Debug)]
pub struct AdjustableDpi {
    device: Arc<Device>,
    index: u8,
}

impl CreatableFeature for AdjustableDpi {
    const ID: u16 = 0x2201;

    fn attach(device: Arc<Device>, index: u8) -> Result<Self, FeatureError> {
        Ok(Self { device, index })
    }
}

impl Feature for AdjustableDpi {
    fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn index(&self) -> u8 {
        self.index
    }
}

impl AdjustableDpi {
    pub fn sensor_count(&self) -> Result<u8, FeatureError> {
        Ok(self.device.transact(self.index, U4::from_lo(0), &[])?[0])
    }

    /// Retrieves the resolutions a sensor supports.
    pub fn dpi_list(&self, sensor: u8) -> Result<DpiList, FeatureError> {
        let payload = self.device.transact(self.index, U4::from_lo(1), &[sensor])?;
        Ok(DpiList::parse(&payload[1..]))
    }

    /// Retrieves the current and the default resolution of a sensor.
    pub fn dpi(&self, sensor: u8) -> Result<SensorDpi, FeatureError> {
        let payload = self.device.transact(self.index, U4::from_lo(2), &[sensor])?;

        let current = u16::from_be_bytes([payload[1], payload[2]]);
        let default = u16::from_be_bytes([payload[3], payload[4]]);
        Ok(SensorDpi {
            current,
            // Older devices leave the default empty.
            default: if default == 0 { current } else { default },
        })
    }

    pub fn set_dpi(&self, sensor: u8, dpi: u16) -> Result<(), FeatureError> {
        let [hi, lo] = dpi.to_be_bytes();
        self.device
            .transact(self.index, U4::from_lo(3), &[sensor, hi, lo])?;
        Ok(())
    }
}

/// The current and default resolution of a sensor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SensorDpi {
    pub current: u16,
    pub default: u16,
}

/// The resolutions a sensor supports.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DpiList {
    /// Discrete values, or the bounds of the range if [`Self::step`] is set.
    pub values: Vec<u16>,

    /// Set if every multiple of the step between the first and last value is
    /// supported.
    pub step: Option<u16>,
}

impl DpiList {
    /// Parses the big endian list a device returns, terminated by a zero.
    fn parse(raw: &[u8]) -> Self {
        let mut list = Self::default();

        for pair in raw.chunks_exact(2) {
            let value = u16::from_be_bytes([pair[0], pair[1]]);
            if value == 0 {
                break;
            }

            if value & RANGE_STEP_MARKER == RANGE_STEP_MARKER {
                list.step = Some(value & !RANGE_STEP_MARKER);
            } else {
                list.values.push(value);
            }
        }

        list
    }

    /// Picks the supported resolution closest to `dpi`.
    pub fn closest(&self, dpi: u16) -> Option<u16> {
        let (&min, &max) = (self.values.first()?, self.values.last()?);

        if let Some(step) = self.step.filter(|&step| step > 0) {
            let clamped = dpi.clamp(min, max);
            let steps = (clamped - min + step / 2) / step;
            return Some((min + steps * step).min(max));
        }

        self.values
            .iter()
            .copied()
            .min_by_key(|&value| value.abs_diff(dpi))
    }
}

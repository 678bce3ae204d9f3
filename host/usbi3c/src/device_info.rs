// Licensed under the Apache-2.0 license

use crate::error::{StateError, UsbI3cResult};
use usbi3c_common::message::capability::{CapabilityDataType, DeviceRole, I3cCapability};
use usbi3c_common::protocol::requests::FeatureSelector;

/// What the USB I3C function reported through GET_I3C_CAPABILITY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapability {
    /// False when the device answered "no capability data".
    pub has_capability_data: bool,
    pub device_role: DeviceRole,
    pub data_type: CapabilityDataType,
    pub handoff_controller_role: bool,
    pub hot_join: bool,
    pub in_band_interrupt: bool,
    pub pending_read: bool,
    pub self_initiated: bool,
    pub delayed_pending_read: bool,
    pub supported_hdr_modes: u8,
    pub max_ibi_payload_size: u32,
    pub mipi_version: (u8, u8),
    pub disco_version: (u8, u8),
}

impl From<&I3cCapability> for DeviceCapability {
    fn from(capability: &I3cCapability) -> Self {
        let header = &capability.header;
        let flags = header.capability_flags;
        DeviceCapability {
            has_capability_data: capability.has_capability_data(),
            device_role: capability.device_role(),
            data_type: capability.data_type(),
            handoff_controller_role: flags.handoff_controller_role(),
            hot_join: flags.hot_join(),
            in_band_interrupt: flags.in_band_interrupt(),
            pending_read: flags.pending_read(),
            self_initiated: flags.self_initiated(),
            delayed_pending_read: flags.delayed_pending_read(),
            supported_hdr_modes: header.supported_hdr_modes,
            max_ibi_payload_size: header.max_ibi_payload_size.get(),
            mipi_version: (header.mipi_major_version, header.mipi_minor_version),
            disco_version: (header.disco_major_version, header.disco_minor_version),
        }
    }
}

impl DeviceCapability {
    pub fn is_controller_capable(&self) -> bool {
        self.device_role == DeviceRole::PrimaryController
    }

    fn supports(&self, feature: FeatureSelector) -> bool {
        match feature {
            FeatureSelector::I3cBus => true,
            FeatureSelector::I3cControllerRoleHandoff
            | FeatureSelector::I3cControllerRoleRequestWake => self.handoff_controller_role,
            FeatureSelector::RegularIbi | FeatureSelector::RegularIbiWake => {
                self.in_band_interrupt
            }
            FeatureSelector::HotJoin | FeatureSelector::HotJoinWake => self.hot_join,
            FeatureSelector::HdrModeExitRecovery => self.supported_hdr_modes != 0,
        }
    }
}

/// Features currently enabled on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub active_i3c_controller: bool,
    pub i3c_bus: bool,
    pub controller_role_handoff: bool,
    pub regular_ibi: bool,
    pub hot_join: bool,
    pub regular_ibi_wake: bool,
    pub hot_join_wake: bool,
    pub controller_role_request_wake: bool,
}

impl DeviceState {
    pub fn set_feature(&mut self, feature: FeatureSelector, enabled: bool) {
        match feature {
            FeatureSelector::I3cBus => self.i3c_bus = enabled,
            FeatureSelector::I3cControllerRoleHandoff => self.controller_role_handoff = enabled,
            FeatureSelector::RegularIbi => self.regular_ibi = enabled,
            FeatureSelector::HotJoin => self.hot_join = enabled,
            FeatureSelector::RegularIbiWake => self.regular_ibi_wake = enabled,
            FeatureSelector::HotJoinWake => self.hot_join_wake = enabled,
            FeatureSelector::I3cControllerRoleRequestWake => {
                self.controller_role_request_wake = enabled
            }
            // One-shot request, nothing stays enabled.
            FeatureSelector::HdrModeExitRecovery => {}
        }
    }

    pub fn is_enabled(&self, feature: FeatureSelector) -> bool {
        match feature {
            FeatureSelector::I3cBus => self.i3c_bus,
            FeatureSelector::I3cControllerRoleHandoff => self.controller_role_handoff,
            FeatureSelector::RegularIbi => self.regular_ibi,
            FeatureSelector::HotJoin => self.hot_join,
            FeatureSelector::RegularIbiWake => self.regular_ibi_wake,
            FeatureSelector::HotJoinWake => self.hot_join_wake,
            FeatureSelector::I3cControllerRoleRequestWake => self.controller_role_request_wake,
            FeatureSelector::HdrModeExitRecovery => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// `None` until GET_I3C_CAPABILITY has been answered.
    pub capability: Option<DeviceCapability>,
    pub state: DeviceState,
}

impl DeviceInfo {
    /// Checks that `feature` may be changed right now.
    pub fn check_feature(&self, feature: FeatureSelector) -> UsbI3cResult<()> {
        let capability = self
            .capability
            .as_ref()
            .ok_or(StateError::CapabilitiesUnknown)?;
        if !self.state.active_i3c_controller {
            return Err(StateError::NotActiveController.into());
        }
        if !capability.supports(feature) {
            return Err(StateError::FeatureNotSupported(feature).into());
        }
        Ok(())
    }

    /// Checks that the device currently manages the bus.
    pub fn check_active_controller(&self) -> UsbI3cResult<()> {
        if self.capability.is_none() {
            return Err(StateError::CapabilitiesUnknown.into());
        }
        if !self.state.active_i3c_controller {
            return Err(StateError::NotActiveController.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UsbI3cError;
    use usbi3c_common::message::capability::CapabilityFlags;

    fn capability_with_hot_join() -> DeviceCapability {
        let mut flags = CapabilityFlags([0; 2]);
        flags.set_hot_join(true);
        DeviceCapability::from(&I3cCapability::new(
            DeviceRole::PrimaryController,
            flags,
            16,
            vec![],
        ))
    }

    #[test]
    fn test_no_capability_data_defaults_to_controller() {
        let capability = DeviceCapability::from(&I3cCapability::without_data());
        assert!(!capability.has_capability_data);
        assert!(capability.is_controller_capable());
        assert!(!capability.hot_join);
    }

    #[test]
    fn test_feature_checks() {
        let mut info = DeviceInfo::default();
        assert_eq!(
            info.check_feature(FeatureSelector::HotJoin),
            Err(UsbI3cError::State(StateError::CapabilitiesUnknown))
        );

        info.capability = Some(capability_with_hot_join());
        assert_eq!(
            info.check_feature(FeatureSelector::HotJoin),
            Err(UsbI3cError::State(StateError::NotActiveController))
        );

        info.state.active_i3c_controller = true;
        assert!(info.check_feature(FeatureSelector::HotJoin).is_ok());
        assert_eq!(
            info.check_feature(FeatureSelector::RegularIbi),
            Err(UsbI3cError::State(StateError::FeatureNotSupported(
                FeatureSelector::RegularIbi
            )))
        );
    }

    #[test]
    fn test_feature_state_tracking() {
        let mut state = DeviceState::default();
        state.set_feature(FeatureSelector::HotJoinWake, true);
        state.set_feature(FeatureSelector::HdrModeExitRecovery, true);
        assert!(state.is_enabled(FeatureSelector::HotJoinWake));
        assert!(!state.is_enabled(FeatureSelector::HotJoin));
        assert!(!state.is_enabled(FeatureSelector::HdrModeExitRecovery));
    }
}

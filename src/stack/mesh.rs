use bon::Builder;

use crate::proto::MeshInit;

/// Maximum capacity of the replay protection list.
const DEFAULT_CRPL_SIZE: u16 = 10;

/// Mesh provisioning parameters mirrored from the PIXIT set.
///
/// Demonstrates how a profile bolts its own sub-state onto the device
/// mirror; the values feed the mesh init command verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct MeshState {
    #[builder(default)]
    pub device_uuid: [u8; 16],
    #[builder(default)]
    pub static_oob: [u8; 16],
    #[builder(default)]
    pub output_size: u8,
    #[builder(default)]
    pub output_actions: u16,
    #[builder(default)]
    pub input_size: u8,
    #[builder(default)]
    pub input_actions: u16,
    #[builder(default = DEFAULT_CRPL_SIZE)]
    pub crpl_size: u16,
    /// Set once the init command has been acknowledged.
    #[builder(default)]
    pub initialised: bool,
}

impl Default for MeshState {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MeshState {
    /// Builds the init command carrying these capabilities.
    #[must_use]
    pub fn to_init(&self) -> MeshInit {
        let Self {
            device_uuid,
            static_oob,
            output_size,
            output_actions,
            input_size,
            input_actions,
            crpl_size,
            initialised: _,
        } = self;
        MeshInit {
            device_uuid: *device_uuid,
            static_oob: *static_oob,
            output_size: *output_size,
            output_actions: *output_actions,
            input_size: *input_size,
            input_actions: *input_actions,
            crpl_size: *crpl_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::proto::Command;

    use super::*;

    #[test]
    fn defaults_mirror_an_unprovisioned_node() {
        let state = MeshState::default();
        assert_eq!([0u8; 16], state.device_uuid);
        assert_eq!([0u8; 16], state.static_oob);
        assert_eq!(0, state.output_size);
        assert_eq!(DEFAULT_CRPL_SIZE, state.crpl_size);
        assert!(!state.initialised);
    }

    #[test]
    fn init_command_carries_the_configured_capabilities() {
        let state = MeshState::builder()
            .device_uuid([0xAB; 16])
            .output_size(2)
            .output_actions(0x0008)
            .build();

        let init = state.to_init();
        let payload = init.payload();
        assert_eq!(40, payload.len());
        assert_eq!([0xAB; 16], payload[..16]);
        assert_eq!(2, payload[32]);
        assert_eq!([0x08, 0x00], payload[33..35]);
    }
}

use crate::proto::{Command, MeshOp, Service};

/// Provisioning capabilities handed to the Mesh service when it starts.
///
/// Payload layout: `device UUID (16) | static OOB (16) | output size (u8) |
/// output actions (u16 LE) | input size (u8) | input actions (u16 LE) |
/// CRPL size (u16 LE)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshInit {
    pub device_uuid: [u8; 16],
    pub static_oob: [u8; 16],
    pub output_size: u8,
    pub output_actions: u16,
    pub input_size: u8,
    pub input_actions: u16,
    pub crpl_size: u16,
}

impl Command for MeshInit {
    const SERVICE: Service = Service::Mesh;
    type Reply = ();

    fn opcode(&self) -> u8 {
        MeshOp::Init as u8
    }

    fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(40);
        payload.extend_from_slice(&self.device_uuid);
        payload.extend_from_slice(&self.static_oob);
        payload.push(self.output_size);
        payload.extend_from_slice(&self.output_actions.to_le_bytes());
        payload.push(self.input_size);
        payload.extend_from_slice(&self.input_actions.to_le_bytes());
        payload.extend_from_slice(&self.crpl_size.to_le_bytes());
        payload
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn init_payload_layout() {
        let command = MeshInit {
            device_uuid: [0x11; 16],
            static_oob: [0x22; 16],
            output_size: 2,
            output_actions: 0x0102,
            input_size: 1,
            input_actions: 0x0304,
            crpl_size: 10,
        };

        let payload = command.payload();
        assert_eq!(40, payload.len());
        assert_eq!([0x11; 16], payload[..16]);
        assert_eq!([0x22; 16], payload[16..32]);
        assert_eq!([0x02, 0x02, 0x01, 0x01, 0x04, 0x03, 0x0A, 0x00], payload[32..]);
    }

    #[test]
    fn init_carries_mesh_service_and_opcode() {
        let command = MeshInit {
            device_uuid: [0; 16],
            static_oob: [0; 16],
            output_size: 0,
            output_actions: 0,
            input_size: 0,
            input_actions: 0,
            crpl_size: 0,
        };

        assert_eq!(Service::Mesh, MeshInit::SERVICE);
        assert_eq!(MeshOp::Init as u8, command.opcode());
    }
}

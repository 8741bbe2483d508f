// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hermes packet decoding.
//!
//! Hermes is the unicast NoC: every packet begins with a fixed 4-byte
//! header, followed by a service-specific fixed body, optionally followed
//! by a variable-length payload the body's own fields size (a migration
//! payload, a delivered message). This module drains the header and body
//! off the DMNI and builds the tagged `abi::Packet` the rest of the kernel
//! switches on; draining any trailing payload is left to the caller, since
//! only it knows where that payload should land.

use core::convert::TryFrom;
use core::mem::size_of;

use abi::{
    AbortTaskBody, AllocationBody, HandshakeBody, HermesHeader, KernelError, MigrationDataBody,
    MigrationHandshakeBody, MigrationPipeBody, MigrationStackBody, MigrationTaskLocationBody,
    MigrationTcbBody, MigrationTextBody, Packet, Service, TaskMigrationBody, TaskReleaseBody,
};
use zerocopy::FromBytes;

use crate::arch::DmniHal;
use crate::dmni::Dmni;
use crate::FLIT_SIZE;

fn flit_round(size: usize) -> usize {
    (size + FLIT_SIZE - 1) / FLIT_SIZE * FLIT_SIZE
}

/// Bodies not already a flit multiple (`AbortTaskBody`, for one) are sent
/// padded to the next one -- see `rpc::send_abort_task`. Draining the
/// padded length here and decoding only the logical prefix keeps both sides
/// in step without every body needing to be hand-sized to a multiple of 4.
fn read_body<T: FromBytes + Copy>(dmni: &mut Dmni<impl DmniHal>) -> Result<T, KernelError> {
    let mut buf = [0u8; 256];
    let size = size_of::<T>();
    dmni.recv(&mut buf[..flit_round(size)])?;
    T::read_from(&buf[..size]).ok_or(KernelError::BadMessage)
}

/// Drains one Hermes header plus its fixed body from the DMNI and decodes
/// it into a `Packet`. Returns `KernelError::BadMessage` for a service code
/// with no known body shape (a corrupted header, or a broadcast-only
/// service misdelivered on the unicast network).
pub fn decode(dmni: &mut Dmni<impl DmniHal>) -> Result<Packet, KernelError> {
    let mut hdr_buf = [0u8; size_of::<HermesHeader>()];
    dmni.recv(&mut hdr_buf)?;
    let header = HermesHeader::read_from(&hdr_buf[..]).ok_or(KernelError::BadMessage)?;

    let service = Service::try_from(header.service).map_err(|_| KernelError::BadMessage)?;

    Ok(match service {
        Service::DataAv => Packet::DataAv {
            header,
            body: read_body::<HandshakeBody>(dmni)?,
        },
        Service::MessageRequest => Packet::MessageRequest {
            header,
            body: read_body::<HandshakeBody>(dmni)?,
        },
        Service::MessageDelivery => Packet::MessageDelivery {
            header,
            body: read_body(dmni)?,
        },
        Service::TaskAllocation => Packet::TaskAllocation {
            header,
            body: read_body::<AllocationBody>(dmni)?,
        },
        Service::MigrationText => Packet::MigrationText {
            header,
            body: read_body::<MigrationTextBody>(dmni)?,
        },
        Service::MigrationData => Packet::MigrationData {
            header,
            body: read_body::<MigrationDataBody>(dmni)?,
        },
        Service::MigrationStack => Packet::MigrationStack {
            header,
            body: read_body::<MigrationStackBody>(dmni)?,
        },
        Service::MigrationHdshk => Packet::MigrationHdshk {
            header,
            body: read_body::<MigrationHandshakeBody>(dmni)?,
        },
        Service::MigrationPipe => Packet::MigrationPipe {
            header,
            body: read_body::<MigrationPipeBody>(dmni)?,
        },
        Service::MigrationTaskLocation => Packet::MigrationTaskLocation {
            header,
            body: read_body::<MigrationTaskLocationBody>(dmni)?,
        },
        Service::MigrationTcb => Packet::MigrationTcb {
            header,
            body: read_body::<MigrationTcbBody>(dmni)?,
        },
        Service::TaskRelease => Packet::TaskRelease {
            header,
            body: read_body::<TaskReleaseBody>(dmni)?,
        },
        Service::AbortTask => Packet::AbortTask {
            header,
            body: read_body::<AbortTaskBody>(dmni)?,
        },
        Service::TaskMigration => Packet::TaskMigration {
            header,
            body: read_body::<TaskMigrationBody>(dmni)?,
        },
        _ => return Err(KernelError::BadMessage),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::FakeDmni;
    use abi::TaskId;
    use zerocopy::AsBytes;

    fn header(service: Service) -> HermesHeader {
        HermesHeader {
            address: 0x0102,
            service: service as u8,
            flags: 0,
        }
    }

    #[test]
    fn decodes_data_av() {
        let mut dmni = Dmni::new(FakeDmni::default());
        let body = HandshakeBody {
            source: 7,
            receiver: TaskId::for_app_and_index(1, 0),
            sender: TaskId::KERNEL,
        };
        let mut bytes = std::vec::Vec::new();
        bytes.extend_from_slice(header(Service::DataAv).as_bytes());
        bytes.extend_from_slice(body.as_bytes());
        dmni.hal_mut().recv_buf = bytes;

        match decode(&mut dmni).unwrap() {
            Packet::DataAv { body: got, .. } => assert_eq!(got, body),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_service_is_bad_message() {
        let mut dmni = Dmni::new(FakeDmni::default());
        let mut bytes = std::vec::Vec::new();
        bytes.extend_from_slice(header(Service::AnnounceMonitor).as_bytes());
        dmni.hal_mut().recv_buf = bytes;
        assert_eq!(decode(&mut dmni), Err(KernelError::BadMessage));
    }
}

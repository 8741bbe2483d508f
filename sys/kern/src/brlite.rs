// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BrLite adapter: the broadcast NoC.
//!
//! Unlike Hermes, BrLite carries a single fixed-shape packet: one service
//! byte, the sending tile's address, and a 16-bit payload. There is no
//! variable-length follow-on -- broadcast services are control signals
//! (`HALT_PE`, `PE_HALTED`, `APP_TERMINATED`, monitor announcements), never
//! bulk data.

use core::convert::TryFrom;

use abi::{BrlitePacket, KernelError, Service, TileAddr};

use crate::arch::BrliteHal;

pub struct Brlite<H> {
    hal: H,
}

impl<H: BrliteHal> Brlite<H> {
    pub fn new(hal: H) -> Self {
        Self { hal }
    }

    pub fn recv_pending(&self) -> bool {
        self.hal.recv_pending()
    }

    /// Drains one broadcast packet, decoding its service byte. An unknown
    /// service code is reported rather than silently dropped -- the caller
    /// decides whether that is worth logging.
    pub fn recv(&mut self) -> Result<(Service, BrlitePacket), KernelError> {
        let (service, src_addr, payload) = self.hal.recv();
        let pkt = BrlitePacket {
            service,
            src_addr,
            payload,
        };
        let svc = Service::try_from(service).map_err(|_| KernelError::BadMessage)?;
        Ok((svc, pkt))
    }

    /// Sends a broadcast packet. Returns `KernelError::Retry(Blocked::
    /// DmniBusy)` if the broadcast channel is already sending.
    pub fn send(&mut self, service: Service, payload: u16) -> Result<(), KernelError> {
        if self.hal.send_busy() {
            return Err(KernelError::Retry(abi::Blocked::DmniBusy));
        }
        if !self.hal.send(service as u8, payload) {
            return Err(KernelError::Retry(abi::Blocked::DmniBusy));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::FakeBrlite;

    #[test]
    fn send_reports_busy() {
        let mut b = Brlite::new(FakeBrlite {
            send_busy: true,
            recv_pending: false,
            recv_value: (0, TileAddr::new(0, 0), 0),
            sent: None,
        });
        assert_eq!(
            b.send(Service::HaltPe, 0),
            Err(KernelError::Retry(abi::Blocked::DmniBusy))
        );
    }

    #[test]
    fn recv_decodes_known_service() {
        let mut b = Brlite::new(FakeBrlite {
            send_busy: false,
            recv_pending: true,
            recv_value: (Service::PeHalted as u8, TileAddr::new(3, 4), 0xBEEF),
            sent: None,
        });
        let (svc, pkt) = b.recv().unwrap();
        assert_eq!(svc, Service::PeHalted);
        assert_eq!(pkt.src_addr, TileAddr::new(3, 4));
        assert_eq!(pkt.payload, 0xBEEF);
    }

    #[test]
    fn recv_reports_unknown_service() {
        let mut b = Brlite::new(FakeBrlite {
            send_busy: false,
            recv_pending: true,
            recv_value: (0xEE, TileAddr::new(0, 0), 0),
            sent: None,
        });
        assert_eq!(b.recv(), Err(KernelError::BadMessage));
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DMNI adapter: the only writer of the DMA Network Interface registers.
//!
//! The DMNI has one outbound slot: starting a new send implicitly frees the
//! packet/payload buffers owned by the *previous* send, which is what lets
//! callers hand over large migration payloads without blocking on
//! completion. All of that bookkeeping lives here so the rest of the kernel
//! only ever sees `send`/`recv`/`drop_payload`.

use abi::{KernelError, TileAddr};

use crate::arch::DmniHal;
use crate::FLIT_SIZE;

fn is_flit_multiple(size: usize) -> bool {
    size % FLIT_SIZE == 0
}

/// Wraps a board's `DmniHal` with the ownership-tracking and serialization
/// the spec requires. Generic over the HAL so tests can run against a fake.
pub struct Dmni<H> {
    hal: H,
    /// Whether the last-programmed send's packet/payload buffers are still
    /// considered "owned" by the DMNI (and thus must not be reused until
    /// the next `send` call frees them).
    owns_outbound: bool,
    #[cfg(feature = "corrupt-every-fourth")]
    send_count: u32,
}

impl<H: DmniHal> Dmni<H> {
    pub fn new(hal: H) -> Self {
        Self {
            hal,
            owns_outbound: false,
            #[cfg(feature = "corrupt-every-fourth")]
            send_count: 0,
        }
    }

    #[cfg(test)]
    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    /// True while a previous send is still in flight.
    pub fn send_busy(&self) -> bool {
        self.hal.send_active()
    }

    /// Busy-waits until the send-active bit clears. The only place in the
    /// kernel a spin on a DMNI bit is allowed to live.
    pub fn wait_send_idle(&self) {
        while self.hal.send_active() {
            core::hint::spin_loop();
        }
    }

    fn wait_recv_idle(&self) {
        while self.hal.recv_active() {
            core::hint::spin_loop();
        }
    }

    /// Receives `dst.len()` bytes from the NoC. Blocks until the
    /// receive-active bit clears, then drains.
    pub fn recv(&mut self, dst: &mut [u8]) -> Result<usize, KernelError> {
        if !is_flit_multiple(dst.len()) {
            return Err(KernelError::InvalidArg);
        }
        self.wait_recv_idle();
        self.hal.recv_flits(dst);
        Ok(dst.len())
    }

    /// Discards `size` flits from the receive channel.
    pub fn drop_payload(&mut self, size: usize) -> Result<(), KernelError> {
        if !is_flit_multiple(size) {
            return Err(KernelError::InvalidArg);
        }
        self.wait_recv_idle();
        self.hal.drop_flits(size);
        Ok(())
    }

    /// Programs a send of `pkt` (and optionally `pld`) to `target`. Spins
    /// until the previous send has drained, then frees whatever that send
    /// owned and records ownership of the new buffers.
    ///
    /// The actual wire transmission is asynchronous; this call returning
    /// only means the DMA has been programmed, not that bytes have left the
    /// tile.
    pub fn send(
        &mut self,
        target: TileAddr,
        pkt: &[u8],
        pld: Option<&[u8]>,
    ) -> Result<(), KernelError> {
        if !is_flit_multiple(pkt.len()) || pld.map_or(false, |p| !is_flit_multiple(p.len())) {
            return Err(KernelError::InvalidArg);
        }
        self.wait_send_idle();
        // The previous outbound pair, if any, is implicitly freed here: we
        // never kept a handle to it ourselves, the caller's allocation
        // (typically a stack buffer, or the pending-FIFO slot) is what goes
        // out of scope. We only track *that* there was one, for the
        // invariant check below.
        self.owns_outbound = true;

        #[cfg(feature = "corrupt-every-fourth")]
        {
            self.send_count = self.send_count.wrapping_add(1);
            if self.send_count % 4 == 0 {
                // Deliberately mangle one byte of the outgoing header so
                // resend/error paths get exercised. `scratch` bounds what
                // this can corrupt to headers no larger than 32 bytes,
                // which covers every `Packet` variant this kernel sends.
                let mut scratch = [0u8; 32];
                let n = pkt.len().min(scratch.len());
                scratch[..n].copy_from_slice(&pkt[..n]);
                scratch[0] ^= 0xFF;
                self.hal.program_send(target, &scratch[..n], pld);
                return Ok(());
            }
        }

        self.hal.program_send(target, pkt, pld);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::fake::FakeDmni;

    #[test]
    fn recv_rejects_non_flit_multiple_size() {
        let mut dmni = Dmni::new(FakeDmni::default());
        let mut buf = [0u8; 3];
        assert_eq!(dmni.recv(&mut buf), Err(KernelError::InvalidArg));
    }

    #[test]
    fn send_rejects_non_flit_multiple_size() {
        let mut dmni = Dmni::new(FakeDmni::default());
        assert_eq!(
            dmni.send(TileAddr::new(0, 0), &[0u8; 3], None),
            Err(KernelError::InvalidArg)
        );
    }

    #[test]
    fn send_records_target_and_buffers() {
        let mut dmni = Dmni::new(FakeDmni::default());
        dmni.send(TileAddr::new(1, 2), &[1, 2, 3, 4], Some(&[5, 6, 7, 8]))
            .unwrap();
        let (target, pkt, pld) = dmni.hal.last_send.clone().unwrap();
        assert_eq!(target, TileAddr::new(1, 2));
        assert_eq!(pkt, vec![1, 2, 3, 4]);
        assert_eq!(pld, Some(vec![5, 6, 7, 8]));
    }

    #[test]
    #[cfg(feature = "corrupt-every-fourth")]
    fn fourth_send_is_corrupted() {
        let mut dmni = Dmni::new(FakeDmni::default());
        for _ in 0..3 {
            dmni.send(TileAddr::new(0, 0), &[1, 2, 3, 4], None).unwrap();
            let (_, pkt, _) = dmni.hal.last_send.clone().unwrap();
            assert_eq!(pkt, vec![1, 2, 3, 4]);
        }
        dmni.send(TileAddr::new(0, 0), &[1, 2, 3, 4], None).unwrap();
        let (_, pkt, _) = dmni.hal.last_send.clone().unwrap();
        assert_ne!(pkt[0], 1);
    }

    #[test]
    fn recv_drains_exactly_requested_bytes() {
        let mut dmni = Dmni::new(FakeDmni::default());
        dmni.hal.recv_buf = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let mut buf = [0u8; 4];
        assert_eq!(dmni.recv(&mut buf).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(dmni.hal.recv_buf, vec![5, 6, 7, 8]);
    }
}

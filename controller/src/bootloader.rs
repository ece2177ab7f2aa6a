//! OTA receive loop.
//!
//! Entered only after the bootloader command has been ACKed. The loop
//! borrows the whole machine, which parks the protocol dispatcher for
//! the duration — the UART belongs to this sub-protocol alone until the
//! session ends. Every failure path reports in-band (error marker plus
//! code) and returns without touching anything beyond the reserved
//! image region; the running firmware then just carries on.

use brewos_protocol::bootloader::{
    xor_checksum, OtaError, ACK_BYTE, CHUNK_HEADER_LEN, CHUNK_MAGIC, END_CHUNK_NUMBER, END_PAYLOAD,
    ERROR_MARKER, IMAGE_CRC, MAX_CHUNK_DATA,
};

use crate::capabilities::Machine;

pub const PAGE_SIZE: usize = 256;
pub const SECTOR_SIZE: usize = 4096;
/// A chunk that stalls this long aborts the session.
pub const CHUNK_TIMEOUT_MS: u32 = 5_000;
/// Hard ceiling on the whole transfer.
pub const SESSION_TIMEOUT_MS: u32 = 30_000;

/// Run one OTA session to completion. `Ok(image_len)` means the image
/// is staged and CRC-verified; the caller resets into it.
pub fn run<M: Machine>(machine: &mut M) -> Result<u32, OtaError> {
    let session_start = machine.now_ms();
    let mut staging = Staging::new();

    log::info!("bootloader session open");
    loop {
        let mut header = [0u8; CHUNK_HEADER_LEN];
        read_exact(machine, &mut header, session_start)
            .map_err(|e| abort(machine, e))?;

        if header[..2] != CHUNK_MAGIC {
            return Err(abort(machine, OtaError::BadMagic));
        }
        let chunk_number = u32::from_le_bytes([header[2], header[3], header[4], header[5]]);
        let size = usize::from(u16::from_le_bytes([header[6], header[7]]));
        if size > MAX_CHUNK_DATA {
            return Err(abort(machine, OtaError::BadSize));
        }

        let mut data = [0u8; MAX_CHUNK_DATA];
        read_exact(machine, &mut data[..size], session_start)
            .map_err(|e| abort(machine, e))?;
        let mut xor = [0u8];
        read_exact(machine, &mut xor, session_start).map_err(|e| abort(machine, e))?;
        if xor[0] != xor_checksum(&data[..size]) {
            return Err(abort(machine, OtaError::Checksum));
        }

        if chunk_number == END_CHUNK_NUMBER {
            if data[..size] != END_PAYLOAD {
                return Err(abort(machine, OtaError::BadChunk));
            }
            let image_len = staging.finalize(machine).map_err(|e| abort(machine, e))?;
            machine.write(&[ACK_BYTE]);
            log::info!("image staged, {image_len} bytes");
            return Ok(image_len);
        }

        if chunk_number != staging.expected_chunk {
            return Err(abort(machine, OtaError::BadChunk));
        }
        staging
            .append(machine, &data[..size])
            .map_err(|e| abort(machine, e))?;
        machine.write(&[ACK_BYTE]);
    }
}

/// Page-buffered flash writer for the incoming image.
struct Staging {
    expected_chunk: u32,
    image_len: u32,
    page: [u8; PAGE_SIZE],
    page_fill: usize,
    flushed: u32,
}

impl Staging {
    fn new() -> Self {
        Self {
            expected_chunk: 0,
            image_len: 0,
            page: [0xFF; PAGE_SIZE],
            page_fill: 0,
            flushed: 0,
        }
    }

    fn append<M: Machine>(&mut self, machine: &mut M, mut data: &[u8]) -> Result<(), OtaError> {
        if self.image_len + data.len() as u32 > machine.capacity() {
            return Err(OtaError::BadSize);
        }
        self.image_len += data.len() as u32;
        self.expected_chunk += 1;

        while !data.is_empty() {
            let room = PAGE_SIZE - self.page_fill;
            let take = room.min(data.len());
            self.page[self.page_fill..self.page_fill + take].copy_from_slice(&data[..take]);
            self.page_fill += take;
            data = &data[take..];
            if self.page_fill == PAGE_SIZE {
                self.flush_page(machine)?;
            }
        }
        Ok(())
    }

    fn flush_page<M: Machine>(&mut self, machine: &mut M) -> Result<(), OtaError> {
        if self.page_fill == 0 {
            return Ok(());
        }
        if self.flushed as usize % SECTOR_SIZE == 0 {
            machine
                .erase_sector(self.flushed)
                .map_err(|_| OtaError::FlashErase)?;
        }
        machine
            .write_page(self.flushed, &self.page)
            .map_err(|_| OtaError::FlashWrite)?;
        self.flushed += PAGE_SIZE as u32;
        self.page = [0xFF; PAGE_SIZE];
        self.page_fill = 0;
        Ok(())
    }

    /// Flush the tail and verify the staged image's CRC-32 trailer
    /// against a read-back of what actually landed in flash.
    fn finalize<M: Machine>(&mut self, machine: &mut M) -> Result<u32, OtaError> {
        if self.image_len < 5 {
            return Err(OtaError::BadChunk);
        }
        self.flush_page(machine)?;

        let body_len = self.image_len - 4;
        let mut digest = IMAGE_CRC.digest();
        let mut buf = [0u8; 64];
        let mut at = 0u32;
        while at < body_len {
            let take = buf.len().min((body_len - at) as usize);
            machine
                .read(at, &mut buf[..take])
                .map_err(|_| OtaError::FlashWrite)?;
            digest.update(&buf[..take]);
            at += take as u32;
        }

        let mut trailer = [0u8; 4];
        machine
            .read(body_len, &mut trailer)
            .map_err(|_| OtaError::FlashWrite)?;
        if digest.finalize() != u32::from_le_bytes(trailer) {
            return Err(OtaError::Checksum);
        }
        Ok(self.image_len)
    }
}

/// Report an error in-band and hand it back to the caller.
fn abort<M: Machine>(machine: &mut M, error: OtaError) -> OtaError {
    log::warn!("bootloader session aborted: {error}");
    machine.write(&[ERROR_MARKER, error.code()]);
    error
}

/// Blocking timed read; the only place the controller ever busy-waits.
/// The session outlives the 2 s hardware watchdog, so it is kicked here.
fn read_exact<M: Machine>(
    machine: &mut M,
    buf: &mut [u8],
    session_start: u32,
) -> Result<(), OtaError> {
    let chunk_start = machine.now_ms();
    let mut at = 0;
    while at < buf.len() {
        machine.kick_watchdog();
        if let Some(byte) = machine.read_byte() {
            buf[at] = byte;
            at += 1;
            continue;
        }
        let now = machine.now_ms();
        if now.wrapping_sub(chunk_start) >= CHUNK_TIMEOUT_MS
            || now.wrapping_sub(session_start) >= SESSION_TIMEOUT_MS
        {
            return Err(OtaError::Timeout);
        }
    }
    Ok(())
}

//! OTA bootloader sessions over the scripted board.

mod common;

use common::{frames_of_type, parse_tx, profile, BridgeSim, SimMachine, FLASH_CAPACITY};

use brewos_controller::Controller;
use brewos_protocol::bootloader::{
    encode_chunk, encode_end_marker, OtaError, ACK_BYTE, ERROR_MARKER, IMAGE_CRC,
};
use brewos_protocol::message::{Ack, EnterBootloader, Message, MsgType, ResultCode};

/// A plausible firmware image: patterned body plus its CRC-32 trailer.
fn image(total_len: usize) -> Vec<u8> {
    let mut body: Vec<u8> = (0..total_len - 4).map(|i| (i * 7 + 13) as u8).collect();
    let crc = IMAGE_CRC.checksum(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}

fn enter_frame(bridge: &mut BridgeSim) -> Vec<u8> {
    bridge.frame(&Message::EnterBootloader(EnterBootloader {
        magic: Some(EnterBootloader::MAGIC),
    }))
}

fn chunk_stream(image: &[u8]) -> Vec<u8> {
    let mut stream = Vec::new();
    for (number, data) in image.chunks(256).enumerate() {
        stream.extend_from_slice(&encode_chunk(number as u32, data).unwrap());
    }
    stream.extend_from_slice(&encode_end_marker());
    stream
}

/// S5: a 40 KB image streams in 256-byte chunks, lands in flash, CRC
/// verifies, and the controller resets into it.
#[test]
fn ota_happy_path() {
    let mut machine = SimMachine::commissioned();
    machine.idle_advance = 1;
    let mut ctrl = Controller::new(machine, profile());
    ctrl.poll();

    let image = image(40 * 1024);
    let mut bridge = BridgeSim::new();
    let frame = enter_frame(&mut bridge);
    ctrl.machine_mut().push_frame(&frame);
    ctrl.machine_mut().push_frame(&chunk_stream(&image));

    ctrl.machine_mut().now = 100;
    ctrl.poll();

    // The command was ACKed before the handoff.
    let frames = parse_tx(&ctrl.machine().tx);
    let acks = frames_of_type(&frames, MsgType::Ack);
    let ack = Ack::decode(&acks[0].payload).unwrap();
    assert_eq!(ack.cmd_type, MsgType::EnterBootloader as u8);
    assert_eq!(ack.result, ResultCode::Success);

    assert!(ctrl.machine().reset_called, "reboots into the new image");
    assert_eq!(&ctrl.machine().flash[..image.len()], &image[..]);
    // One erase per 4 KB sector the image spans.
    assert_eq!(ctrl.machine().erased_sectors.len(), 10);
    assert_eq!(ctrl.machine().erased_sectors[0], 0);
    assert_eq!(*ctrl.machine().tx.last().unwrap(), ACK_BYTE);
}

/// S6: one corrupted XOR trailer aborts the session in-band with the
/// checksum code; the controller keeps running the old image.
#[test]
fn ota_corrupt_chunk_aborts_in_band() {
    let mut machine = SimMachine::commissioned();
    machine.idle_advance = 1;
    let mut ctrl = Controller::new(machine, profile());
    ctrl.poll();

    let image = image(4 * 1024);
    let mut bridge = BridgeSim::new();
    let frame = enter_frame(&mut bridge);
    ctrl.machine_mut().push_frame(&frame);

    for (number, data) in image.chunks(256).take(4).enumerate() {
        let mut chunk = encode_chunk(number as u32, data).unwrap().to_vec();
        if number == 3 {
            let at = chunk.len() - 1;
            chunk[at] ^= 0xFF; // corrupt the XOR trailer
        }
        ctrl.machine_mut().push_frame(&chunk);
    }

    ctrl.machine_mut().now = 100;
    ctrl.poll();

    assert!(!ctrl.machine().reset_called);
    let tx = ctrl.machine().tx.clone();
    assert!(
        tx.windows(2)
            .any(|w| w == [ERROR_MARKER, OtaError::Checksum.code()]),
        "in-band checksum error"
    );
    // Nothing beyond the erased first sector was touched.
    assert!(ctrl.machine().flash[4096..].iter().all(|&b| b == 0xFF));

    // Still running the previous image: status resumes, no BOOT re-emit.
    let boots_before = frames_of_type(&parse_tx(&tx), MsgType::Boot).len();
    ctrl.machine_mut().now = 1_000;
    ctrl.poll();
    let frames = parse_tx(&ctrl.machine().tx);
    assert!(!frames_of_type(&frames, MsgType::Status).is_empty());
    assert_eq!(frames_of_type(&frames, MsgType::Boot).len(), boots_before);
}

/// A wrong chunk number aborts with BadChunk before anything lands.
#[test]
fn ota_out_of_sequence_chunk_aborts() {
    let mut machine = SimMachine::commissioned();
    machine.idle_advance = 1;
    let mut ctrl = Controller::new(machine, profile());
    ctrl.poll();

    let image = image(1024);
    let mut bridge = BridgeSim::new();
    let frame = enter_frame(&mut bridge);
    ctrl.machine_mut().push_frame(&frame);
    // First chunk claims number 5.
    let chunk = encode_chunk(5, &image[..256]).unwrap();
    ctrl.machine_mut().push_frame(&chunk);

    ctrl.machine_mut().now = 100;
    ctrl.poll();

    assert!(ctrl
        .machine()
        .tx
        .windows(2)
        .any(|w| w == [ERROR_MARKER, OtaError::BadChunk.code()]));
    assert!(ctrl.machine().erased_sectors.is_empty());
    assert!(ctrl.machine().flash.iter().all(|&b| b == 0xFF));
}

/// An image that would overflow the reserved region is refused with
/// BadSize; nothing outside the region is reachable at all.
#[test]
fn ota_oversized_image_is_refused() {
    let mut machine = SimMachine::commissioned();
    machine.idle_advance = 1;
    let mut ctrl = Controller::new(machine, profile());
    ctrl.poll();

    let mut bridge = BridgeSim::new();
    let frame = enter_frame(&mut bridge);
    ctrl.machine_mut().push_frame(&frame);

    let chunks = FLASH_CAPACITY / 256 + 1;
    let data = [0x5Au8; 256];
    for number in 0..chunks {
        let chunk = encode_chunk(number as u32, &data).unwrap();
        ctrl.machine_mut().push_frame(&chunk);
    }

    ctrl.machine_mut().now = 100;
    ctrl.poll();

    assert!(ctrl
        .machine()
        .tx
        .windows(2)
        .any(|w| w == [ERROR_MARKER, OtaError::BadSize.code()]));
    assert!(!ctrl.machine().reset_called);
}

/// A stalled chunk read times out in-band after 5 s.
#[test]
fn ota_chunk_timeout() {
    let mut machine = SimMachine::commissioned();
    machine.idle_advance = 50;
    let mut ctrl = Controller::new(machine, profile());
    ctrl.poll();

    let mut bridge = BridgeSim::new();
    let frame = enter_frame(&mut bridge);
    ctrl.machine_mut().push_frame(&frame);
    // Three header bytes, then silence.
    ctrl.machine_mut().push_frame(&[0x55, 0xAA, 0x00]);

    ctrl.machine_mut().now = 100;
    ctrl.poll();

    assert!(ctrl
        .machine()
        .tx
        .windows(2)
        .any(|w| w == [ERROR_MARKER, OtaError::Timeout.code()]));
    assert!(!ctrl.machine().reset_called);
}

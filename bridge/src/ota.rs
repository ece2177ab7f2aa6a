//! Bridge-side OTA streaming.
//!
//! The caller must own the serial port exclusively — the link task may
//! not be running. The session enters the bootloader with a framed
//! command, waits for its ACK, then switches to the raw chunk
//! sub-protocol until the end marker is acknowledged.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info};

use brewos_protocol::bootloader::{
    encode_chunk, encode_end_marker, OtaError, ACK_BYTE, ERROR_MARKER, IMAGE_CRC, MAX_CHUNK_DATA,
};
use brewos_protocol::link::LinkEngine;
use brewos_protocol::message::{Ack, EnterBootloader, Message, MsgType, ResultCode};
use brewos_protocol::parser::{Event, Parser};

/// How long to wait for the entry ACK and for each chunk reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// The controller verifies a CRC-32 trailer over the image body. Images
/// built without one get it appended here.
pub fn with_crc_trailer(image: &[u8]) -> Vec<u8> {
    if image.len() > 4 {
        let (body, trailer) = image.split_at(image.len() - 4);
        let stored = u32::from_le_bytes(trailer.try_into().expect("four trailer bytes"));
        if IMAGE_CRC.checksum(body) == stored {
            return image.to_vec();
        }
    }
    let mut out = image.to_vec();
    out.extend_from_slice(&IMAGE_CRC.checksum(image).to_le_bytes());
    out
}

/// Stream a firmware image. On success the controller resets into it.
pub async fn stream_image<R, W>(mut reader: R, mut writer: W, image: &[u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let image = with_crc_trailer(image);

    // Framed entry command; everything after its ACK is raw chunks.
    let mut engine = LinkEngine::new();
    let message = Message::EnterBootloader(EnterBootloader {
        magic: Some(EnterBootloader::MAGIC),
    });
    let frame = engine
        .send(MsgType::EnterBootloader as u8, &message.encode_payload())
        .expect("bootloader command fits a frame");
    writer.write_all(&frame).await?;
    writer.flush().await?;
    wait_for_entry_ack(&mut reader)
        .await
        .context("waiting for bootloader entry")?;
    info!(bytes = image.len(), "bootloader entered, streaming image");

    for (number, data) in image.chunks(MAX_CHUNK_DATA).enumerate() {
        let chunk = encode_chunk(number as u32, data)?;
        writer.write_all(&chunk).await?;
        writer.flush().await?;
        expect_chunk_reply(&mut reader)
            .await
            .with_context(|| format!("chunk {number}"))?;
        if number % 32 == 0 {
            debug!(chunk = number, "streaming");
        }
    }

    writer.write_all(&encode_end_marker()).await?;
    writer.flush().await?;
    expect_chunk_reply(&mut reader)
        .await
        .context("end marker")?;

    info!("image accepted, controller rebooting");
    Ok(())
}

/// Parse frames until the entry command's ACK arrives; telemetry frames
/// already in flight are skipped.
async fn wait_for_entry_ack<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    let mut parser = Parser::new();
    let mut buf = [0u8; 256];
    let deadline = tokio::time::Instant::now() + REPLY_TIMEOUT;

    loop {
        let read = timeout(deadline - tokio::time::Instant::now(), reader.read(&mut buf))
            .await
            .context("no ACK from controller")??;
        if read == 0 {
            bail!("link closed before the bootloader ACK");
        }
        for &byte in &buf[..read] {
            let Some(Event::Frame(frame)) = parser.push(byte, 0) else {
                continue;
            };
            if frame.msg_type != MsgType::Ack as u8 {
                continue;
            }
            let Ok(ack) = Ack::decode(&frame.payload) else {
                continue;
            };
            if ack.cmd_type != MsgType::EnterBootloader as u8 {
                continue;
            }
            if ack.result != ResultCode::Success {
                bail!("controller refused bootloader entry: {:?}", ack.result);
            }
            return Ok(());
        }
    }
}

async fn expect_chunk_reply<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    let mut byte = [0u8; 1];
    timeout(REPLY_TIMEOUT, reader.read_exact(&mut byte))
        .await
        .context("no chunk reply")??;
    match byte[0] {
        ACK_BYTE => Ok(()),
        ERROR_MARKER => {
            timeout(REPLY_TIMEOUT, reader.read_exact(&mut byte))
                .await
                .context("no error code after marker")??;
            match OtaError::from_code(byte[0]) {
                Some(error) => bail!("controller aborted the session: {error}"),
                None => bail!("controller aborted with unknown code 0x{:02X}", byte[0]),
            }
        }
        other => bail!("unexpected reply byte 0x{other:02X}"),
    }
}

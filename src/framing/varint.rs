//! Varint framing: unsigned length prefix, then the payload bytes
//!
//! The prefix is LEB128-style: seven payload bits per byte, low group
//! first, high bit set on every byte except the last. Payloads may contain
//! arbitrary bytes.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Result, RpcError};
use crate::framing::{DynReader, DynWriter};

pub(crate) async fn read_frame(reader: &mut DynReader) -> Result<Option<Vec<u8>>> {
    // EOF before the first prefix byte is a clean end of stream; EOF
    // anywhere after that truncates a frame and is an error.
    let mut first = [0u8; 1];
    let n = reader.read(&mut first).await?;
    if n == 0 {
        return Ok(None);
    }

    let mut value = (first[0] & 0x7f) as u64;
    let mut shift = 7u32;
    let mut byte = first[0];
    while byte & 0x80 != 0 {
        if shift >= 64 {
            return Err(RpcError::Channel("varint length prefix overflows u64".to_string()).into());
        }
        byte = reader.read_u8().await.map_err(|e| {
            RpcError::Channel(format!("unexpected EOF in varint length prefix: {e}"))
        })?;
        value |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }

    let len = usize::try_from(value)
        .map_err(|_| RpcError::Channel(format!("varint frame length {value} is unrepresentable")))?;
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| RpcError::Channel(format!("unexpected EOF in varint payload: {e}")))?;
    Ok(Some(body))
}

pub(crate) async fn write_frame(writer: &mut DynWriter, payload: &[u8]) -> Result<()> {
    let mut prefix = [0u8; 10];
    let mut n = payload.len() as u64;
    let mut i = 0;
    loop {
        let mut b = (n & 0x7f) as u8;
        n >>= 7;
        if n != 0 {
            b |= 0x80;
        }
        prefix[i] = b;
        i += 1;
        if n == 0 {
            break;
        }
    }
    writer.write_all(&prefix[..i]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

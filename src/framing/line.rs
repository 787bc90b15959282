//! Line framing: one payload per LF-terminated line
//!
//! Payloads must not contain LF bytes; `send` rejects them rather than
//! corrupt the stream. `recv` reads up to the next LF and strips the
//! trailing CR/LF pair, so CRLF peers interoperate.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::error::{Result, RpcError};
use crate::framing::{DynReader, DynWriter};

pub(crate) async fn read_frame(reader: &mut DynReader) -> Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

pub(crate) async fn write_frame(writer: &mut DynWriter, payload: &[u8]) -> Result<()> {
    if payload.contains(&b'\n') {
        return Err(
            RpcError::Channel("line framing cannot carry a payload containing LF".to_string())
                .into(),
        );
    }
    writer.write_all(payload).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

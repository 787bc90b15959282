//! Header framing: HTTP-like header block, blank line, payload
//!
//! Each frame starts with a header block of `Name: value` lines terminated
//! by an empty line. `Content-Length` is mandatory and gives the exact
//! payload size in bytes. When the framing was built with a MIME type,
//! `send` emits `Content-Type` and `recv` rejects a mismatched inbound
//! `Content-Type`. Unknown headers are ignored.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

use crate::error::{Result, RpcError};
use crate::framing::{DynReader, DynWriter};

pub(crate) async fn read_frame(
    reader: &mut DynReader,
    mime: Option<&str>,
) -> Result<Option<Vec<u8>>> {
    let mut content_length: Option<usize> = None;
    let mut content_type: Option<String> = None;
    let mut first = true;

    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            // EOF on a frame boundary is a clean end of stream.
            if first {
                return Ok(None);
            }
            return Err(
                RpcError::Channel("unexpected EOF inside header block".to_string()).into(),
            );
        }
        first = false;
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.is_empty() {
            break;
        }

        let text = std::str::from_utf8(&line)
            .map_err(|_| RpcError::Channel("header line is not valid UTF-8".to_string()))?;
        let (name, value) = text
            .split_once(':')
            .ok_or(RpcError::Channel(format!("malformed header line {text:?}")))?;
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => {
                let len = value.trim().parse::<usize>().map_err(|_| {
                    RpcError::Channel(format!("invalid Content-Length {:?}", value.trim()))
                })?;
                content_length = Some(len);
            }
            "content-type" => content_type = Some(value.trim().to_string()),
            _ => {}
        }
    }

    let len = content_length
        .ok_or(RpcError::Channel("missing Content-Length header".to_string()))?;
    if let (Some(want), Some(got)) = (mime, content_type.as_deref()) {
        if want != got {
            return Err(RpcError::Channel(format!(
                "unexpected Content-Type {got:?} (want {want:?})"
            ))
            .into());
        }
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| RpcError::Channel(format!("unexpected EOF in framed payload: {e}")))?;
    Ok(Some(body))
}

pub(crate) async fn write_frame(
    writer: &mut DynWriter,
    mime: Option<&str>,
    payload: &[u8],
) -> Result<()> {
    let mut head = String::new();
    if let Some(mime) = mime {
        head.push_str("Content-Type: ");
        head.push_str(mime);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", payload.len()));
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

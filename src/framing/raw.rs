//! Raw framing: no delimiter
//!
//! Outbound payloads are written verbatim. Inbound payloads are recovered
//! by running a streaming JSON decoder over the byte stream and returning
//! each top-level value. A syntax error in the stream is unrecoverable
//! here: unlike delimited framings there is no way to find the start of the
//! next payload, so the error is fatal to the channel.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Result, RpcError};
use crate::framing::{DynReader, DynWriter};

pub(crate) async fn read_frame(
    reader: &mut DynReader,
    buf: &mut BytesMut,
) -> Result<Option<Vec<u8>>> {
    loop {
        if !buf.is_empty() {
            // Scan for one complete top-level value; the borrow of `buf`
            // ends with the inner block so the frame can be split off.
            let scan = {
                let mut stream =
                    serde_json::Deserializer::from_slice(buf).into_iter::<serde_json::Value>();
                match stream.next() {
                    Some(Ok(_)) => Some(Ok(stream.byte_offset())),
                    Some(Err(e)) if e.is_eof() => None,
                    Some(Err(e)) => Some(Err(e)),
                    // Buffer holds only whitespace so far.
                    None => None,
                }
            };
            match scan {
                Some(Ok(end)) => {
                    let frame = buf.split_to(end);
                    let start = frame
                        .iter()
                        .position(|b| !b.is_ascii_whitespace())
                        .unwrap_or(frame.len());
                    return Ok(Some(frame[start..].to_vec()));
                }
                Some(Err(e)) => {
                    return Err(
                        RpcError::Channel(format!("invalid JSON on raw channel: {e}")).into(),
                    )
                }
                None => {}
            }
        }

        let n = reader.read_buf(buf).await?;
        if n == 0 {
            if buf.iter().all(|b| b.is_ascii_whitespace()) {
                return Ok(None);
            }
            return Err(RpcError::Channel("unexpected EOF inside raw payload".to_string()).into());
        }
    }
}

pub(crate) async fn write_frame(writer: &mut DynWriter, payload: &[u8]) -> Result<()> {
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

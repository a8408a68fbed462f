//! The IFF container save files live in: a FORM wrapper holding typed
//! chunks, everything big-endian, odd-length chunks padded by one byte.

use crate::bytes;
use crate::error::{Result, TerpError};
use std::io::{Read, Write};

/// An IFF FORM with its sub-identifier and chunks.
#[derive(Debug)]
pub struct IffForm {
    pub sub_id: [u8; 4],
    pub chunks: Vec<IffChunk>,
}

#[derive(Debug)]
pub struct IffChunk {
    pub id: [u8; 4],
    pub data: Vec<u8>,
}

impl IffForm {
    pub fn new(sub_id: [u8; 4]) -> IffForm {
        IffForm {
            sub_id,
            chunks: Vec::new(),
        }
    }

    pub fn add_chunk(&mut self, id: [u8; 4], data: Vec<u8>) {
        self.chunks.push(IffChunk { id, data });
    }

    pub fn find_chunk(&self, id: &[u8; 4]) -> Option<&IffChunk> {
        self.chunks.iter().find(|c| &c.id == id)
    }

    /// Serialize the form to a stream.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let content_len: usize = 4 + self
            .chunks
            .iter()
            .map(|c| 8 + c.data.len() + c.data.len() % 2)
            .sum::<usize>();

        w.write_all(b"FORM")?;
        bytes::stream_write_u32(w, content_len as u32)?;
        w.write_all(&self.sub_id)?;
        for chunk in &self.chunks {
            w.write_all(&chunk.id)?;
            bytes::stream_write_u32(w, chunk.data.len() as u32)?;
            w.write_all(&chunk.data)?;
            if chunk.data.len() % 2 == 1 {
                w.write_all(&[0])?;
            }
        }
        w.flush()?;
        Ok(())
    }

    /// Parse a form from a stream, reading exactly the declared length.
    pub fn read_from<R: Read>(r: &mut R) -> Result<IffForm> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)
            .map_err(|_| TerpError::bad_save("file is not an IFF form".to_string()))?;
        if &magic != b"FORM" {
            return Err(TerpError::bad_save("file is not an IFF form".to_string()));
        }
        let content_len = bytes::stream_read_u32(r)? as usize;
        if content_len < 4 {
            return Err(TerpError::bad_save("IFF form is truncated".to_string()));
        }
        let mut sub_id = [0u8; 4];
        r.read_exact(&mut sub_id)?;

        let mut body = vec![0u8; content_len - 4];
        r.read_exact(&mut body)
            .map_err(|_| TerpError::bad_save("IFF form is truncated".to_string()))?;

        let mut form = IffForm::new(sub_id);
        let mut offset = 0;
        while offset + 8 <= body.len() {
            let mut id = [0u8; 4];
            id.copy_from_slice(&body[offset..offset + 4]);
            let len = bytes::read_u32(&body, offset + 4) as usize;
            offset += 8;
            if offset + len > body.len() {
                return Err(TerpError::bad_save(format!(
                    "chunk {} overruns the form",
                    String::from_utf8_lossy(&id)
                )));
            }
            form.chunks.push(IffChunk {
                id,
                data: body[offset..offset + len].to_vec(),
            });
            offset += len + len % 2;
        }
        Ok(form)
    }
}

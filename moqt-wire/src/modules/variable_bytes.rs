use std::io::Cursor;

use anyhow::{bail, Result};
use bytes::{Buf, BytesMut};

use crate::variable_integer::{read_variable_integer, write_variable_integer};

pub fn read_variable_bytes_from_buffer(buf: &mut BytesMut) -> Result<Vec<u8>> {
    let mut read_cur = Cursor::new(&buf[..]);

    let value = read_variable_bytes(&mut read_cur);

    buf.advance(read_cur.position() as usize);

    value
}

pub fn read_variable_bytes(read_cur: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = read_variable_integer(read_cur)? as usize;

    if read_cur.remaining() < len {
        bail!(
            "buffer does not have enough length. actual: {}, expected: {}",
            read_cur.remaining(),
            len
        );
    }

    let mut value = vec![0; len];
    read_cur.copy_to_slice(&mut value);

    Ok(value)
}

pub fn read_fixed_length_bytes_from_buffer(buf: &mut BytesMut, len: usize) -> Result<Vec<u8>> {
    let mut read_cur = Cursor::new(&buf[..]);

    let value = read_fixed_length_bytes(&mut read_cur, len);

    buf.advance(read_cur.position() as usize);

    value
}

pub fn read_fixed_length_bytes(read_cur: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    if read_cur.remaining() < len {
        bail!(
            "buffer does not have enough length. actual: {}, expected: {}",
            read_cur.remaining(),
            len
        );
    }

    let mut value = vec![0; len];
    read_cur.copy_to_slice(&mut value);

    Ok(value)
}

pub fn write_variable_bytes(value: &[u8]) -> BytesMut {
    let mut buf = write_variable_integer(value.len() as u64);
    buf.extend_from_slice(value);

    buf
}

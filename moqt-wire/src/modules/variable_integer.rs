use std::io::Cursor;

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, BytesMut};

pub fn read_variable_integer_from_buffer(buf: &mut BytesMut) -> Result<u64> {
    let mut read_cur = Cursor::new(&buf[..]);

    let value = read_variable_integer(&mut read_cur);

    buf.advance(read_cur.position() as usize);

    value
}

pub fn read_variable_integer(read_cur: &mut Cursor<&[u8]>) -> Result<u64> {
    if read_cur.remaining() == 0 {
        bail!("buffer is empty in read_variable_integer");
    }

    let first_byte = read_cur.get_u8();
    // The two most significant bits carry the length exponent.
    let rest_len = (1usize << (first_byte >> 6)) - 1;
    let mut value: u64 = (first_byte & 0x3f) as u64;

    if read_cur.remaining() < rest_len {
        bail!(
            "buffer does not have enough length. actual: {}, expected: {}",
            read_cur.remaining() + 1,
            rest_len + 1
        );
    }

    for _ in 0..rest_len {
        value = (value << 8) | read_cur.get_u8() as u64;
    }

    Ok(value)
}

pub fn write_variable_integer(value: u64) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8);

    if value < 0x40 {
        buf.put_u8(value as u8);
    } else if value < 0x4000 {
        buf.put_u16(value as u16 | 0x4000);
    } else if value < 0x4000_0000 {
        buf.put_u32(value as u32 | 0x8000_0000);
    } else if value < 0x4000_0000_0000_0000 {
        buf.put_u64(value | 0xc000_0000_0000_0000);
    } else {
        unreachable!("Invalid use of `write_variable_integer` with {}", value);
    }

    buf
}

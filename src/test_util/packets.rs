use bytes::{BufMut, Bytes, BytesMut};

use crate::packet::Opcode;

pub fn read_request(filename: &str, mode: &str) -> Bytes {
    request(Opcode::ReadRequest, filename, mode)
}

pub fn write_request(filename: &str, mode: &str) -> Bytes {
    request(Opcode::WriteRequest, filename, mode)
}

fn request(opcode: Opcode, filename: &str, mode: &str) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(opcode.into());
    buf.put_slice(filename.as_bytes());
    buf.put_u8(0);
    buf.put_slice(mode.as_bytes());
    buf.put_u8(0);
    buf.freeze()
}

pub fn data(block: u16, content: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(Opcode::Data.into());
    buf.put_u16(block);
    buf.put_slice(content);
    buf.freeze()
}

pub fn ack(block: u16) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(Opcode::Ack.into());
    buf.put_u16(block);
    buf.freeze()
}

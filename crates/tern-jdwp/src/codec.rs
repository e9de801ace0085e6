//! JDWP packet framing and payload encoding.
//!
//! All multi-byte quantities are big-endian. Object-like ids are variable
//! width; their sizes come from `VirtualMachine.IDSizes` and are threaded
//! through as [`JdwpIdSizes`].

use super::types::{
    JdwpError, JdwpIdSizes, JdwpValue, Location, ObjectId, ReferenceTypeId, Result, TAG_ARRAY,
    TAG_BOOLEAN, TAG_BYTE, TAG_CHAR, TAG_CLASS_OBJECT, TAG_DOUBLE, TAG_FLOAT, TAG_INT, TAG_LONG,
    TAG_OBJECT, TAG_SHORT, TAG_STRING, TAG_THREAD, TAG_VOID,
};

pub const HANDSHAKE: &[u8; 14] = b"JDWP-Handshake";
pub const HEADER_LEN: usize = 11;
pub const FLAG_REPLY: u8 = 0x80;

pub fn encode_command(id: u32, command_set: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.extend_from_slice(&((HEADER_LEN + payload.len()) as u32).to_be_bytes());
    packet.extend_from_slice(&id.to_be_bytes());
    packet.push(0);
    packet.push(command_set);
    packet.push(command);
    packet.extend_from_slice(payload);
    packet
}

pub fn encode_reply(id: u32, error_code: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.extend_from_slice(&((HEADER_LEN + payload.len()) as u32).to_be_bytes());
    packet.extend_from_slice(&id.to_be_bytes());
    packet.push(FLAG_REPLY);
    packet.extend_from_slice(&error_code.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Map a JNI-style type signature to the JDWP value tag used when requesting
/// slot values (`StackFrame.GetValues` wants a tag per slot).
pub fn signature_to_tag(signature: &str) -> u8 {
    match signature.as_bytes().first().copied() {
        Some(b'[') => TAG_ARRAY,
        Some(b'B') => TAG_BYTE,
        Some(b'C') => TAG_CHAR,
        Some(b'D') => TAG_DOUBLE,
        Some(b'F') => TAG_FLOAT,
        Some(b'I') => TAG_INT,
        Some(b'J') => TAG_LONG,
        Some(b'S') => TAG_SHORT,
        Some(b'Z') => TAG_BOOLEAN,
        _ => TAG_OBJECT,
    }
}

pub struct JdwpReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> JdwpReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(JdwpError::Protocol(format!(
                "truncated packet: wanted {len} bytes, {} left",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| JdwpError::Protocol(format!("invalid UTF-8 string: {err}")))
    }

    /// Read a variable-width id of `width` bytes.
    pub fn read_id(&mut self, width: usize) -> Result<u64> {
        if width > 8 {
            return Err(JdwpError::Protocol(format!("unsupported id width {width}")));
        }
        let bytes = self.take(width)?;
        let mut value = 0u64;
        for byte in bytes {
            value = value << 8 | u64::from(*byte);
        }
        Ok(value)
    }

    pub fn read_object_id(&mut self, sizes: &JdwpIdSizes) -> Result<ObjectId> {
        self.read_id(sizes.object_id)
    }

    pub fn read_reference_type_id(&mut self, sizes: &JdwpIdSizes) -> Result<ReferenceTypeId> {
        self.read_id(sizes.reference_type_id)
    }

    pub fn read_location(&mut self, sizes: &JdwpIdSizes) -> Result<Location> {
        Ok(Location {
            type_tag: self.read_u8()?,
            class_id: self.read_reference_type_id(sizes)?,
            method_id: self.read_id(sizes.method_id)?,
            index: self.read_u64()?,
        })
    }

    /// Read the payload of a value whose tag byte has already been consumed.
    pub fn read_value(&mut self, tag: u8, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        Ok(match tag {
            TAG_BOOLEAN => JdwpValue::Boolean(self.read_u8()? != 0),
            TAG_BYTE => JdwpValue::Byte(self.read_u8()? as i8),
            TAG_CHAR => JdwpValue::Char(self.read_u16()?),
            TAG_SHORT => JdwpValue::Short(self.read_u16()? as i16),
            TAG_INT => JdwpValue::Int(self.read_i32()?),
            TAG_LONG => JdwpValue::Long(self.read_u64()? as i64),
            TAG_FLOAT => JdwpValue::Float(f32::from_bits(self.read_u32()?)),
            TAG_DOUBLE => JdwpValue::Double(f64::from_bits(self.read_u64()?)),
            TAG_VOID => JdwpValue::Void,
            TAG_OBJECT | TAG_STRING | TAG_ARRAY | TAG_THREAD | TAG_CLASS_OBJECT | b'g' | b'l' => {
                JdwpValue::Object {
                    tag,
                    id: self.read_object_id(sizes)?,
                }
            }
            other => {
                return Err(JdwpError::Protocol(format!(
                    "unknown value tag {other:#x}"
                )))
            }
        })
    }

    /// Read a tag byte followed by the value payload.
    pub fn read_tagged_value(&mut self, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        let tag = self.read_u8()?;
        self.read_value(tag, sizes)
    }
}

#[derive(Default)]
pub struct JdwpWriter {
    buf: Vec<u8>,
}

impl JdwpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_id(&mut self, value: u64, width: usize) {
        let bytes = value.to_be_bytes();
        self.buf.extend_from_slice(&bytes[8 - width..]);
    }

    pub fn write_object_id(&mut self, value: ObjectId, sizes: &JdwpIdSizes) {
        self.write_id(value, sizes.object_id);
    }

    pub fn write_reference_type_id(&mut self, value: ReferenceTypeId, sizes: &JdwpIdSizes) {
        self.write_id(value, sizes.reference_type_id);
    }

    pub fn write_location(&mut self, location: &Location, sizes: &JdwpIdSizes) {
        self.write_u8(location.type_tag);
        self.write_reference_type_id(location.class_id, sizes);
        self.write_id(location.method_id, sizes.method_id);
        self.write_u64(location.index);
    }

    /// Write a tagged value (tag byte followed by the payload).
    pub fn write_tagged_value(&mut self, value: &JdwpValue, sizes: &JdwpIdSizes) {
        self.write_u8(value.tag());
        match *value {
            JdwpValue::Boolean(v) => self.write_bool(v),
            JdwpValue::Byte(v) => self.write_u8(v as u8),
            JdwpValue::Char(v) => self.write_u16(v),
            JdwpValue::Short(v) => self.write_u16(v as u16),
            JdwpValue::Int(v) => self.write_i32(v),
            JdwpValue::Long(v) => self.write_u64(v as u64),
            JdwpValue::Float(v) => self.write_u32(v.to_bits()),
            JdwpValue::Double(v) => self.write_u64(v.to_bits()),
            JdwpValue::Object { id, .. } => self.write_object_id(id, sizes),
            JdwpValue::Void => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_and_reply_framing_round_trip() {
        let cmd = encode_command(7, 1, 9, &[0xAA, 0xBB]);
        assert_eq!(cmd.len(), HEADER_LEN + 2);
        assert_eq!(&cmd[..4], &13u32.to_be_bytes());
        assert_eq!(&cmd[4..8], &7u32.to_be_bytes());
        assert_eq!(cmd[8], 0);
        assert_eq!((cmd[9], cmd[10]), (1, 9));

        let reply = encode_reply(7, 35, &[]);
        assert_eq!(reply[8], FLAG_REPLY);
        assert_eq!(u16::from_be_bytes([reply[9], reply[10]]), 35);
    }

    #[test]
    fn values_round_trip_through_writer_and_reader() {
        let sizes = JdwpIdSizes::default();
        let values = [
            JdwpValue::Boolean(true),
            JdwpValue::Int(-42),
            JdwpValue::Long(1 << 40),
            JdwpValue::Double(1.5),
            JdwpValue::Object {
                tag: TAG_STRING,
                id: 0x5003,
            },
        ];

        let mut w = JdwpWriter::new();
        for value in &values {
            w.write_tagged_value(value, &sizes);
        }

        let buf = w.into_vec();
        let mut r = JdwpReader::new(&buf);
        for value in &values {
            assert_eq!(r.read_tagged_value(&sizes).unwrap(), *value);
        }
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn narrow_ids_use_requested_width() {
        let mut w = JdwpWriter::new();
        w.write_id(0x0102_0304, 4);
        let buf = w.into_vec();
        assert_eq!(buf, vec![0x01, 0x02, 0x03, 0x04]);

        let mut r = JdwpReader::new(&buf);
        assert_eq!(r.read_id(4).unwrap(), 0x0102_0304);
    }

    #[test]
    fn signature_tags() {
        assert_eq!(signature_to_tag("I"), TAG_INT);
        assert_eq!(signature_to_tag("[I"), TAG_ARRAY);
        assert_eq!(signature_to_tag("Ljava/lang/String;"), TAG_OBJECT);
    }
}

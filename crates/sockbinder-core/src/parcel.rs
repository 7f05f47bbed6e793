//! Transaction payloads.
//!
//! A [`Parcel`] is a flat little-endian byte buffer plus the list of object
//! references written into it. Every value is padded to 4 bytes. Object
//! slots are `present: i32` followed by an `address: u64` that is only
//! filled in when the parcel is serialised for a session.
//!
//! Parcels carry a format: either the local format (in-process use) or the
//! format of one particular [`RpcSession`]. Parcels of different formats do
//! not mix.

use std::fmt;

use bytes::Bytes;

use crate::wire::WireParcel;
use crate::{RpcSession, SpBinder, Status, StatusCode};

const BINDER_SLOT_SIZE: usize = 12;

#[derive(Clone)]
enum ParcelFormat {
    Local,
    Rpc(RpcSession),
}

#[derive(Clone)]
struct ParcelObject {
    offset: usize,
    binder: SpBinder,
}

#[derive(Clone)]
pub struct Parcel {
    data: Vec<u8>,
    pos: usize,
    objects: Vec<ParcelObject>,
    format: ParcelFormat,
}

impl Default for Parcel {
    fn default() -> Self {
        Self::new()
    }
}

impl Parcel {
    /// An empty parcel in the local format.
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            pos: 0,
            objects: Vec::new(),
            format: ParcelFormat::Local,
        }
    }

    /// An empty parcel in the format `binder` accepts.
    pub fn for_binder(binder: &SpBinder) -> Self {
        match binder.remote_session() {
            Some(session) => Self::for_session(session),
            None => Self::new(),
        }
    }

    pub fn for_session(session: &RpcSession) -> Self {
        Self {
            format: ParcelFormat::Rpc(session.clone()),
            ..Self::new()
        }
    }

    pub fn is_for_rpc(&self) -> bool {
        matches!(self.format, ParcelFormat::Rpc(_))
    }

    pub(crate) fn is_for_session(&self, session: &RpcSession) -> bool {
        match &self.format {
            ParcelFormat::Rpc(s) => s.ptr_eq(session),
            ParcelFormat::Local => false,
        }
    }

    fn same_format(&self, other: &Parcel) -> bool {
        match (&self.format, &other.format) {
            (ParcelFormat::Local, ParcelFormat::Local) => true,
            (ParcelFormat::Rpc(a), ParcelFormat::Rpc(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn data_position(&self) -> usize {
        self.pos
    }

    pub fn set_data_position(&mut self, pos: usize) -> Result<(), Status> {
        if pos > self.data.len() {
            return Err(Status::with_message(
                StatusCode::BadValue,
                format!("position {pos} past end of {} byte parcel", self.data.len()),
            ));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn pad(&mut self) {
        while self.data.len() % 4 != 0 {
            self.data.push(0);
        }
    }

    pub fn write_i32(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_i32(value as i32);
    }

    /// Length-prefixed UTF-8; `None` is written as length -1.
    pub fn write_string(&mut self, value: Option<&str>) {
        match value {
            Some(s) => self.write_str(s),
            None => self.write_i32(-1),
        }
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_byte_array(value.as_bytes());
    }

    pub fn write_byte_array(&mut self, value: &[u8]) {
        self.write_i32(value.len() as i32);
        self.data.extend_from_slice(value);
        self.pad();
    }

    /// Write a nullable object reference.
    ///
    /// In a session-format parcel only local objects and proxies of that same
    /// session are accepted; anything else is [`StatusCode::InvalidOperation`].
    pub fn write_binder(&mut self, binder: Option<&SpBinder>) -> Result<(), Status> {
        let Some(binder) = binder else {
            self.write_i32(0);
            return Ok(());
        };
        if let ParcelFormat::Rpc(session) = &self.format {
            session.check_sendable(binder)?;
        }
        let offset = self.data.len();
        self.write_i32(1);
        self.write_u64(0);
        self.objects.push(ParcelObject {
            offset,
            binder: binder.clone(),
        });
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&[u8], Status> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                Status::with_message(
                    StatusCode::BadValue,
                    format!(
                        "read of {len} bytes at {} overruns {} byte parcel",
                        self.pos,
                        self.data.len()
                    ),
                )
            })?;
        let start = self.pos;
        self.pos = end;
        Ok(&self.data[start..end])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], Status> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_i32(&mut self) -> Result<i32, Status> {
        self.take_array().map(i32::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, Status> {
        self.take_array().map(u32::from_le_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64, Status> {
        self.take_array().map(i64::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64, Status> {
        self.take_array().map(u64::from_le_bytes)
    }

    pub fn read_bool(&mut self) -> Result<bool, Status> {
        Ok(self.read_i32()? != 0)
    }

    pub fn read_byte_array(&mut self) -> Result<Option<Vec<u8>>, Status> {
        let len = self.read_i32()?;
        if len == -1 {
            return Ok(None);
        }
        let len = usize::try_from(len)
            .map_err(|_| Status::with_message(StatusCode::BadValue, "negative array length"))?;
        let bytes = self.take(len)?.to_vec();
        let padding = (4 - len % 4) % 4;
        self.take(padding)?;
        Ok(Some(bytes))
    }

    pub fn read_string(&mut self) -> Result<Option<String>, Status> {
        match self.read_byte_array()? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| Status::with_message(StatusCode::BadValue, "string is not UTF-8")),
            None => Ok(None),
        }
    }

    /// Read a non-null string.
    pub fn read_str(&mut self) -> Result<String, Status> {
        self.read_string()?
            .ok_or_else(|| Status::new(StatusCode::UnexpectedNull))
    }

    /// Read a nullable object reference.
    pub fn read_binder(&mut self) -> Result<Option<SpBinder>, Status> {
        let start = self.pos;
        match self.read_i32()? {
            0 => Ok(None),
            1 => {
                self.take(8)?;
                self.objects
                    .binary_search_by_key(&start, |o| o.offset)
                    .map(|i| Some(self.objects[i].binder.clone()))
                    .map_err(|_| {
                        Status::with_message(
                            StatusCode::BadType,
                            format!("no object recorded at offset {start}"),
                        )
                    })
            }
            other => Err(Status::with_message(
                StatusCode::BadType,
                format!("bad object marker {other}"),
            )),
        }
    }

    /// Read an object reference that must not be null.
    pub fn read_strong_binder(&mut self) -> Result<SpBinder, Status> {
        self.read_binder()?
            .ok_or_else(|| Status::new(StatusCode::UnexpectedNull))
    }

    /// Append `len` bytes of `other` starting at `start`, with any object
    /// slots in that range.
    ///
    /// Both parcels must have the same format ([`StatusCode::BadType`]
    /// otherwise).
    pub fn append_from(&mut self, other: &Parcel, start: usize, len: usize) -> Result<(), Status> {
        if !self.same_format(other) {
            return Err(Status::with_message(
                StatusCode::BadType,
                "cannot append a parcel of a different format",
            ));
        }
        let end = start
            .checked_add(len)
            .filter(|end| *end <= other.data.len())
            .ok_or_else(|| Status::new(StatusCode::BadValue))?;

        self.pad();
        let base = self.data.len();
        let mut appended = Vec::new();
        for object in &other.objects {
            let object_end = object.offset + BINDER_SLOT_SIZE;
            if object_end <= start || object.offset >= end {
                continue;
            }
            if object.offset < start || object_end > end {
                return Err(Status::with_message(
                    StatusCode::BadValue,
                    "range splits an object slot",
                ));
            }
            appended.push(ParcelObject {
                offset: base + (object.offset - start),
                binder: object.binder.clone(),
            });
        }
        self.data.extend_from_slice(&other.data[start..end]);
        self.objects.extend(appended);
        Ok(())
    }

    /// Resolve object slots into addresses of `session`.
    ///
    /// Every slot is checked before any reference is counted, so a rejected
    /// parcel leaves the table untouched.
    pub(crate) fn into_wire(mut self, session: &RpcSession) -> Result<WireParcel, Status> {
        for object in &self.objects {
            session.check_sendable(&object.binder)?;
        }
        let mut offsets = Vec::with_capacity(self.objects.len());
        for object in std::mem::take(&mut self.objects) {
            let address = session.table().on_binder_leaving(&object.binder)?;
            self.data[object.offset + 4..object.offset + BINDER_SLOT_SIZE]
                .copy_from_slice(&address.to_le_bytes());
            offsets.push(object.offset as u32);
        }
        Ok(WireParcel {
            data: Bytes::from(std::mem::take(&mut self.data)),
            offsets,
        })
    }

    /// Build a parcel from the wire, resolving every object slot right away
    /// so references the handler never reads are still released.
    ///
    /// The slot layout is checked in full before any reference is counted.
    /// Any error here is fatal to the session, which drops its whole table.
    pub(crate) fn from_wire(wire: WireParcel, session: &RpcSession) -> Result<Self, Status> {
        let mut parcel = Self::for_session(session);
        parcel.data = wire.data.to_vec();

        let mut addresses = Vec::with_capacity(wire.offsets.len());
        let mut previous_end = 0usize;
        for offset in wire.offsets {
            let offset = offset as usize;
            if offset < previous_end || offset + BINDER_SLOT_SIZE > parcel.data.len() {
                return Err(Status::with_message(
                    StatusCode::BadType,
                    format!("object slot at {offset} overlaps or overruns parcel"),
                ));
            }
            previous_end = offset + BINDER_SLOT_SIZE;
            let slot = &parcel.data[offset..previous_end];
            let mut marker = [0u8; 4];
            marker.copy_from_slice(&slot[..4]);
            if i32::from_le_bytes(marker) != 1 {
                return Err(Status::with_message(
                    StatusCode::BadType,
                    format!("object slot at {offset} is not marked present"),
                ));
            }
            let mut address = [0u8; 8];
            address.copy_from_slice(&slot[4..]);
            addresses.push((offset, u64::from_le_bytes(address)));
        }

        for (offset, address) in addresses {
            let binder = session.table().on_binder_entering(session, address)?;
            parcel.objects.push(ParcelObject { offset, binder });
        }
        Ok(parcel)
    }
}

impl fmt::Debug for Parcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parcel")
            .field("data_size", &self.data.len())
            .field("position", &self.pos)
            .field("objects", &self.objects.len())
            .field("rpc", &self.is_for_rpc())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Binder, CallContext};
    use futures::future::BoxFuture;

    struct Dummy;

    impl Binder for Dummy {
        fn descriptor(&self) -> &str {
            "dummy"
        }

        fn on_transact(
            &self,
            _code: u32,
            _data: Parcel,
            _cx: CallContext,
        ) -> BoxFuture<'static, Result<Parcel, Status>> {
            Box::pin(async { Err(StatusCode::UnknownTransaction.into()) })
        }
    }

    #[test]
    fn primitives_and_strings() {
        let mut p = Parcel::new();
        p.write_i32(-7);
        p.write_bool(true);
        p.write_str("cool ");
        p.write_string(None);
        p.write_u64(u64::MAX);
        assert_eq!(p.data_size() % 4, 0);

        p.set_data_position(0).unwrap();
        assert_eq!(p.read_i32().unwrap(), -7);
        assert!(p.read_bool().unwrap());
        assert_eq!(p.read_str().unwrap(), "cool ");
        assert_eq!(p.read_string().unwrap(), None);
        assert_eq!(p.read_u64().unwrap(), u64::MAX);
        assert_eq!(p.read_i32().unwrap_err(), StatusCode::BadValue);
    }

    #[test]
    fn null_string_is_unexpected_null_for_required_reads() {
        let mut p = Parcel::new();
        p.write_string(None);
        p.set_data_position(0).unwrap();
        assert_eq!(p.read_str().unwrap_err(), StatusCode::UnexpectedNull);
    }

    #[test]
    fn binders_in_local_parcels() {
        let object = SpBinder::new(Dummy);
        let mut p = Parcel::new();
        p.write_binder(Some(&object)).unwrap();
        p.write_binder(None).unwrap();
        assert_eq!(p.object_count(), 1);

        p.set_data_position(0).unwrap();
        assert_eq!(p.read_binder().unwrap(), Some(object));
        assert_eq!(p.read_binder().unwrap(), None);
    }

    #[test]
    fn append_carries_objects() {
        let object = SpBinder::new(Dummy);
        let mut src = Parcel::new();
        src.write_i32(5);
        src.write_binder(Some(&object)).unwrap();

        let mut dst = Parcel::new();
        dst.write_i32(1);
        dst.append_from(&src, 0, src.data_size()).unwrap();
        dst.set_data_position(0).unwrap();
        assert_eq!(dst.read_i32().unwrap(), 1);
        assert_eq!(dst.read_i32().unwrap(), 5);
        assert_eq!(dst.read_strong_binder().unwrap(), object);
    }

    #[test]
    fn append_rejects_split_slots() {
        let object = SpBinder::new(Dummy);
        let mut src = Parcel::new();
        src.write_binder(Some(&object)).unwrap();
        let mut dst = Parcel::new();
        assert_eq!(
            dst.append_from(&src, 4, 8).unwrap_err(),
            StatusCode::BadValue
        );
    }

    #[test]
    fn reading_garbage_as_binder_is_bad_type() {
        let mut p = Parcel::new();
        p.write_i32(1);
        p.write_u64(3);
        p.set_data_position(0).unwrap();
        assert_eq!(p.read_binder().unwrap_err(), StatusCode::BadType);
    }

    fn slots(slots: &[(i32, u64)], offsets: Vec<u32>) -> WireParcel {
        let mut data = Vec::new();
        for (marker, address) in slots {
            data.extend_from_slice(&marker.to_le_bytes());
            data.extend_from_slice(&address.to_le_bytes());
        }
        WireParcel {
            data: data.into(),
            offsets,
        }
    }

    #[test]
    fn bad_slot_layout_counts_no_references() {
        use crate::wire::ADDRESS_SERVER_BIT;

        let session = RpcSession::new();
        // The first slot is a valid remote object; the second overlaps it.
        let wire = slots(
            &[(1, ADDRESS_SERVER_BIT | 1), (1, ADDRESS_SERVER_BIT | 2)],
            vec![0, 4],
        );
        let err = Parcel::from_wire(wire, &session).unwrap_err();
        assert_eq!(err, StatusCode::BadType);
        assert_eq!(session.count_binders(), 0);
    }

    #[test]
    fn unknown_local_address_is_rejected() {
        let session = RpcSession::new();
        let wire = slots(&[(1, 0x42)], vec![0]);
        assert_eq!(
            Parcel::from_wire(wire, &session).unwrap_err(),
            StatusCode::BadValue
        );
        assert_eq!(session.count_binders(), 0);
    }
}

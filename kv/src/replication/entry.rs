//! Stream-entry framing (C2): the unit that carries one transaction's (or
//! one group-commit marker's) replication objects through the byte stream.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::replication::object::{Lsa, ReplicationObject};
use crate::replication::stream::Stream;

/// `tran_state` on a stream entry's header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum TranState {
    Undefined = 0,
    Active = 1,
    Committed = 2,
    Aborted = 3,
    GroupCommit = 4,
    NewMaster = 5,
    SubtranCommit = 6,
    StartOfExtractHeap = 7,
    EndOfExtractHeap = 8,
    EndOfReplicationCopy = 9,
}

impl TranState {
    fn from_i32(v: i32) -> CResult<Self> {
        Ok(match v {
            0 => TranState::Undefined,
            1 => TranState::Active,
            2 => TranState::Committed,
            3 => TranState::Aborted,
            4 => TranState::GroupCommit,
            5 => TranState::NewMaster,
            6 => TranState::SubtranCommit,
            7 => TranState::StartOfExtractHeap,
            8 => TranState::EndOfExtractHeap,
            9 => TranState::EndOfReplicationCopy,
            other => return Err(Error::Parse(format!("invalid tran_state: {}", other))),
        })
    }
}

/// `{ prev_record_position, mvccid, object_count, data_size, tran_state }`,
/// packed on the wire in that exact order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EntryHeader {
    pub prev_record_position: u64,
    pub mvccid: u64,
    pub object_count: i32,
    pub data_size: i32,
    pub tran_state: TranState,
}

pub(crate) const HEADER_LEN: usize = 8 + 8 + 4 + 4 + 4;

impl EntryHeader {
    fn write_to(&self, out: &mut Vec<u8>) -> CResult<()> {
        out.write_u64::<BigEndian>(self.prev_record_position)?;
        out.write_u64::<BigEndian>(self.mvccid)?;
        out.write_i32::<BigEndian>(self.object_count)?;
        out.write_i32::<BigEndian>(self.data_size)?;
        out.write_i32::<BigEndian>(self.tran_state as i32)?;
        Ok(())
    }

    fn read_from(bytes: &[u8]) -> CResult<Self> {
        let mut cursor = std::io::Cursor::new(bytes);
        let prev_record_position = cursor.read_u64::<BigEndian>()?;
        let mvccid = cursor.read_u64::<BigEndian>()?;
        let object_count = cursor.read_i32::<BigEndian>()?;
        let data_size = cursor.read_i32::<BigEndian>()?;
        let tran_state = TranState::from_i32(cursor.read_i32::<BigEndian>()?)?;
        Ok(EntryHeader { prev_record_position, mvccid, object_count, data_size, tran_state })
    }
}

/// A stream entry: header plus the replication objects it carries.
///
/// Ownership passes through exactly one holder at a time: the producer
/// (`log_generator`) until `pack()`, the stream in between, the dispatcher
/// after `prepare()`/`unpack()`, then a single applier worker which
/// consumes and drops it.
#[derive(Clone, Debug)]
pub struct StreamEntry {
    pub header: EntryHeader,
    /// Start position of the body on the stream, filled in by `prepare()`
    /// on the consumer side; `None` on a freshly-built producer-side entry
    /// before `pack()`.
    pub body_start_position: Option<u64>,
    objects: Vec<ReplicationObject>,
}

impl StreamEntry {
    /// A fresh, empty entry in `Active` state, ready to accumulate objects.
    pub fn new_active(mvccid: u64, prev_record_position: u64) -> Self {
        StreamEntry {
            header: EntryHeader {
                prev_record_position,
                mvccid,
                object_count: 0,
                data_size: 0,
                tran_state: TranState::Active,
            },
            body_start_position: None,
            objects: Vec::new(),
        }
    }

    pub fn add_object(&mut self, obj: ReplicationObject) {
        self.objects.push(obj);
    }

    pub fn objects(&self) -> &[ReplicationObject] {
        &self.objects
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// This entry's own start position on the stream (the header's
    /// position), derived from `body_start_position`. `None` before
    /// `prepare()` has run.
    pub fn start_position(&self) -> Option<u64> {
        self.body_start_position.map(|p| p - HEADER_LEN as u64)
    }

    /// Drops every object whose LSA is strictly greater than `lsa`,
    /// supporting partial sysop rollback.
    pub fn destroy_objects_after_lsa(&mut self, lsa: Lsa) {
        self.objects.retain(|o| o.lsa() <= lsa);
    }

    /// Moves every object whose LSA is strictly greater than `lsa` out of
    /// `self` and into `dst`, preserving order. Used by
    /// `on_sysop_attach_to_outer`.
    pub fn move_replication_objects_after_lsa_to(&mut self, lsa: Lsa, dst: &mut StreamEntry) {
        let (keep, moved): (Vec<_>, Vec<_>) =
            self.objects.drain(..).partition(|o| o.lsa() <= lsa);
        self.objects = keep;
        dst.objects.extend(moved);
    }

    /// `pack()`: serializes the header and body, and appends them to the
    /// stream as one atomic write. Returns the start position.
    pub fn pack(&mut self, tran_state: TranState, stream: &Stream) -> CResult<u64> {
        self.header.tran_state = tran_state;

        let mut body = Vec::new();
        for obj in &self.objects {
            body.extend_from_slice(&obj.pack()?);
        }
        self.header.object_count = self.objects.len() as i32;
        self.header.data_size = body.len() as i32;

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        self.header.write_to(&mut out)?;
        out.extend_from_slice(&body);

        Ok(stream.append(&out))
    }

    /// Appends a header-only `GroupCommit` marker entry to the stream and
    /// returns the occupied `[start, end)` position range.
    pub fn pack_group_commit(mvccid: u64, prev_record_position: u64, stream: &Stream) -> CResult<(u64, u64)> {
        let header = EntryHeader {
            prev_record_position,
            mvccid,
            object_count: 0,
            data_size: 0,
            tran_state: TranState::GroupCommit,
        };
        let mut out = Vec::with_capacity(HEADER_LEN);
        header.write_to(&mut out)?;
        let start = stream.append(&out);
        Ok((start, start + out.len() as u64))
    }

    /// Consumer-side `prepare()`: reads the header at `position`, and
    /// records where the body begins, without materializing objects yet.
    /// Returns the entry and the position immediately after the body
    /// (the next entry's header position).
    pub fn prepare(stream: &Stream, position: u64) -> CResult<(Self, u64)> {
        let mut header_bytes = [0u8; HEADER_LEN];
        stream.read_at(position, HEADER_LEN, |chunk| header_bytes.copy_from_slice(chunk))?;
        let header = EntryHeader::read_from(&header_bytes)?;
        let body_start = position + HEADER_LEN as u64;
        let next_position = body_start + header.data_size as u64;

        let entry = StreamEntry {
            header,
            body_start_position: Some(body_start),
            objects: Vec::new(),
        };
        Ok((entry, next_position))
    }

    /// Lazily materializes this entry's objects from the stream body. A
    /// no-op if objects were already unpacked (e.g. a `GroupCommit` marker,
    /// which always has zero objects).
    pub fn unpack(&mut self, stream: &Stream) -> CResult<()> {
        if !self.objects.is_empty() || self.header.object_count == 0 {
            return Ok(());
        }
        let body_start = self
            .body_start_position
            .ok_or_else(|| Error::Internal("unpack() called before prepare()".into()))?;
        let mut body = vec![0u8; self.header.data_size as usize];
        stream.read_at(body_start, body.len(), |chunk| body.copy_from_slice(chunk))?;

        let mut offset = 0usize;
        for _ in 0..self.header.object_count {
            let (obj, consumed) = ReplicationObject::unpack(&body[offset..])?;
            offset += consumed;
            self.objects.push(obj);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::object::InstOid;

    fn insert_obj() -> ReplicationObject {
        ReplicationObject::SingleRowInsert {
            lsa: Lsa::new(1, 0),
            class_name: "t".to_string(),
            key: vec![42],
            record: vec![1, 2, 3],
        }
    }

    #[test]
    fn pack_prepare_unpack_round_trip() {
        let stream = Stream::new();
        let mut entry = StreamEntry::new_active(100, 0);
        entry.add_object(insert_obj());
        let start = entry.pack(TranState::Committed, &stream).unwrap();
        assert_eq!(start, 0);

        let (mut prepared, next) = StreamEntry::prepare(&stream, start).unwrap();
        assert_eq!(prepared.header.mvccid, 100);
        assert_eq!(prepared.header.tran_state, TranState::Committed);
        assert_eq!(prepared.header.object_count, 1);
        assert_eq!(next, HEADER_LEN as u64 + prepared.header.data_size as u64);

        prepared.unpack(&stream).unwrap();
        assert_eq!(prepared.objects(), &[insert_obj()]);
    }

    #[test]
    fn header_round_trips_for_every_tran_state() {
        let states = [
            TranState::Undefined,
            TranState::Active,
            TranState::Committed,
            TranState::Aborted,
            TranState::GroupCommit,
            TranState::NewMaster,
            TranState::SubtranCommit,
            TranState::StartOfExtractHeap,
            TranState::EndOfExtractHeap,
            TranState::EndOfReplicationCopy,
        ];
        for tran_state in states {
            let header = EntryHeader {
                prev_record_position: 12,
                mvccid: 34,
                object_count: 5,
                data_size: 6,
                tran_state,
            };
            let mut bytes = Vec::new();
            header.write_to(&mut bytes).unwrap();
            let decoded = EntryHeader::read_from(&bytes).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn start_position_recovers_the_entry_header_offset() {
        let stream = Stream::new();
        let (start, _end) = StreamEntry::pack_group_commit(1, 0, &stream).unwrap();
        let second = StreamEntry::pack_group_commit(2, start, &stream).unwrap().0;
        let (entry, _) = StreamEntry::prepare(&stream, second).unwrap();
        assert_eq!(entry.start_position(), Some(second));
    }

    #[test]
    fn group_commit_marker_has_zero_objects() {
        let stream = Stream::new();
        let (start, end) = StreamEntry::pack_group_commit(100, 0, &stream).unwrap();
        assert_eq!(end - start, HEADER_LEN as u64);

        let (mut entry, _) = StreamEntry::prepare(&stream, start).unwrap();
        assert_eq!(entry.header.tran_state, TranState::GroupCommit);
        assert_eq!(entry.header.data_size, 0);
        entry.unpack(&stream).unwrap();
        assert!(entry.objects().is_empty());
    }

    #[test]
    fn destroy_objects_after_lsa_drops_later_writes() {
        let mut entry = StreamEntry::new_active(1, 0);
        entry.add_object(ReplicationObject::SingleRowInsert {
            lsa: Lsa::new(1, 0),
            class_name: "t".into(),
            key: vec![1],
            record: vec![],
        });
        entry.add_object(ReplicationObject::SingleRowInsert {
            lsa: Lsa::new(2, 0),
            class_name: "t".into(),
            key: vec![2],
            record: vec![],
        });
        entry.destroy_objects_after_lsa(Lsa::new(1, 0));
        assert_eq!(entry.objects().len(), 1);
        assert_eq!(entry.objects()[0].lsa(), Lsa::new(1, 0));
    }

    #[test]
    fn move_objects_after_lsa_preserves_order_in_destination() {
        let mut src = StreamEntry::new_active(1, 0);
        let mut dst = StreamEntry::new_active(1, 0);
        for i in 0..3i64 {
            src.add_object(ReplicationObject::ChangedAttrsUpdate {
                lsa: Lsa::new(i, 0),
                class_name: "t".into(),
                inst_oid: InstOid { volid: 0, pageid: i as i32, slotid: 0 },
                key: vec![],
                changes: vec![],
            });
        }
        src.move_replication_objects_after_lsa_to(Lsa::new(0, 0), &mut dst);
        assert_eq!(src.objects().len(), 1);
        assert_eq!(dst.objects().len(), 2);
        assert_eq!(dst.objects()[0].lsa(), Lsa::new(1, 0));
        assert_eq!(dst.objects()[1].lsa(), Lsa::new(2, 0));
    }

    #[test]
    fn unsupported_object_fails_the_whole_entry() {
        let stream = Stream::new();
        let header = EntryHeader {
            prev_record_position: 0,
            mvccid: 1,
            object_count: 1,
            data_size: 4,
            tran_state: TranState::Committed,
        };
        let mut out = Vec::new();
        header.write_to(&mut out).unwrap();
        out.extend_from_slice(&[255u8, 0, 0, 0]);
        let start = stream.append(&out);

        let (mut entry, _) = StreamEntry::prepare(&stream, start).unwrap();
        let err = entry.unpack(&stream).unwrap_err();
        assert!(matches!(err, Error::UnsupportedObject(255)));
    }
}

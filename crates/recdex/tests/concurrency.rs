use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use recdex::{
    AccessMode, IndexSlice, IndexedReader, JsonLines, MemoryVfs, Recdex, RecdexConfig, Result,
    StreamInfo, VfsStream,
};
use serde_json::{Value, json};
use tempfile::tempdir;

/// A stream with no path to reopen it from.
struct Buffer {
    cursor: Cursor<Vec<u8>>,
    info: StreamInfo,
}

impl Buffer {
    fn boxed(bytes: Vec<u8>) -> Box<dyn VfsStream> {
        Box::new(Self {
            cursor: Cursor::new(bytes),
            info: StreamInfo::new("<buffer>", AccessMode::Read),
        })
    }
}

impl Read for Buffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Write for Buffer {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "read-only buffer"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for Buffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl VfsStream for Buffer {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn content_size(&mut self) -> io::Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }
}

fn record(i: u64) -> Value {
    json!({"seq": i, "payload": "x".repeat((i % 7) as usize)})
}

fn jsonl_bytes(count: u64) -> Vec<u8> {
    let mut bytes = Vec::new();
    for i in 0..count {
        serde_json::to_writer(&mut bytes, &record(i)).expect("encode");
        bytes.push(b'\n');
    }
    bytes
}

fn memory_reader(count: u64) -> IndexedReader<JsonLines<Value>> {
    let vfs = Arc::new(MemoryVfs::new());
    vfs.write_file("rows.jsonl", jsonl_bytes(count));
    Recdex::new(vfs, RecdexConfig::default())
        .expect("default config")
        .open_json_lines::<Value>("rows.jsonl", "r")
        .expect("open")
        .into_reader()
        .expect("reader")
}

#[test]
fn threads_share_one_reader() {
    let dir = tempdir().expect("create temp dir");
    let path = dir.path().join("rows.jsonl");
    std::fs::write(&path, jsonl_bytes(200)).expect("write data");
    let reader = Recdex::local()
        .open_json_lines::<Value>(path.to_str().expect("UTF-8 path"), "r")
        .expect("open")
        .into_reader()
        .expect("reader");
    assert_eq!(reader.count(), 200);

    thread::scope(|scope| {
        for worker in 0..4_u64 {
            let reader = &reader;
            scope.spawn(move || {
                for round in 0..50_u64 {
                    let i = (worker * 37 + round * 11) % 200;
                    assert_eq!(reader.get(i as i64).expect("get"), record(i));
                }
                let strided: Vec<Value> = reader
                    .batch_get(IndexSlice::new(Some(worker as i64), None, Some(4)))
                    .expect("slice")
                    .to_vec()
                    .expect("read");
                assert_eq!(strided.len(), 50);
                for (n, value) in strided.iter().enumerate() {
                    assert_eq!(*value, record(worker + 4 * n as u64));
                }
                let all: Vec<Value> = reader.iter().collect::<Result<_>>().expect("iterate");
                assert_eq!(all.len(), 200);
                assert_eq!(all[199], record(199));
            });
        }
    });
}

#[test]
fn iterators_keep_independent_cursors() {
    let reader = memory_reader(30);
    let mut forward = reader.iter();
    let mut tail = reader.batch_get(10_i64..).expect("slice").iter();

    for i in 0..20_u64 {
        assert_eq!(forward.next().expect("forward").expect("decode"), record(i));
        assert_eq!(reader.get(-1).expect("last"), record(29));
        assert_eq!(tail.next().expect("tail").expect("decode"), record(10 + i));
        assert_eq!(reader.get(0).expect("first"), record(0));
    }
    assert!(tail.next().is_none());
    assert_eq!(forward.count(), 10);
}

#[test]
fn closed_reader_refuses_reads() {
    let reader = memory_reader(3);
    reader.close().expect("close");
    reader.close().expect("second close is a no-op");
    assert!(reader.is_closed());
    let err = reader.get(0).unwrap_err();
    assert!(err.to_string().contains("closed reader"), "{err}");
}

#[test]
fn streams_without_a_path_are_shadowed() {
    let vfs = MemoryVfs::new();
    let reader = IndexedReader::from_stream(
        &vfs,
        Buffer::boxed(jsonl_bytes(64)),
        JsonLines::<Value>::new(),
        &RecdexConfig::default(),
        None,
    )
    .expect("open buffer");
    assert_eq!(reader.count(), 64);
    assert!(!reader.is_persisted());
    assert_eq!(reader.name(), "<buffer>");

    thread::scope(|scope| {
        for worker in 0..3_u64 {
            let reader = &reader;
            scope.spawn(move || {
                for i in (worker..64).step_by(3) {
                    assert_eq!(reader.get(i as i64).expect("get"), record(i));
                }
            });
        }
        let reversed: Vec<Value> = reader
            .batch_get(IndexSlice::step_by(-1))
            .expect("slice")
            .to_vec()
            .expect("read");
        assert_eq!(reversed.first(), Some(&record(63)));
        assert_eq!(reversed.last(), Some(&record(0)));
    });
}

/// Positions a `start:stop:step` slice selects from a sequence of `len` items.
fn reference_slice(len: i64, start: Option<i64>, stop: Option<i64>, step: i64) -> Vec<i64> {
    let (lower, upper) = if step < 0 { (-1, len - 1) } else { (0, len) };
    let clamp = |bound: i64| {
        if bound < 0 {
            (bound + len).max(lower)
        } else {
            bound.min(upper)
        }
    };
    let start = start.map_or(if step < 0 { upper } else { lower }, clamp);
    let stop = stop.map_or(if step < 0 { lower } else { upper }, clamp);
    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(i);
        let Some(next) = i.checked_add(step) else { break };
        i = next;
    }
    out
}

fn bound() -> impl Strategy<Value = Option<i64>> {
    prop::option::of(-30_i64..30)
}

fn step() -> impl Strategy<Value = i64> {
    prop_oneof![
        4 => -5_i64..=-1,
        4 => 1_i64..=5,
        1 => -21_i64..=-18,
        1 => 18_i64..=21,
        1 => Just(i64::MIN),
        1 => Just(i64::MAX),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn slices_match_sequence_semantics(
        count in 0_u64..20,
        start in bound(),
        stop in bound(),
        step in step(),
    ) {
        let reader = memory_reader(count);
        let slice = IndexSlice::new(start, stop, Some(step));
        let got = reader.batch_get(slice).expect("slice").to_vec().expect("read");
        let expected: Vec<Value> = reference_slice(count as i64, start, stop, step)
            .into_iter()
            .map(|i| record(i as u64))
            .collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn nested_slices_compose(
        count in 0_u64..20,
        outer in (bound(), bound(), step()),
        inner in (bound(), bound(), step()),
    ) {
        let reader = memory_reader(count);
        let first = reader
            .batch_get(IndexSlice::new(outer.0, outer.1, Some(outer.2)))
            .expect("outer slice");
        let nested = first
            .slice(IndexSlice::new(inner.0, inner.1, Some(inner.2)))
            .expect("inner slice");

        let positions = reference_slice(count as i64, outer.0, outer.1, outer.2);
        let picked = reference_slice(positions.len() as i64, inner.0, inner.1, inner.2);
        let expected: Vec<Value> = picked
            .into_iter()
            .map(|n| record(positions[n as usize] as u64))
            .collect();
        prop_assert_eq!(nested.len(), expected.len() as u64);
        prop_assert_eq!(nested.to_vec().expect("read"), expected);
    }
}

#[test]
fn widest_steps_read_one_record() {
    let reader = memory_reader(5);
    let last = reader
        .batch_get(IndexSlice::step_by(i64::MIN))
        .expect("slice")
        .to_vec()
        .expect("read");
    assert_eq!(last, vec![record(4)]);

    let evens = reader.batch_get(IndexSlice::step_by(2)).expect("slice");
    let head = evens.slice(IndexSlice::step_by(i64::MAX)).expect("nested slice");
    assert_eq!(head.to_vec().expect("read"), vec![record(0)]);
}

#[test]
fn zero_step_is_rejected() {
    let reader = memory_reader(5);
    let err = reader.batch_get(IndexSlice::step_by(0)).unwrap_err();
    assert!(err.to_string().contains("slice step cannot be zero"), "{err}");
}

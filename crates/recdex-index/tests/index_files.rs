use std::fs;
use std::io::{BufRead, Read};

use proptest::prelude::*;
use recdex_error::Result;
use recdex_index::{
    AcquiredIndex, BoundaryScanner, HEADER_SIZE, IndexHeader, IndexRequest, IndexSlice,
    OffsetArray, OffsetEncoding, OffsetLayout, OffsetSink, OpenMode, ScanObserver, acquire_index,
};
use recdex_vfs::{AccessMode, LocalVfs, Vfs};
use tempfile::tempdir;

/// Records of one fixed size; a short tail is left unindexed.
struct FixedWidth(usize);

impl BoundaryScanner for FixedWidth {
    fn scan_boundaries(
        &self,
        data: &mut dyn BufRead,
        _stream: &str,
        sink: &mut dyn OffsetSink,
        _observer: Option<&mut ScanObserver<'_>>,
    ) -> Result<u64> {
        let mut offset = 0_u64;
        let mut record = vec![0_u8; self.0];
        loop {
            let mut filled = 0;
            while filled < record.len() {
                let n = data.read(&mut record[filled..])?;
                if n == 0 {
                    return Ok(offset);
                }
                filled += n;
            }
            sink.push_offset(offset)?;
            offset += self.0 as u64;
        }
    }
}

fn path_str(path: &std::path::Path) -> String {
    path.to_str().expect("temp paths are UTF-8").to_owned()
}

#[test]
fn index_file_on_disk_matches_layout() {
    let dir = tempdir().expect("create temp dir");
    let data_path = path_str(&dir.path().join("records.bin"));
    let index_path = format!("{data_path}.idx");
    fs::write(&data_path, [7_u8; 12]).expect("write data");

    let vfs = LocalVfs::new();
    let mut data = vfs.open(&data_path, AccessMode::Read).expect("open data");
    let request = IndexRequest {
        vfs: &vfs,
        index_path: Some(index_path.as_str()),
        layout: OffsetLayout::indexed(OffsetEncoding::U32),
        writable: false,
    };
    let acquired = acquire_index(&request, data.as_mut(), &FixedWidth(4), None).expect("acquire");
    assert!(acquired.is_persisted());
    assert_eq!(acquired.count(), 3);

    let bytes = fs::read(&index_path).expect("read index");
    let mut expected = IndexHeader::new(OffsetEncoding::U32, 12).to_bytes().to_vec();
    for offset in [0_u32, 4, 8] {
        expected.extend_from_slice(&offset.to_le_bytes());
    }
    assert_eq!(bytes, expected, "index bytes must be header + LE u32 offsets");
    assert_eq!(&bytes[4..8], b"I   ");

    let again = acquire_index(&request, data.as_mut(), &FixedWidth(4), None).expect("reacquire");
    assert!(
        matches!(again, AcquiredIndex::Persisted { rebuilt: None, .. }),
        "a matching header must be trusted without rebuilding"
    );
}

#[test]
fn missing_parent_directory_degrades_to_memory() {
    let dir = tempdir().expect("create temp dir");
    let data_path = path_str(&dir.path().join("records.bin"));
    let index_path = path_str(&dir.path().join("no-such-dir").join("records.idx"));
    fs::write(&data_path, [1_u8; 6]).expect("write data");

    let vfs = LocalVfs::new();
    let mut data = vfs.open(&data_path, AccessMode::Read).expect("open data");
    let request = IndexRequest {
        vfs: &vfs,
        index_path: Some(index_path.as_str()),
        layout: OffsetLayout::default(),
        writable: false,
    };
    let acquired = acquire_index(&request, data.as_mut(), &FixedWidth(2), None).expect("acquire");
    match acquired {
        AcquiredIndex::Ephemeral { offsets, .. } => assert_eq!(offsets, vec![0, 2, 4]),
        AcquiredIndex::Persisted { .. } => panic!("index in a missing directory cannot persist"),
    }
}

#[test]
fn raw_offset_file_modes_on_disk() {
    let dir = tempdir().expect("create temp dir");
    let path = path_str(&dir.path().join("offsets.bin"));
    let vfs = LocalVfs::new();
    let layout = OffsetLayout::headerless(OffsetEncoding::U64);

    let mut array = OffsetArray::open(&vfs, &path, OpenMode::ReadAppend, layout).expect("a+");
    array.append(5).expect("append");
    array.append(9).expect("append");
    array.close().expect("close");

    let mut array = OffsetArray::open(&vfs, &path, OpenMode::ReadAppend, layout).expect("a+ again");
    assert_eq!(array.count(), 2);
    array.put(0, 4).expect("put");
    array.append(11).expect("append");
    let values: Vec<u64> = array.scan().collect::<Result<_>>().expect("scan");
    assert_eq!(values, vec![4, 9, 11]);
    array.close().expect("close");

    assert_eq!(fs::metadata(&path).expect("stat").len(), 24);
    assert!(fs::read(&path).expect("read").len() % 8 == 0);
    assert_eq!(HEADER_SIZE, 16);
}

fn encoding() -> impl Strategy<Value = OffsetEncoding> {
    prop_oneof![
        Just(OffsetEncoding::U64),
        Just(OffsetEncoding::U32),
        Just(OffsetEncoding::U64Be),
        Just(OffsetEncoding::U32Be),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn scan_and_slices_match_written_values(
        values in prop::collection::vec(0_u64..u64::from(u32::MAX), 0..120),
        encoding in encoding(),
        page_size in 1_usize..96,
        start in prop::option::of(-130_i64..130),
        stop in prop::option::of(-130_i64..130),
        step in prop_oneof![-5_i64..0, 1_i64..6],
    ) {
        let dir = tempdir().expect("create temp dir");
        let path = path_str(&dir.path().join("values.idx"));
        let vfs = LocalVfs::new();
        let layout = OffsetLayout::indexed(encoding).with_page_size(page_size);

        let mut array = OffsetArray::open(&vfs, &path, OpenMode::ReadWrite, layout).expect("open");
        array.write_header(0, true).expect("header");
        for &value in &values {
            array.append(value).expect("append");
        }
        array.write_header(values.len() as u64, false).expect("finalize");
        array.close().expect("close");

        let mut array = OffsetArray::open(&vfs, &path, OpenMode::Read, layout).expect("reopen");
        let scanned: Vec<u64> = array.scan().collect::<Result<_>>().expect("scan");
        prop_assert_eq!(&scanned, &values);

        let slice = IndexSlice::new(start, stop, Some(step));
        let expected: Vec<u64> = slice
            .resolve(values.len() as u64)
            .expect("resolve")
            .iter()
            .map(|i| values[i as usize])
            .collect();
        let sliced: Vec<u64> = array
            .batch_get(&slice)
            .expect("batch_get")
            .collect::<Result<_>>()
            .expect("read slice");
        prop_assert_eq!(sliced, expected);
        prop_assert!(OffsetArray::check_header(&vfs, &path, encoding, values.len() as u64));
    }
}

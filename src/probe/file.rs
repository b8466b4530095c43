//! On-disk irradiance-probe store.
//!
//! Layout: a 12-byte header of three little-endian u32 grid dimensions,
//! then zero or more records of a u64 LE byte count followed by that
//! many raw RGBA32F pixel bytes. The file is append-only so a killed
//! bake resumes where it stopped; readers walk records until EOF and
//! never trust any record count other than what is actually present.

use crate::error::{RenderError, RenderResult};

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFileContents {
    pub grid_dims: [u32; 3],
    pub records: Vec<Vec<u8>>,
}

/// Read header and every complete record. A trailing partial record
/// (interrupted append) is dropped with a warning.
pub fn read_probe_file(path: &Path) -> RenderResult<ProbeFileContents> {
    let file = File::open(path)?;
    let mut r = BufReader::new(file);

    let mut header = [0u8; 12];
    r.read_exact(&mut header)
        .map_err(|_| RenderError::probe("probe file shorter than its header"))?;
    let grid_dims = [
        u32::from_le_bytes(header[0..4].try_into().unwrap()),
        u32::from_le_bytes(header[4..8].try_into().unwrap()),
        u32::from_le_bytes(header[8..12].try_into().unwrap()),
    ];
    if grid_dims.iter().any(|&d| d == 0) {
        return Err(RenderError::probe("probe file has a zero grid dimension"));
    }

    let mut records = Vec::new();
    loop {
        let mut size_bytes = [0u8; 8];
        match r.read_exact(&mut size_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let size = u64::from_le_bytes(size_bytes);
        if size > (1 << 32) {
            return Err(RenderError::probe(format!(
                "probe record claims {size} bytes; file is corrupt"
            )));
        }
        let mut data = vec![0u8; size as usize];
        match r.read_exact(&mut data) {
            Ok(()) => records.push(data),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                log::warn!(
                    "probe file {} ends mid-record; dropping partial probe {}",
                    path.display(),
                    records.len()
                );
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(ProbeFileContents { grid_dims, records })
}

/// Appends probe records, creating the file (with header) when absent.
pub struct ProbeFileWriter {
    out: BufWriter<File>,
}

impl ProbeFileWriter {
    /// Create a fresh probe file and write the header.
    pub fn create(path: &Path, grid_dims: [u32; 3]) -> RenderResult<Self> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        for dim in grid_dims {
            out.write_all(&dim.to_le_bytes())?;
        }
        out.flush()?;
        Ok(Self { out })
    }

    /// Reopen an existing probe file for appending further records.
    pub fn append_to(path: &Path) -> RenderResult<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    /// Write one record and flush, so every completed probe survives a
    /// crash.
    pub fn append_record(&mut self, data: &[u8]) -> RenderResult<()> {
        self.out.write_all(&(data.len() as u64).to_le_bytes())?;
        self.out.write_all(data)?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_dims_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probes.bin");

        let a = vec![1u8; 64];
        let b = vec![2u8; 32];
        {
            let mut w = ProbeFileWriter::create(&path, [4, 2, 3]).unwrap();
            w.append_record(&a).unwrap();
            w.append_record(&b).unwrap();
        }

        let contents = read_probe_file(&path).unwrap();
        assert_eq!(contents.grid_dims, [4, 2, 3]);
        assert_eq!(contents.records, vec![a, b]);
    }

    #[test]
    fn resumed_appends_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probes.bin");

        ProbeFileWriter::create(&path, [1, 1, 2])
            .unwrap()
            .append_record(&[9u8; 16])
            .unwrap();
        ProbeFileWriter::append_to(&path)
            .unwrap()
            .append_record(&[7u8; 16])
            .unwrap();

        let contents = read_probe_file(&path).unwrap();
        assert_eq!(contents.records.len(), 2);
        assert_eq!(contents.records[1], vec![7u8; 16]);
    }

    #[test]
    fn partial_trailing_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probes.bin");

        {
            let mut w = ProbeFileWriter::create(&path, [2, 2, 2]).unwrap();
            w.append_record(&[3u8; 24]).unwrap();
        }
        // simulate an interrupted append: size prefix but short payload
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&100u64.to_le_bytes()).unwrap();
            f.write_all(&[1, 2, 3]).unwrap();
        }

        let contents = read_probe_file(&path).unwrap();
        assert_eq!(contents.records.len(), 1);
    }

    #[test]
    fn empty_record_list_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probes.bin");
        ProbeFileWriter::create(&path, [3, 3, 3]).unwrap();
        let contents = read_probe_file(&path).unwrap();
        assert!(contents.records.is_empty());
    }

    #[test]
    fn header_truncation_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probes.bin");
        std::fs::write(&path, [0u8; 5]).unwrap();
        assert!(matches!(
            read_probe_file(&path),
            Err(RenderError::Probe(_))
        ));
    }
}

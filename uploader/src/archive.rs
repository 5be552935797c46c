use std::io;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Builds a zip in memory from named byte buffers.
pub fn zip_bytes(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>, ArchiveError> {
    let mut writer = ZipWriter::new(io::Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, bytes) in entries {
        writer.start_file(name.as_str(), options)?;
        io::Write::write_all(&mut writer, bytes)?;
    }

    Ok(writer.finish()?.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn read_entries<R: io::Read + io::Seek>(reader: R) -> Vec<(String, String)> {
        let mut archive = zip::ZipArchive::new(reader).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut entry = archive.by_index(i).unwrap();
                let mut contents = String::new();
                entry.read_to_string(&mut contents).unwrap();
                (entry.name().to_string(), contents)
            })
            .collect()
    }

    #[test]
    fn test_zip_bytes() {
        let bytes = zip_bytes(&[
            ("cand-1.csv".to_string(), b"a,b\r\n".to_vec()),
            ("exam-1.csv".to_string(), b"c,d\r\n".to_vec()),
        ])
        .unwrap();

        let entries = read_entries(io::Cursor::new(bytes));
        assert_eq!(
            entries,
            vec![
                ("cand-1.csv".to_string(), "a,b\r\n".to_string()),
                ("exam-1.csv".to_string(), "c,d\r\n".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_entries() {
        let bytes = zip_bytes(&[("item-1.csv".to_string(), Vec::new())]).unwrap();
        let entries = read_entries(io::Cursor::new(bytes));
        assert_eq!(entries, vec![("item-1.csv".to_string(), String::new())]);
    }
}

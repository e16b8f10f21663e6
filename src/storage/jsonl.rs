//! Append-only JSONL files for small operational journals

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::Result;

/// One JSON document per line, appended in order
#[derive(Debug)]
pub struct JsonlFile<T> {
    path: PathBuf,
    _entry: PhantomData<fn() -> T>,
}

impl<T> JsonlFile<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Use `path`, creating its parent directory
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            _entry: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. A torn last line left by a crash is dropped first.
    pub fn append(&self, entry: &T) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new().read(true).append(true).create(true).open(&self.path)?;
        drop_torn_tail(&mut file)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Read every entry. A torn last line from a crash is skipped with a warning.
    pub fn read_all(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut lines = reader.lines().peekable();
        let mut entries = Vec::new();

        while let Some(line) = lines.next() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) if lines.peek().is_none() => {
                    warn!("Ignoring truncated last line of {:?}: {}", self.path, e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(entries)
    }

    /// Drop every entry
    pub fn truncate(&self) -> Result<()> {
        File::create(&self.path)?;
        Ok(())
    }
}

/// Cut the file back to its last complete line
fn drop_torn_tail(file: &mut File) -> Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let mut contents = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;
    let keep = contents.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    warn!("Dropping {} bytes of a torn journal line", contents.len() - keep);
    file.set_len(keep as u64)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        id: i64,
        note: String,
    }

    fn entry(id: i64) -> Entry {
        Entry {
            id,
            note: format!("note {}", id),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let file = JsonlFile::<Entry>::new(dir.path().join("nested/journal.jsonl")).unwrap();
        assert!(file.read_all().unwrap().is_empty());

        file.append(&entry(1)).unwrap();
        file.append(&entry(2)).unwrap();
        assert_eq!(file.read_all().unwrap(), vec![entry(1), entry(2)]);

        file.truncate().unwrap();
        assert!(file.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_torn_tail_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        std::fs::write(&path, "{\"id\":1,\"note\":\"note 1\"}\n{\"id\":2,\"no").unwrap();

        let file = JsonlFile::<Entry>::new(&path).unwrap();
        assert_eq!(file.read_all().unwrap(), vec![entry(1)]);
    }

    #[test]
    fn test_append_after_torn_tail_keeps_file_readable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        std::fs::write(&path, "{\"id\":1,\"note\":\"note 1\"}\n{\"id\":2,").unwrap();

        let file = JsonlFile::<Entry>::new(&path).unwrap();
        assert_eq!(file.read_all().unwrap(), vec![entry(1)]);

        file.append(&entry(3)).unwrap();
        file.append(&entry(4)).unwrap();
        assert_eq!(file.read_all().unwrap(), vec![entry(1), entry(3), entry(4)]);
    }

    #[test]
    fn test_corruption_in_the_middle_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        std::fs::write(&path, "garbage\n{\"id\":1,\"note\":\"note 1\"}\n").unwrap();

        let file = JsonlFile::<Entry>::new(&path).unwrap();
        assert!(file.read_all().is_err());
    }
}

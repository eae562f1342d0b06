use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Commit;

/// Encode one commit record as `[len][bincode][crc32]`. Returns the bytes written.
fn encode_commit(writer: &mut impl Write, commit: &Commit) -> io::Result<u64> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "commit record too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(8 + u64::from(len))
}

/// Fill `buf` completely. `Ok(false)` means the file ended first.
fn read_entry_part(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only Write-Ahead Log of transaction commits.
///
/// Format per entry: `[u32: len][bincode: Commit][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - One entry holds every event of one transaction, so a torn write drops the
///   whole transaction on replay, never half of it.
///
/// The file never holds bytes past the last successful `flush_sync`: a failed
/// append or flush cuts the file back to that point and drops the buffer. If
/// the cut itself fails the WAL is poisoned and refuses further writes.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length after the last successful `flush_sync`.
    synced_len: u64,
    /// Bytes and commits buffered since then.
    pending_len: u64,
    pending_commits: u64,
    poisoned: Option<String>,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len,
            pending_len: 0,
            pending_commits: 0,
            poisoned: None,
            appends_since_compact: 0,
        })
    }

    /// Append a single commit and fsync. Production code goes through
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, commit: &Commit) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    /// Buffer a commit without flushing. `flush_sync()` makes the batch durable.
    /// On error every commit buffered since the last flush is discarded.
    pub fn append_buffered(&mut self, commit: &Commit) -> io::Result<()> {
        self.check_poisoned()?;
        match encode_commit(&mut self.writer, commit) {
            Ok(written) => {
                self.pending_len += written;
                self.pending_commits += 1;
                self.appends_since_compact += 1;
                Ok(())
            }
            Err(e) => Err(self.discard_unsynced(e)),
        }
    }

    /// Flush the BufWriter and fsync the underlying file. On error the
    /// unflushed batch is discarded from both the buffer and the file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.check_poisoned()?;
        let result = self
            .writer
            .flush()
            .and_then(|()| self.writer.get_ref().sync_all());
        match result {
            Ok(()) => {
                self.synced_len += self.pending_len;
                self.pending_len = 0;
                self.pending_commits = 0;
                Ok(())
            }
            Err(e) => Err(self.discard_unsynced(e)),
        }
    }

    /// Fail the unsynced batch as a write error would.
    #[cfg(test)]
    pub fn fail_unsynced(&mut self, cause: io::Error) -> io::Error {
        self.discard_unsynced(cause)
    }

    fn check_poisoned(&self) -> io::Result<()> {
        match &self.poisoned {
            Some(reason) => Err(io::Error::other(format!("WAL poisoned: {reason}"))),
            None => Ok(()),
        }
    }

    /// Drop everything written or buffered since the last sync and return
    /// `cause` for the caller to report.
    fn discard_unsynced(&mut self, cause: io::Error) -> io::Error {
        tracing::warn!(
            path = %self.path.display(),
            "discarding {} unsynced WAL commits after write error: {cause}",
            self.pending_commits
        );
        self.appends_since_compact = self.appends_since_compact.saturating_sub(self.pending_commits);
        self.pending_len = 0;
        self.pending_commits = 0;
        if let Err(e) = self.truncate_to_synced() {
            tracing::error!(path = %self.path.display(), "WAL rollback failed, refusing further writes: {e}");
            self.poisoned = Some(format!("rollback after \"{cause}\" failed: {e}"));
        }
        cause
    }

    fn truncate_to_synced(&mut self) -> io::Result<()> {
        // Dropping a BufWriter flushes it, so the failed bytes are released
        // through `into_parts` before anything else can fail.
        let file = self.writer.get_ref().try_clone()?;
        let old = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let _ = old.into_parts();
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot to a temp file and fsync.
    pub fn write_compact_file(path: &Path, commits: &[Commit]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for commit in commits {
            encode_commit(&mut writer, commit)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the temp file over the WAL and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.check_poisoned()?;
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let reopened = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|file| Ok((file.metadata()?.len(), file)));
        let (len, file) = match reopened {
            Ok(opened) => opened,
            Err(e) => {
                self.poisoned = Some(format!("reopen after compaction failed: {e}"));
                return Err(e);
            }
        };
        let old = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let _ = old.into_parts();
        self.synced_len = len;
        self.pending_len = 0;
        self.pending_commits = 0;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, commits: &[Commit]) -> io::Result<()> {
        Self::write_compact_file(&self.path, commits)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid commits in order.
    ///
    /// Only a torn final record is tolerated: it is cut off the file, so
    /// commits appended after recovery stay reachable. A bad record with more
    /// data behind it is corruption and fails the replay without touching the
    /// file.
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut commits = Vec::new();
        let mut valid_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            if !read_entry_part(&mut reader, &mut len_buf)? {
                break;
            }
            let len = u64::from(u32::from_le_bytes(len_buf));
            let entry_end = valid_len + 8 + len;
            if entry_end > file_len {
                tracing::warn!(path = %path.display(), "truncated WAL entry at offset {valid_len}");
                break;
            }
            let mut payload = vec![0u8; len as usize];
            let mut crc_buf = [0u8; 4];
            if !read_entry_part(&mut reader, &mut payload)?
                || !read_entry_part(&mut reader, &mut crc_buf)?
            {
                tracing::warn!(path = %path.display(), "truncated WAL entry at offset {valid_len}");
                break;
            }

            let decoded = if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                Err("checksum mismatch".to_string())
            } else {
                bincode::deserialize::<Commit>(&payload).map_err(|e| format!("undecodable entry: {e}"))
            };
            match decoded {
                Ok(commit) => {
                    commits.push(commit);
                    valid_len = entry_end;
                }
                Err(reason) if entry_end == file_len => {
                    tracing::warn!(path = %path.display(), "torn WAL tail at offset {valid_len}: {reason}");
                    break;
                }
                Err(reason) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "corrupt WAL {} at offset {valid_len}: {reason}, {} bytes follow",
                            path.display(),
                            file_len - entry_end
                        ),
                    ));
                }
            }
        }

        if valid_len < file_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
            tracing::warn!(
                path = %path.display(),
                "truncated WAL from {file_len} to {valid_len} bytes"
            );
        }
        Ok(commits)
    }
}

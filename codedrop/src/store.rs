//! Durable chunk persistence on the receiver.
//!
//! Received chunks are persisted before they are acknowledged, so an
//! acknowledgement is a promise that survives a crash. Each transfer owns a
//! directory below the store root; every drained chunk becomes one file and a
//! JSON sidecar tracks the next expected sequence together with the file
//! descriptor. Sidecar updates go through a temporary file and rename, so a
//! crash never leaves a torn sidecar behind.

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::fs;

use crate::{msg::FileMeta, seq::Seq, session::TransferId};

/// File name of the metadata sidecar.
const META_FILE: &str = "meta.json";

/// Extension of chunk files.
const CHUNK_EXT: &str = "chunk";

/// Per-chunk file prefix: flags (1) + byte offset (8) + saved-at seconds (8).
const CHUNK_PREFIX_LEN: usize = 17;

const FLAG_IS_LAST: u8 = 0b0000_0001;

/// A chunk store operation failed.
#[derive(Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// Filesystem failure.
    Io(io::Error),
    /// A stored record is unreadable.
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "chunk store IO error: {err}"),
            Self::Corrupt(what) => write!(f, "chunk store corrupted: {what}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Corrupt(_) => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// A persisted chunk record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    /// Sequence number.
    pub seq: Seq,
    /// Byte offset within the file.
    pub offset: u64,
    /// Whether this is the last chunk of the file.
    pub is_last: bool,
    /// Decrypted payload.
    pub payload: Bytes,
    /// Unix timestamp of persistence, in seconds.
    pub saved_at: u64,
}

/// Metadata sidecar of a transfer, rewritten after every successful put.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    /// Transfer identifier the directory belongs to.
    pub transfer_id: String,
    /// Next sequence number the receiver expects.
    pub expected_seq: u32,
    /// Descriptor of the file being received.
    pub file: FileMeta,
}

/// Durable chunk store for one transfer.
pub struct ChunkStore {
    dir: PathBuf,
    transfer_id: String,
}

impl fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChunkStore").field("dir", &self.dir).finish()
    }
}

impl ChunkStore {
    /// Opens (creating if necessary) the store directory for a transfer.
    pub async fn open(root: &Path, transfer: &TransferId) -> Result<Self, StoreError> {
        let dir = root.join(transfer.storage_key());
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir, transfer_id: transfer.as_str().to_string() })
    }

    fn chunk_path(&self, seq: Seq) -> PathBuf {
        self.dir.join(format!("{:08x}.{CHUNK_EXT}", u32::from(seq)))
    }

    /// Persists a chunk. Idempotent: rewriting a sequence that already exists
    /// replaces it with identical bytes.
    pub async fn put(
        &self, seq: Seq, offset: u64, is_last: bool, payload: &[u8],
    ) -> Result<(), StoreError> {
        let saved_at = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();

        let mut buf = Vec::with_capacity(CHUNK_PREFIX_LEN + payload.len());
        buf.write_u8(if is_last { FLAG_IS_LAST } else { 0 }).unwrap();
        buf.write_u64::<BE>(offset).unwrap();
        buf.write_u64::<BE>(saved_at).unwrap();
        buf.extend_from_slice(payload);

        let path = self.chunk_path(seq);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &buf).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Reads a single chunk, if present.
    pub async fn chunk(&self, seq: Seq) -> Result<Option<StoredChunk>, StoreError> {
        let path = self.chunk_path(seq);
        let buf = match fs::read(&path).await {
            Ok(buf) => buf,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(Self::parse_chunk(seq, buf)?))
    }

    fn parse_chunk(seq: Seq, buf: Vec<u8>) -> Result<StoredChunk, StoreError> {
        if buf.len() < CHUNK_PREFIX_LEN {
            return Err(StoreError::Corrupt(format!("chunk {seq} shorter than its prefix")));
        }
        let mut reader = &buf[..CHUNK_PREFIX_LEN];
        let flags = reader.read_u8().unwrap();
        let offset = reader.read_u64::<BE>().unwrap();
        let saved_at = reader.read_u64::<BE>().unwrap();
        let payload = Bytes::from(buf).slice(CHUNK_PREFIX_LEN..);
        Ok(StoredChunk { seq, offset, is_last: flags & FLAG_IS_LAST != 0, payload, saved_at })
    }

    /// Sequence numbers currently persisted, in ascending order.
    pub async fn seqs(&self) -> Result<BTreeSet<Seq>, StoreError> {
        let mut seqs = BTreeSet::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(&format!(".{CHUNK_EXT}")) else { continue };
            let Ok(seq) = u32::from_str_radix(stem, 16) else {
                return Err(StoreError::Corrupt(format!("unexpected file {name} in store")));
            };
            seqs.insert(Seq(seq));
        }
        Ok(seqs)
    }

    /// Total payload bytes persisted.
    pub async fn persisted_bytes(&self) -> Result<u64, StoreError> {
        let mut total = 0;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(CHUNK_EXT) {
                continue;
            }
            let len = entry.metadata().await?.len();
            total += len.saturating_sub(CHUNK_PREFIX_LEN as u64);
        }
        Ok(total)
    }

    /// Reads all chunks ordered by sequence number.
    pub async fn all_chunks(&self) -> Result<Vec<StoredChunk>, StoreError> {
        let mut chunks = Vec::new();
        for seq in self.seqs().await? {
            match self.chunk(seq).await? {
                Some(chunk) => chunks.push(chunk),
                None => return Err(StoreError::Corrupt(format!("chunk {seq} vanished"))),
            }
        }
        Ok(chunks)
    }

    /// Writes the metadata sidecar atomically.
    pub async fn save_meta(&self, expected_seq: Seq, file: &FileMeta) -> Result<(), StoreError> {
        let meta = StoreMeta {
            transfer_id: self.transfer_id.clone(),
            expected_seq: expected_seq.into(),
            file: file.clone(),
        };
        let buf = serde_json::to_vec(&meta)
            .map_err(|err| StoreError::Corrupt(format!("sidecar encoding: {err}")))?;
        let path = self.dir.join(META_FILE);
        let tmp = self.dir.join(format!("{META_FILE}.tmp"));
        fs::write(&tmp, &buf).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Reads the metadata sidecar, if the transfer has prior state.
    pub async fn load_meta(&self) -> Result<Option<StoreMeta>, StoreError> {
        let buf = match fs::read(self.dir.join(META_FILE)).await {
            Ok(buf) => buf,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let meta: StoreMeta = serde_json::from_slice(&buf)
            .map_err(|err| StoreError::Corrupt(format!("sidecar decoding: {err}")))?;
        if meta.transfer_id != self.transfer_id {
            return Err(StoreError::Corrupt("sidecar belongs to another transfer".into()));
        }
        Ok(Some(meta))
    }

    /// Removes every record of this transfer.
    pub async fn delete_all(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PairingCode;

    fn test_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("codedrop-store-{tag}-{}", std::process::id()))
    }

    fn transfer() -> TransferId {
        TransferId::new(&PairingCode::parse("AB12cd").unwrap(), "file.bin", 4096)
    }

    fn file_meta() -> FileMeta {
        FileMeta {
            name: "file.bin".into(),
            size: 4096,
            mime: None,
            total_chunks: 4,
            chunk_size: 1024,
            encrypted: true,
        }
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let root = test_root("roundtrip");
        let store = ChunkStore::open(&root, &transfer()).await.unwrap();

        store.put(Seq(0), 0, false, b"first").await.unwrap();
        store.put(Seq(1), 5, true, b"second").await.unwrap();

        let chunk = store.chunk(Seq(1)).await.unwrap().unwrap();
        assert_eq!(chunk.offset, 5);
        assert!(chunk.is_last);
        assert_eq!(&chunk.payload[..], b"second");

        assert_eq!(store.seqs().await.unwrap().len(), 2);
        assert_eq!(store.persisted_bytes().await.unwrap(), 11);

        store.delete_all().await.unwrap();
        let _ = fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let root = test_root("idempotent");
        let store = ChunkStore::open(&root, &transfer()).await.unwrap();

        store.put(Seq(3), 100, false, b"payload").await.unwrap();
        store.put(Seq(3), 100, false, b"payload").await.unwrap();

        let seqs = store.seqs().await.unwrap();
        assert_eq!(seqs.into_iter().collect::<Vec<_>>(), vec![Seq(3)]);
        assert_eq!(store.persisted_bytes().await.unwrap(), 7);

        store.delete_all().await.unwrap();
        let _ = fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn sidecar_survives_reopen() {
        let root = test_root("sidecar");
        let id = transfer();
        {
            let store = ChunkStore::open(&root, &id).await.unwrap();
            store.put(Seq(0), 0, false, &[1u8; 1024]).await.unwrap();
            store.save_meta(Seq(1), &file_meta()).await.unwrap();
        }

        let store = ChunkStore::open(&root, &id).await.unwrap();
        let meta = store.load_meta().await.unwrap().unwrap();
        assert_eq!(meta.expected_seq, 1);
        assert_eq!(meta.file, file_meta());
        assert_eq!(store.persisted_bytes().await.unwrap(), 1024);

        store.delete_all().await.unwrap();
        let _ = fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn delete_all_is_terminal() {
        let root = test_root("delete");
        let store = ChunkStore::open(&root, &transfer()).await.unwrap();
        store.put(Seq(0), 0, true, b"x").await.unwrap();
        store.delete_all().await.unwrap();
        // A second delete of a gone directory is not an error.
        store.delete_all().await.unwrap();
        let _ = fs::remove_dir_all(&root).await;
    }
}

//! Pull-driven file transfer
//!
//! The host announces a file; the machine then pulls chunks by explicit
//! index and finally reports the outcome. Serving a chunk only depends on
//! the requested index, so repeated or out-of-order pulls are answered the
//! same way. The compressed variant serves a deflate stream of the file.

use super::buffer::{PayloadReader, PayloadWriter};
use super::commands::{file, RESULT_OK};
use super::dispatcher::Dispatcher;
use super::packet::CommandTag;
use fablink_core::{ConnectionError, Error, ProtocolError, Result, TransferError};
use flate2::write::DeflateEncoder;
use flate2::Compression;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Default bytes per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 60 * 1024;

/// Hex MD5 of a byte slice
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// How the file is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Raw bytes.
    #[default]
    Direct,
    /// Deflate-compressed bytes; the machine decompresses after the last chunk.
    Compressed,
}

/// Transfer progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    /// Waiting for the machine to pull; `next` is the lowest chunk not yet served.
    AwaitingPull {
        /// Next expected index.
        next: u16,
    },
    /// Building the reply for a pull.
    Serving {
        /// Index being served.
        index: u16,
    },
    /// The machine confirmed the file.
    Completed,
    /// The machine reported a failure.
    Failed {
        /// Human readable reason.
        reason: String,
    },
}

/// A chunk pull from the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    /// Checksum naming the file.
    pub md5: String,
    /// Chunk index.
    pub index: u16,
}

impl ChunkRequest {
    /// Decode a pull request payload
    pub fn from_request(payload: &[u8]) -> std::result::Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            md5: r.string()?,
            index: r.u16()?,
        })
    }

    /// Encode as a pull request payload
    pub fn to_request(&self) -> Vec<u8> {
        PayloadWriter::new().string(&self.md5).u16(self.index).finish()
    }
}

/// Answer to a chunk pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReply {
    /// `0` chunk follows, [`file::RESULT_EOF`] past the end, [`file::RESULT_UNKNOWN_FILE`] wrong file.
    pub result: u8,
    /// Checksum naming the file.
    pub md5: String,
    /// Index the reply is for.
    pub index: u16,
    /// Chunk bytes; empty unless `result` is 0.
    pub data: Vec<u8>,
}

impl ChunkReply {
    /// Encode as an ack payload
    pub fn encode(&self) -> Vec<u8> {
        PayloadWriter::new()
            .u8(self.result)
            .string(&self.md5)
            .u16(self.index)
            .bytes(&self.data)
            .finish()
    }

    /// Decode an ack payload
    pub fn decode(payload: &[u8]) -> std::result::Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            result: r.u8()?,
            md5: r.string()?,
            index: r.u16()?,
            data: r.bytes()?.to_vec(),
        })
    }
}

/// Final report from the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferComplete {
    /// `0` on success.
    pub result: u8,
    /// Checksum of what the machine stored.
    pub md5: String,
}

impl TransferComplete {
    /// Decode a completion request payload
    pub fn from_request(payload: &[u8]) -> std::result::Result<Self, ProtocolError> {
        let mut r = PayloadReader::new(payload);
        Ok(Self {
            result: r.u8()?,
            md5: r.string()?,
        })
    }

    /// Encode as a completion request payload
    pub fn to_request(&self) -> Vec<u8> {
        PayloadWriter::new().u8(self.result).string(&self.md5).finish()
    }
}

/// Progress notification
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    /// File being sent.
    pub filename: String,
    /// Fraction served in 0.0..=1.0.
    pub progress: f64,
    /// The last chunk went out and the machine is decompressing.
    pub decompressing: bool,
}

/// One file prepared for transfer
#[derive(Debug, Clone)]
pub struct FileTransfer {
    filename: String,
    mode: TransferMode,
    raw_len: usize,
    raw_md5: String,
    data: Vec<u8>,
    md5: String,
    chunk_size: usize,
    total_chunks: u16,
    high_water: u16,
    state: TransferState,
}

impl FileTransfer {
    /// Prepare in-memory content
    pub fn new(
        filename: impl Into<String>,
        content: Vec<u8>,
        mode: TransferMode,
        chunk_size: usize,
    ) -> std::result::Result<Self, TransferError> {
        let filename = filename.into();
        let chunk_size = chunk_size.max(1);
        let raw_len = content.len();
        let raw_md5 = md5_hex(&content);

        let data = match mode {
            TransferMode::Direct => content,
            TransferMode::Compressed => deflate(&content).map_err(|e| TransferError::Source {
                filename: filename.clone(),
                reason: format!("compression failed: {}", e),
            })?,
        };

        let total_chunks = u16::try_from(data.len().div_ceil(chunk_size))
            .ok()
            .filter(|_| u32::try_from(raw_len).is_ok())
            .ok_or_else(|| TransferError::TooLarge {
                filename: filename.clone(),
                size: raw_len as u64,
            })?;

        let md5 = match mode {
            TransferMode::Direct => raw_md5.clone(),
            TransferMode::Compressed => md5_hex(&data),
        };

        tracing::debug!(
            "Prepared {} ({} bytes, {} sent in {} chunks)",
            filename,
            raw_len,
            data.len(),
            total_chunks
        );

        Ok(Self {
            filename,
            mode,
            raw_len,
            raw_md5,
            data,
            md5,
            chunk_size,
            total_chunks,
            high_water: 0,
            state: TransferState::AwaitingPull { next: 0 },
        })
    }

    /// Read a file from disk
    pub fn from_path(
        path: &Path,
        mode: TransferMode,
        chunk_size: usize,
    ) -> std::result::Result<Self, TransferError> {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let content = std::fs::read(path).map_err(|e| TransferError::Source {
            filename: filename.clone(),
            reason: e.to_string(),
        })?;
        Self::new(filename, content, mode, chunk_size)
    }

    /// File name announced to the machine
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Transfer mode
    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    /// Checksum of the bytes being served
    pub fn md5(&self) -> &str {
        &self.md5
    }

    /// Checksum of the original file
    pub fn raw_md5(&self) -> &str {
        &self.raw_md5
    }

    /// Number of chunks
    pub fn total_chunks(&self) -> u16 {
        self.total_chunks
    }

    /// Current state
    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// Tag announcing the transfer
    pub fn start_tag(&self) -> CommandTag {
        match self.mode {
            TransferMode::Direct => file::START,
            TransferMode::Compressed => file::START_COMPRESSED,
        }
    }

    /// Tag the machine pulls with
    pub fn pull_tag(&self) -> CommandTag {
        match self.mode {
            TransferMode::Direct => file::PULL_CHUNK,
            TransferMode::Compressed => file::PULL_COMPRESSED_CHUNK,
        }
    }

    /// Payload of the start request
    pub fn start_payload(&self) -> Vec<u8> {
        let w = PayloadWriter::new()
            .string(&self.filename)
            .u32(self.raw_len as u32);
        match self.mode {
            TransferMode::Direct => w.u16(self.total_chunks).string(&self.md5).finish(),
            TransferMode::Compressed => w
                .u32(self.data.len() as u32)
                .u16(self.total_chunks)
                .string(&self.raw_md5)
                .string(&self.md5)
                .finish(),
        }
    }

    /// Bytes of one chunk, or `None` past the end
    pub fn chunk(&self, index: u16) -> Option<&[u8]> {
        if index >= self.total_chunks {
            return None;
        }
        let start = usize::from(index) * self.chunk_size;
        let end = (start + self.chunk_size).min(self.data.len());
        self.data.get(start..end)
    }

    /// Whether `index` is the last chunk
    pub fn is_final_chunk(&self, index: u16) -> bool {
        self.total_chunks > 0 && index == self.total_chunks - 1
    }

    /// Fraction of chunks served
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        f64::from(self.high_water) / f64::from(self.total_chunks)
    }

    /// Answer one pull
    pub fn serve(&mut self, request: &ChunkRequest) -> ChunkReply {
        let index = request.index;
        if request.md5 != self.md5 {
            tracing::warn!("Pull for unknown file {} (serving {})", request.md5, self.md5);
            return self.reply(file::RESULT_UNKNOWN_FILE, index, Vec::new());
        }

        self.state = TransferState::Serving { index };
        let reply = match self.chunk(index) {
            Some(bytes) => {
                let bytes = bytes.to_vec();
                self.high_water = self.high_water.max(index + 1);
                self.reply(RESULT_OK, index, bytes)
            }
            None => {
                tracing::debug!("Pull past the end of {} at {}", self.filename, index);
                self.reply(file::RESULT_EOF, index, Vec::new())
            }
        };
        self.state = TransferState::AwaitingPull {
            next: self.high_water,
        };
        reply
    }

    fn reply(&self, result: u8, index: u16, data: Vec<u8>) -> ChunkReply {
        ChunkReply {
            result,
            md5: self.md5.clone(),
            index,
            data,
        }
    }

    /// Record the machine's final report
    pub fn complete(&mut self, report: &TransferComplete) -> std::result::Result<(), TransferError> {
        if report.result != RESULT_OK {
            let reason = TransferError::describe_result(report.result).to_string();
            self.state = TransferState::Failed {
                reason: reason.clone(),
            };
            return Err(TransferError::Rejected {
                filename: self.filename.clone(),
                reason,
            });
        }
        if report.md5 != self.md5 && report.md5 != self.raw_md5 {
            self.state = TransferState::Failed {
                reason: "checksum mismatch".to_string(),
            };
            return Err(TransferError::ChecksumMismatch {
                filename: self.filename.clone(),
            });
        }
        self.state = TransferState::Completed;
        Ok(())
    }
}

fn deflate(content: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content)?;
    encoder.finish()
}

/// Send a prepared file and wait for the machine's final report
///
/// Registers the pull and completion handlers for the duration of the
/// transfer. A refused start maps the result code to a readable reason.
pub async fn upload<F>(dispatcher: &Dispatcher, transfer: FileTransfer, on_progress: F) -> Result<()>
where
    F: Fn(TransferProgress) + Send + Sync + 'static,
{
    let filename = transfer.filename().to_string();
    let start_tag = transfer.start_tag();
    let pull_tag = transfer.pull_tag();
    let start_payload = transfer.start_payload();
    let compressed = transfer.mode() == TransferMode::Compressed;
    let shared = Arc::new(Mutex::new(transfer));
    let on_progress = Arc::new(on_progress);

    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = Arc::new(Mutex::new(Some(done_tx)));

    {
        let shared = shared.clone();
        let filename = filename.clone();
        dispatcher.set_handler(pull_tag, move |d, packet| {
            let (reply, report) = match ChunkRequest::from_request(&packet.payload) {
                Ok(request) => {
                    let mut transfer = shared.lock();
                    let reply = transfer.serve(&request);
                    let report = (reply.result == RESULT_OK).then(|| TransferProgress {
                        filename: filename.clone(),
                        progress: transfer.progress(),
                        decompressing: compressed && transfer.is_final_chunk(request.index),
                    });
                    (reply, report)
                }
                Err(e) => {
                    tracing::warn!("Malformed chunk pull: {}", e);
                    let reply = ChunkReply {
                        result: file::RESULT_UNKNOWN_FILE,
                        md5: String::new(),
                        index: 0,
                        data: Vec::new(),
                    };
                    (reply, None)
                }
            };
            if let Err(e) = d.ack(&packet, reply.encode()) {
                tracing::warn!("Could not answer chunk pull: {}", e);
            }
            if let Some(report) = report {
                on_progress(report);
            }
        });
    }

    {
        let shared = shared.clone();
        let done_tx = done_tx.clone();
        dispatcher.set_handler(file::COMPLETE, move |d, packet| {
            let _ = d.ack(&packet, vec![RESULT_OK]);
            let outcome = match TransferComplete::from_request(&packet.payload) {
                Ok(report) => shared.lock().complete(&report),
                Err(e) => Err(TransferError::Rejected {
                    filename: shared.lock().filename().to_string(),
                    reason: e.to_string(),
                }),
            };
            if let Some(tx) = done_tx.lock().take() {
                let _ = tx.send(outcome);
            }
        });
    }

    let cleanup = |d: &Dispatcher| {
        d.remove_handler(pull_tag);
        d.remove_handler(file::COMPLETE);
    };

    tracing::info!("Uploading {}", filename);
    if let Err(e) = dispatcher.request(start_tag, start_payload).await {
        cleanup(dispatcher);
        return Err(match e.result_code() {
            Some(code) => TransferError::Rejected {
                filename,
                reason: TransferError::describe_result(code).to_string(),
            }
            .into(),
            None => e,
        });
    }

    let closed = dispatcher.closed();
    let outcome: Result<()> = tokio::select! {
        done = done_rx => match done {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(ConnectionError::closed("transfer abandoned").into()),
        },
        cause = closed => Err(ConnectionError::closed(cause.to_string()).into()),
    };
    cleanup(dispatcher);

    match &outcome {
        Ok(()) => tracing::info!("Upload of {} complete", filename),
        Err(e) => tracing::warn!("Upload of {} failed: {}", filename, e),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::DeflateDecoder;
    use std::io::Read;

    fn pull(transfer: &mut FileTransfer, index: u16) -> ChunkReply {
        let request = ChunkRequest {
            md5: transfer.md5().to_string(),
            index,
        };
        transfer.serve(&request)
    }

    #[test]
    fn test_chunking_and_eof() {
        let content: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let mut transfer = FileTransfer::new("part.gcode", content.clone(), TransferMode::Direct, 100).unwrap();
        assert_eq!(transfer.total_chunks(), 3);

        let mut rebuilt = Vec::new();
        for index in 0..3 {
            let reply = pull(&mut transfer, index);
            assert_eq!(reply.result, RESULT_OK);
            rebuilt.extend(reply.data);
        }
        assert_eq!(rebuilt, content);
        assert_eq!(transfer.progress(), 1.0);

        let eof = pull(&mut transfer, 3);
        assert_eq!(eof.result, file::RESULT_EOF);
        assert!(eof.data.is_empty());
        assert_eq!(transfer.state(), &TransferState::AwaitingPull { next: 3 });
    }

    #[test]
    fn test_out_of_order_pulls_are_stateless() {
        let content = b"0123456789".to_vec();
        let mut transfer = FileTransfer::new("a.nc", content, TransferMode::Direct, 4).unwrap();
        assert_eq!(pull(&mut transfer, 2).data, b"89");
        assert_eq!(pull(&mut transfer, 0).data, b"0123");
        assert_eq!(pull(&mut transfer, 0).data, b"0123");
        assert_eq!(pull(&mut transfer, 1).data, b"4567");
    }

    #[test]
    fn test_pull_for_other_file_is_refused() {
        let mut transfer = FileTransfer::new("a.nc", b"abc".to_vec(), TransferMode::Direct, 4).unwrap();
        let reply = transfer.serve(&ChunkRequest {
            md5: "ffff".to_string(),
            index: 0,
        });
        assert_eq!(reply.result, file::RESULT_UNKNOWN_FILE);
    }

    #[test]
    fn test_compressed_stream_inflates_to_original() {
        let content = "G1 X10 Y10\n".repeat(500).into_bytes();
        let mut transfer =
            FileTransfer::new("big.gcode", content.clone(), TransferMode::Compressed, 64).unwrap();
        assert_eq!(transfer.start_tag(), file::START_COMPRESSED);
        assert_ne!(transfer.md5(), transfer.raw_md5());

        let mut compressed = Vec::new();
        for index in 0..transfer.total_chunks() {
            compressed.extend(pull(&mut transfer, index).data);
        }
        let mut inflated = Vec::new();
        DeflateDecoder::new(compressed.as_slice())
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, content);
    }

    #[test]
    fn test_completion_outcomes() {
        let mut transfer = FileTransfer::new("a.nc", b"abc".to_vec(), TransferMode::Direct, 4).unwrap();
        let md5 = transfer.md5().to_string();

        let err = transfer
            .complete(&TransferComplete {
                result: 2,
                md5: md5.clone(),
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "Transfer of a.nc failed: SD card unavailable");

        assert!(matches!(
            transfer.complete(&TransferComplete {
                result: 0,
                md5: "0".repeat(32),
            }),
            Err(TransferError::ChecksumMismatch { .. })
        ));

        transfer
            .complete(&TransferComplete { result: 0, md5 })
            .unwrap();
        assert_eq!(transfer.state(), &TransferState::Completed);
    }

    #[test]
    fn test_empty_file_has_no_chunks() {
        let mut transfer = FileTransfer::new("empty.gcode", Vec::new(), TransferMode::Direct, 16).unwrap();
        assert_eq!(transfer.total_chunks(), 0);
        assert_eq!(pull(&mut transfer, 0).result, file::RESULT_EOF);
        assert_eq!(transfer.progress(), 1.0);
    }

    #[test]
    fn test_md5_hex() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.gcode");
        std::fs::write(&path, b"G28\nG1 X1\n").unwrap();
        let transfer = FileTransfer::from_path(&path, TransferMode::Direct, 1024).unwrap();
        assert_eq!(transfer.filename(), "cube.gcode");
        assert_eq!(transfer.total_chunks(), 1);

        let missing = FileTransfer::from_path(&dir.path().join("nope"), TransferMode::Direct, 1024);
        assert!(matches!(missing, Err(TransferError::Source { .. })));
    }
}

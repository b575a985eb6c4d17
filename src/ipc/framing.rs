//! DLXS solution frame codec.
//!
//! The solver streams one frame per submitted problem. All integers are
//! big-endian.
//!
//! # Wire Format
//!
//! ```text
//! ┌───────┬─────────┬───────┬──────────────┐
//! │ magic │ version │ flags │ column_count │   header, 12 bytes
//! │ "DLXS"│ u16     │ u16   │ u32          │
//! └───────┴─────────┴───────┴──────────────┘
//! ┌─────────────┬─────────────┬──────────────────┐
//! │ solution_id │ entry_count │ entries          │   row, repeated
//! │ u32         │ u16         │ u32 × entry_count│
//! └─────────────┴─────────────┴──────────────────┘
//! terminator row: solution_id = 0, entry_count = 0, no entries
//! ```
//!
//! The terminator belongs to the frame: [`read_frame`] keeps it as the final
//! element of [`DlxsFrame::rows`], and [`DlxsFrame::encode`] writes it back
//! verbatim.

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::error::ProtocolError;

/// ASCII `DLXS`.
pub const DLXS_MAGIC: [u8; 4] = *b"DLXS";

/// Protocol version emitted by the solver.
pub const DLXS_VERSION: u16 = 1;

/// Fixed header size: magic + version + flags + column count.
pub const HEADER_SIZE: usize = 4 + 2 + 2 + 4;

/// Fixed row header size: solution id + entry count.
pub const ROW_HEADER_SIZE: usize = 4 + 2;

/// Size of one row entry.
pub const ENTRY_SIZE: usize = 4;

/// Frame header preceding the solution rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: [u8; 4],
    pub version: u16,
    /// Reserved for transport metadata; carried through untouched.
    pub flags: u16,
    /// Column count of the exact-cover matrix the rows refer to.
    pub column_count: u32,
}

impl FrameHeader {
    pub fn new(column_count: u32) -> Self {
        Self {
            magic: DLXS_MAGIC,
            version: DLXS_VERSION,
            flags: 0,
            column_count,
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.magic);
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.column_count.to_be_bytes());
    }

    fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            magic: [buf[0], buf[1], buf[2], buf[3]],
            version: u16::from_be_bytes([buf[4], buf[5]]),
            flags: u16::from_be_bytes([buf[6], buf[7]]),
            column_count: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }
}

/// One row of a frame: a solution id and the matrix rows it selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolutionRow {
    pub solution_id: u32,
    pub entries: Vec<u32>,
}

impl SolutionRow {
    pub fn new(solution_id: u32, entries: Vec<u32>) -> Self {
        Self {
            solution_id,
            entries,
        }
    }

    /// The end-of-frame sentinel.
    pub fn terminator() -> Self {
        Self {
            solution_id: 0,
            entries: Vec::new(),
        }
    }

    pub fn is_terminator(&self) -> bool {
        self.solution_id == 0 && self.entries.is_empty()
    }

    fn encoded_len(&self) -> usize {
        ROW_HEADER_SIZE + self.entries.len() * ENTRY_SIZE
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        // Entry count fits in u16: enforced by DlxsFrame construction and decoding.
        let entry_count = self.entries.len() as u16;
        buf.extend_from_slice(&self.solution_id.to_be_bytes());
        buf.extend_from_slice(&entry_count.to_be_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.to_be_bytes());
        }
    }
}

/// A complete, immutable DLXS frame.
///
/// Invariant: `rows` ends with exactly one terminator row and contains no
/// other terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlxsFrame {
    header: FrameHeader,
    rows: Vec<SolutionRow>,
}

impl DlxsFrame {
    /// Build a frame for `column_count` columns; the terminator is appended.
    pub fn new(column_count: u32, solutions: Vec<SolutionRow>) -> Result<Self, ProtocolError> {
        Self::with_header(FrameHeader::new(column_count), solutions)
    }

    /// Build a frame with an explicit header; the terminator is appended.
    pub fn with_header(
        header: FrameHeader,
        mut solutions: Vec<SolutionRow>,
    ) -> Result<Self, ProtocolError> {
        for row in &solutions {
            if row.is_terminator() {
                return Err(ProtocolError::MisplacedTerminator);
            }
            if row.entries.len() > u16::MAX as usize {
                return Err(ProtocolError::RowTooLarge(row.entries.len()));
            }
        }
        solutions.push(SolutionRow::terminator());
        Ok(Self {
            header,
            rows: solutions,
        })
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// All rows, terminator included.
    pub fn rows(&self) -> &[SolutionRow] {
        &self.rows
    }

    /// Solution rows without the terminator.
    pub fn solutions(&self) -> &[SolutionRow] {
        &self.rows[..self.rows.len() - 1]
    }

    /// Size of the frame on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.rows.iter().map(SolutionRow::encoded_len).sum::<usize>()
    }

    /// Serialize to the exact wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.header.encode_into(&mut buf);
        for row in &self.rows {
            row.encode_into(&mut buf);
        }
        buf
    }
}

/// Read exactly `buf.len()` bytes, looping over short reads.
///
/// End-of-stream before the buffer is full is always an error.
async fn read_exact_or_incomplete<R>(
    reader: &mut R,
    buf: &mut [u8],
    context: &'static str,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => {
                return Err(ProtocolError::Incomplete {
                    context,
                    expected: buf.len(),
                    received: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::Io(e)),
        }
    }
    Ok(())
}

/// Decode one frame from `reader`.
///
/// Reads the header and validates the magic before touching any row, then
/// reads rows until the terminator. The terminator is kept in the result.
///
/// # Errors
///
/// - [`ProtocolError::BadMagic`] if the stream does not start with `DLXS`
/// - [`ProtocolError::Incomplete`] if the stream ends mid-frame
/// - [`ProtocolError::Io`] if the underlying read fails
pub async fn read_frame<R>(reader: &mut R) -> Result<DlxsFrame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    read_exact_or_incomplete(reader, &mut header_buf, "frame header").await?;
    let header = FrameHeader::decode(&header_buf);

    if header.magic != DLXS_MAGIC {
        return Err(ProtocolError::BadMagic {
            found: header.magic,
        });
    }
    if header.version != DLXS_VERSION {
        warn!(
            version = header.version,
            expected = DLXS_VERSION,
            "DLXS frame has unexpected version"
        );
    }

    let mut rows = Vec::new();
    loop {
        let mut row_header = [0u8; ROW_HEADER_SIZE];
        read_exact_or_incomplete(reader, &mut row_header, "row header").await?;
        let solution_id =
            u32::from_be_bytes([row_header[0], row_header[1], row_header[2], row_header[3]]);
        let entry_count = u16::from_be_bytes([row_header[4], row_header[5]]) as usize;

        let mut payload = vec![0u8; entry_count * ENTRY_SIZE];
        read_exact_or_incomplete(reader, &mut payload, "row entries").await?;
        let entries = payload
            .chunks_exact(ENTRY_SIZE)
            .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        let row = SolutionRow::new(solution_id, entries);
        let done = row.is_terminator();
        rows.push(row);
        if done {
            break;
        }
    }

    debug!(
        columns = header.column_count,
        solutions = rows.len() - 1,
        "Decoded DLXS frame"
    );

    Ok(DlxsFrame { header, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Reader that hands out at most `chunk` bytes per poll.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Trickle {
        fn new(data: Vec<u8>, chunk: usize) -> Self {
            Self {
                data,
                pos: 0,
                chunk,
            }
        }
    }

    impl AsyncRead for Trickle {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let remaining = self.data.len() - self.pos;
            let n = remaining.min(self.chunk).min(buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    fn sample_frame() -> DlxsFrame {
        DlxsFrame::new(
            324,
            vec![
                SolutionRow::new(1, vec![3, 17, 42, 700]),
                SolutionRow::new(2, vec![5]),
                SolutionRow::new(3, vec![]),
            ],
        )
        .expect("valid frame")
    }

    #[test]
    fn test_encode_layout() {
        let frame = DlxsFrame::new(7, vec![SolutionRow::new(9, vec![0x0102_0304])])
            .expect("valid frame");
        let bytes = frame.encode();
        assert_eq!(
            bytes,
            vec![
                b'D', b'L', b'X', b'S', // magic
                0, 1, // version
                0, 0, // flags
                0, 0, 0, 7, // column count
                0, 0, 0, 9, 0, 1, // row header
                1, 2, 3, 4, // entry
                0, 0, 0, 0, 0, 0, // terminator
            ]
        );
        assert_eq!(bytes.len(), frame.encoded_len());
    }

    #[test]
    fn test_new_appends_single_terminator() {
        let frame = sample_frame();
        assert_eq!(frame.rows().len(), 4);
        assert!(frame.rows().last().unwrap().is_terminator());
        assert_eq!(frame.solutions().len(), 3);
        assert!(frame.solutions().iter().all(|row| !row.is_terminator()));
    }

    #[test]
    fn test_new_rejects_embedded_terminator() {
        let result = DlxsFrame::new(1, vec![SolutionRow::terminator()]);
        assert!(matches!(result, Err(ProtocolError::MisplacedTerminator)));
    }

    #[test]
    fn test_new_rejects_oversized_row() {
        let row = SolutionRow::new(1, vec![0; u16::MAX as usize + 1]);
        let result = DlxsFrame::new(1, vec![row]);
        assert!(matches!(result, Err(ProtocolError::RowTooLarge(65536))));
    }

    #[tokio::test]
    async fn test_decode_roundtrip_keeps_terminator() {
        let frame = sample_frame();
        let bytes = frame.encode();
        let decoded = read_frame(&mut bytes.as_slice()).await.expect("decode");
        assert_eq!(decoded, frame);
        assert!(decoded.rows().last().unwrap().is_terminator());
    }

    #[tokio::test]
    async fn test_decode_empty_frame() {
        let frame = DlxsFrame::new(0, Vec::new()).expect("valid frame");
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + ROW_HEADER_SIZE);
        let decoded = read_frame(&mut bytes.as_slice()).await.expect("decode");
        assert_eq!(decoded.solutions().len(), 0);
        assert_eq!(decoded.rows(), &[SolutionRow::terminator()]);
    }

    #[tokio::test]
    async fn test_decode_handles_partial_reads() {
        let frame = sample_frame();
        for chunk in [1, 2, 5, 7] {
            let mut reader = Trickle::new(frame.encode(), chunk);
            let decoded = read_frame(&mut reader).await.expect("decode");
            assert_eq!(decoded, frame, "chunk size {}", chunk);
        }
    }

    #[tokio::test]
    async fn test_decode_stops_at_terminator() {
        let frame = sample_frame();
        let mut bytes = frame.encode();
        let next = DlxsFrame::new(9, vec![SolutionRow::new(1, vec![1])])
            .expect("valid frame")
            .encode();
        bytes.extend_from_slice(&next);

        let mut reader = bytes.as_slice();
        let first = read_frame(&mut reader).await.expect("first frame");
        assert_eq!(first, frame);
        let second = read_frame(&mut reader).await.expect("second frame");
        assert_eq!(second.header().column_count, 9);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_truncation_at_every_offset_is_incomplete() {
        let bytes = sample_frame().encode();
        for cut in 0..bytes.len() {
            let mut reader = &bytes[..cut];
            let result = read_frame(&mut reader).await;
            assert!(
                matches!(result, Err(ProtocolError::Incomplete { .. })),
                "cut at {} gave {:?}",
                cut,
                result
            );
        }
    }

    #[tokio::test]
    async fn test_bad_magic_rejected_before_rows() {
        // Valid header shape with wrong magic followed by garbage that would
        // otherwise be an incomplete row.
        let mut bytes = vec![b'D', b'L', b'X', b'B', 0, 1, 0, 0, 0, 0, 0, 1];
        bytes.extend_from_slice(&[0xFF, 0xFF]);
        let result = read_frame(&mut bytes.as_slice()).await;
        match result {
            Err(ProtocolError::BadMagic { found }) => assert_eq!(&found, b"DLXB"),
            other => panic!("expected BadMagic, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unexpected_version_is_accepted() {
        let mut header = FrameHeader::new(4);
        header.version = 2;
        header.flags = 0x8001;
        let frame = DlxsFrame::with_header(header, vec![SolutionRow::new(1, vec![2])])
            .expect("valid frame");
        let decoded = read_frame(&mut frame.encode().as_slice())
            .await
            .expect("decode");
        assert_eq!(decoded.header().version, 2);
        assert_eq!(decoded.header().flags, 0x8001);
    }

    #[tokio::test]
    async fn test_nonempty_row_with_zero_id_is_not_terminator() {
        let frame = DlxsFrame::new(2, vec![SolutionRow::new(0, vec![8])]).expect("valid frame");
        let decoded = read_frame(&mut frame.encode().as_slice())
            .await
            .expect("decode");
        assert_eq!(decoded.rows().len(), 2);
        assert_eq!(decoded.solutions()[0].entries, vec![8]);
    }
}

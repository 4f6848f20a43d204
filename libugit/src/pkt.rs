//! Git's length-prefixed wire framing: four ascii hex digits giving the
//! total frame length (header included), then the payload. `0000` is a
//! flush, `0001` a delimiter (protocol v2), `0002` a response end.

use crate::error::{GitError, GitResult};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The largest payload a single pkt-line can carry (65520 total minus the
/// 4-byte header).
pub const MAX_PKT_PAYLOAD: usize = 65516;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    Flush,
    Delim,
    /// end of the underlying stream (or an explicit `0002` response-end)
    End,
}

impl Frame {
    pub fn data(self) -> GitResult<Vec<u8>> {
        match self {
            Frame::Data(bytes) => Ok(bytes),
            frame => bail!("expected pkt-line data, got {:?}", frame),
        }
    }

    /// Payload as text with any single trailing newline stripped, the usual
    /// shape of protocol command lines.
    pub fn text(self) -> GitResult<String> {
        let bytes = self.data()?;
        let mut s = String::from_utf8(bytes)
            .map_err(|_| GitError::corrupt("non-utf8 pkt-line payload"))?;
        if s.ends_with('\n') {
            s.pop();
        }
        Ok(s)
    }

    pub fn is_flush(&self) -> bool {
        matches!(self, Frame::Flush)
    }
}

/// Encodes one data frame into `out`. Payloads beyond [`MAX_PKT_PAYLOAD`]
/// fail rather than splitting silently.
pub fn encode(out: &mut Vec<u8>, payload: &[u8]) -> GitResult<()> {
    ensure!(
        payload.len() <= MAX_PKT_PAYLOAD,
        "pkt-line payload of {} bytes exceeds the maximum of {}",
        payload.len(),
        MAX_PKT_PAYLOAD
    );
    out.extend_from_slice(format!("{:04x}", payload.len() + 4).as_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

pub fn encode_str(out: &mut Vec<u8>, line: &str) -> GitResult<()> {
    encode(out, line.as_bytes())
}

pub fn encode_flush(out: &mut Vec<u8>) {
    out.extend_from_slice(b"0000");
}

pub fn encode_delim(out: &mut Vec<u8>) {
    out.extend_from_slice(b"0001");
}

/// Decodes a single frame from the front of `bytes`, returning the frame and
/// the number of bytes consumed. Used by the synchronous paths and tests.
pub fn decode(bytes: &[u8]) -> GitResult<(Frame, usize)> {
    if bytes.is_empty() {
        return Ok((Frame::End, 0));
    }
    ensure!(bytes.len() >= 4, "truncated pkt-line header");
    let n = parse_len(&bytes[..4])?;
    match n {
        0 => Ok((Frame::Flush, 4)),
        1 => Ok((Frame::Delim, 4)),
        2 => Ok((Frame::End, 4)),
        3 => Err(GitError::corrupt("pkt-line with length 3")),
        n => {
            ensure!(bytes.len() >= n, "truncated pkt-line payload");
            Ok((Frame::Data(bytes[4..n].to_vec()), n))
        }
    }
}

/// Decodes a whole buffer into frames.
pub fn decode_all(mut bytes: &[u8]) -> GitResult<Vec<Frame>> {
    let mut frames = vec![];
    while !bytes.is_empty() {
        let (frame, consumed) = decode(bytes)?;
        bytes = &bytes[consumed..];
        frames.push(frame);
    }
    Ok(frames)
}

fn parse_len(header: &[u8]) -> GitResult<usize> {
    let s = std::str::from_utf8(header)
        .map_err(|_| GitError::corrupt("non-ascii pkt-line length"))?;
    usize::from_str_radix(s, 16).map_err(|_| GitError::corrupt("non-hex pkt-line length"))
}

/// Async pkt-line reader over any buffered stream.
pub struct PktReader<R> {
    reader: R,
}

impl<R: AsyncBufRead + Unpin + Send> PktReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub async fn recv_frame(&mut self) -> GitResult<Frame> {
        let mut header = [0; 4];
        // eof at a frame boundary is a clean end of stream
        let mut filled = 0;
        while filled < 4 {
            let n = self.reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(Frame::End);
                }
                return Err(GitError::corrupt("truncated pkt-line header"));
            }
            filled += n;
        }
        match parse_len(&header)? {
            0 => Ok(Frame::Flush),
            1 => Ok(Frame::Delim),
            2 => Ok(Frame::End),
            3 => Err(GitError::corrupt("pkt-line with length 3")),
            n => {
                let mut payload = vec![0; n - 4];
                self.reader.read_exact(&mut payload).await?;
                Ok(Frame::Data(payload))
            }
        }
    }

    /// Receives data frames until a flush, collecting their payloads.
    pub async fn recv_until_flush(&mut self) -> GitResult<Vec<Vec<u8>>> {
        let mut frames = vec![];
        loop {
            match self.recv_frame().await? {
                Frame::Data(bytes) => frames.push(bytes),
                Frame::Flush | Frame::End => return Ok(frames),
                Frame::Delim => bail!("unexpected delimiter pkt"),
            }
        }
    }
}

impl<R: AsyncBufRead + Unpin + Send> PktReader<R> {
    /// Reads raw bytes (not pkt-framed); used once the stream switches to a
    /// bare pack payload.
    pub async fn read_remaining(&mut self) -> GitResult<Vec<u8>> {
        let mut buf = vec![];
        self.reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

/// Async pkt-line writer.
pub struct PktWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> PktWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub async fn write_data(&mut self, payload: &[u8]) -> GitResult<()> {
        let mut buf = Vec::with_capacity(payload.len() + 4);
        encode(&mut buf, payload)?;
        self.writer.write_all(&buf).await?;
        Ok(())
    }

    pub async fn write_text(&mut self, line: impl AsRef<str>) -> GitResult<()> {
        self.write_data(line.as_ref().as_bytes()).await
    }

    pub async fn write_flush(&mut self) -> GitResult<()> {
        self.writer.write_all(b"0000").await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn write_delim(&mut self) -> GitResult<()> {
        self.writer.write_all(b"0001").await?;
        Ok(())
    }

    /// Writes `payload` on the given side-band channel, splitting into
    /// maximum-size frames as needed (the band byte costs one).
    pub async fn write_band(&mut self, band: u8, payload: &[u8]) -> GitResult<()> {
        for chunk in payload.chunks(MAX_PKT_PAYLOAD - 1) {
            let mut framed = Vec::with_capacity(chunk.len() + 1);
            framed.push(band);
            framed.extend_from_slice(chunk);
            self.write_data(&framed).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> GitResult<()> {
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_and_decode_roundtrip() -> GitResult<()> {
        let mut buf = vec![];
        encode_str(&mut buf, "want deadbeef\n")?;
        encode_flush(&mut buf);
        assert_eq!(&buf[..4], b"0012");

        let (frame, n) = decode(&buf)?;
        assert_eq!(frame, Frame::Data(b"want deadbeef\n".to_vec()));
        let (frame, m) = decode(&buf[n..])?;
        assert_eq!(frame, Frame::Flush);
        assert_eq!(n + m, buf.len());
        Ok(())
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let mut buf = vec![];
        assert!(encode(&mut buf, &vec![0; MAX_PKT_PAYLOAD]).is_ok());
        buf.clear();
        assert!(encode(&mut buf, &vec![0; MAX_PKT_PAYLOAD + 1]).is_err());
    }

    #[test]
    fn decode_sentinels() -> GitResult<()> {
        assert_eq!(decode(b"0000")?.0, Frame::Flush);
        assert_eq!(decode(b"0001")?.0, Frame::Delim);
        assert_eq!(decode(b"0002")?.0, Frame::End);
        assert_eq!(decode(b"")?.0, Frame::End);
        assert!(decode(b"0003").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn async_reader_yields_frames() -> GitResult<()> {
        let mut buf = vec![];
        encode_str(&mut buf, "hello")?;
        encode_delim(&mut buf);
        encode_flush(&mut buf);

        let mut reader = PktReader::new(&buf[..]);
        assert_eq!(reader.recv_frame().await?, Frame::Data(b"hello".to_vec()));
        assert_eq!(reader.recv_frame().await?, Frame::Delim);
        assert_eq!(reader.recv_frame().await?, Frame::Flush);
        assert_eq!(reader.recv_frame().await?, Frame::End);
        Ok(())
    }
}

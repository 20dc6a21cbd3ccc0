use std::io;

use futures_util::StreamExt;
use rexec_protocol::MAX_LINE_BYTES;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bidirectional line-oriented stream handed to every command handler.
///
/// Reads are framed by newlines (`\r\n` is accepted); writes are free-form
/// and flushed immediately so interactive peers see partial lines such as
/// prompts.
pub struct CommandIo {
    lines: FramedRead<BoxedReader, LinesCodec>,
    writer: BoxedWriter,
    eof: bool,
}

impl CommandIo {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            lines: FramedRead::new(
                Box::new(reader) as BoxedReader,
                LinesCodec::new_with_max_length(MAX_LINE_BYTES),
            ),
            writer: Box::new(writer),
            eof: false,
        }
    }

    /// Build from a single duplex object such as a TLS stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }

    /// Next line without its terminator, `None` once the peer is done.
    /// End of stream is sticky. Cancel safe.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        if self.eof {
            return Ok(None);
        }
        match self.lines.next().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(LinesCodecError::Io(err))) => {
                self.eof = true;
                Err(err)
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                self.eof = true;
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line exceeds {MAX_LINE_BYTES} bytes"),
                ))
            }
            None => {
                self.eof = true;
                Ok(None)
            }
        }
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }

    pub async fn write_str(&mut self, text: &str) -> io::Result<()> {
        self.write_all(text.as_bytes()).await
    }

    pub async fn write_line(&mut self, text: &str) -> io::Result<()> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    /// Close the write side; the peer observes end of stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
